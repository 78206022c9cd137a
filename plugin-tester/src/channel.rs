//! Message channel to the worker.
//!
//! Newline-delimited JSON over a byte stream pair. A writer task drains an
//! ordered outbound queue into the worker's stdin; a reader task decodes the
//! worker's stdout and hands every line to a single inbound queue, so both
//! directions keep their order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::error::{HarnessError, HarnessResult};
use crate::protocol::Message;

/// One item read from the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A decoded JSON document, not yet checked against the envelope schema
    Message(Value),
    /// A line that is not JSON
    Malformed(String),
}

/// Sending half of the channel. Cheap to clone; all clones share one queue.
#[derive(Debug, Clone)]
pub struct MessageChannel {
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

impl MessageChannel {
    /// Start the reader and writer tasks over `reader`/`writer`.
    ///
    /// Returns the channel plus the inbound queue; the queue ends when the
    /// worker closes its output.
    pub fn open<R, W>(
        reader: R,
        writer: W,
    ) -> (Self, mpsc::UnboundedReceiver<Inbound>, Vec<JoinHandle<()>>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let closed = Arc::new(AtomicBool::new(false));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer_task = Self::start_writer_task(writer, outbound_rx, Arc::clone(&closed));
        let reader_task = Self::start_reader_task(reader, inbound_tx, Arc::clone(&closed));

        (
            Self {
                outbound: outbound_tx,
                closed,
            },
            inbound_rx,
            vec![writer_task, reader_task],
        )
    }

    /// Queue `message` for delivery. Fails once the channel is closed.
    pub fn send(&self, message: &Message) -> HarnessResult<()> {
        if self.is_closed() {
            return Err(HarnessError::ChannelClosed);
        }
        let line = serde_json::to_string(message)?;
        debug!(cmd = %message.cmd, status = ?message.status, "sending message to worker");
        self.outbound
            .send(line)
            .map_err(|_| HarnessError::ChannelClosed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn start_writer_task<W: AsyncWrite + Unpin + Send + 'static>(
        mut writer: W,
        mut rx: mpsc::UnboundedReceiver<String>,
        closed: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                let written = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    error!("Failed to write to worker: {}", e);
                    closed.store(true, Ordering::SeqCst);
                    break;
                }
            }
            trace!("worker writer task exiting");
        })
    }

    fn start_reader_task<R: AsyncRead + Unpin + Send + 'static>(
        reader: R,
        tx: mpsc::UnboundedSender<Inbound>,
        closed: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let item = match serde_json::from_str::<Value>(line) {
                            Ok(value) => Inbound::Message(value),
                            Err(_) => Inbound::Malformed(line.to_string()),
                        };
                        if tx.send(item).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("worker output reached EOF");
                        break;
                    }
                    Err(e) => {
                        error!("Error reading worker output: {}", e);
                        break;
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_messages_arrive_in_send_order() {
        let (controller, worker) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(controller);
        let (channel, _inbound, _tasks) = MessageChannel::open(read_half, write_half);

        for i in 0..3 {
            channel
                .send(&Message::request("plan", json!({ "n": i })))
                .unwrap();
        }

        let mut lines = BufReader::new(worker).lines();
        for i in 0..3 {
            let line = lines.next_line().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["data"]["n"], json!(i));
        }
    }

    #[tokio::test]
    async fn test_inbound_lines_are_decoded_or_flagged() {
        let (controller, mut worker) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(controller);
        let (_channel, mut inbound, _tasks) = MessageChannel::open(read_half, write_half);

        worker
            .write_all(b"{\"cmd\":\"log\",\"data\":1}\n\nnot json\n")
            .await
            .unwrap();

        assert_eq!(
            inbound.recv().await,
            Some(Inbound::Message(json!({"cmd": "log", "data": 1})))
        );
        assert_eq!(
            inbound.recv().await,
            Some(Inbound::Malformed("not json".to_string()))
        );
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (controller, _worker) = duplex(64);
        let (read_half, write_half) = tokio::io::split(controller);
        let (channel, _inbound, _tasks) = MessageChannel::open(read_half, write_half);

        channel.close();
        let err = channel
            .send(&Message::request("initialize", json!({})))
            .unwrap_err();
        assert!(matches!(err, HarnessError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_eof_closes_channel_and_ends_inbound() {
        let (controller, worker) = duplex(64);
        let (read_half, write_half) = tokio::io::split(controller);
        let (channel, mut inbound, _tasks) = MessageChannel::open(read_half, write_half);

        drop(worker);
        assert_eq!(inbound.recv().await, None);
        assert!(channel.is_closed());
    }
}
