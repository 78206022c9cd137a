//! Response correlation.
//!
//! A request named `X` is answered by a message named `X_Response`. Each
//! in-flight request owns one completion handle keyed by that expected name;
//! the handle is removed from the table when it resolves, so it can fire at
//! most once. Inbound messages with no matching entry are ignored here.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::channel::MessageChannel;
use crate::error::{HarnessError, HarnessResult};
use crate::protocol::{payload_text, response_command, Message, MessageStatus};

type Completion = oneshot::Sender<HarnessResult<Value>>;

pub struct ResponseCorrelator {
    channel: MessageChannel,
    pending: Mutex<HashMap<String, Completion>>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for ResponseCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCorrelator")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ResponseCorrelator {
    pub fn new(channel: MessageChannel, timeout: Option<Duration>) -> Self {
        Self {
            channel,
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Send `command` and wait for its correlated response.
    ///
    /// Resolves with the response `data` on SUCCESS and fails with
    /// [`HarnessError::Operation`] carrying the payload text on ERROR.
    pub async fn send(&self, command: &str, payload: Value) -> HarnessResult<Value> {
        let expected = response_command(command);
        let rx = self.register(command, &expected).await?;

        // The completion is registered before the request leaves, so a worker
        // answering immediately cannot outrun us.
        if let Err(e) = self.channel.send(&Message::request(command, payload)) {
            self.pending.lock().await.remove(&expected);
            return Err(e);
        }

        let outcome = match self.timeout {
            Some(after) => match tokio::time::timeout(after, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().await.remove(&expected);
                    return Err(HarnessError::Timeout {
                        command: command.to_string(),
                        after,
                    });
                }
            },
            None => rx.await,
        };

        outcome.map_err(|_| HarnessError::ChannelClosed)?
    }

    async fn register(
        &self,
        command: &str,
        expected: &str,
    ) -> HarnessResult<oneshot::Receiver<HarnessResult<Value>>> {
        let mut pending = self.pending.lock().await;
        if let Some(existing) = pending.get(expected) {
            // An abandoned caller leaves a closed handle behind; that slot is free.
            if !existing.is_closed() {
                return Err(HarnessError::RequestInFlight(command.to_string()));
            }
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(expected.to_string(), tx);
        Ok(rx)
    }

    /// Offer an inbound message. Returns `true` if it completed a pending request.
    pub async fn resolve(&self, message: &Message) -> bool {
        let completion = self.pending.lock().await.remove(&message.cmd);
        let Some(completion) = completion else {
            trace!(cmd = %message.cmd, "ignoring uncorrelated message");
            return false;
        };

        let outcome = match message.status {
            Some(MessageStatus::Success) => Ok(message.data.clone()),
            Some(MessageStatus::Error) => Err(HarnessError::Operation(payload_text(&message.data))),
            None => Err(HarnessError::ProtocolViolation(format!(
                "'{}' arrived without a status",
                message.cmd
            ))),
        };
        debug!(cmd = %message.cmd, status = ?message.status, "correlated response");

        if completion.send(outcome).is_err() {
            debug!(cmd = %message.cmd, "caller stopped waiting before the response arrived");
        }
        true
    }

    /// Fail every pending request, e.g. after a protocol violation or worker exit.
    pub async fn fail_all(&self, make_error: impl Fn() -> HarnessError) {
        let drained: Vec<(String, Completion)> = self.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            warn!(count = drained.len(), "failing pending requests");
        }
        for (_, completion) in drained {
            let _ = completion.send(Err(make_error()));
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{connect, ConnectOptions, Connection};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, WriteHalf};

    struct FakeWorker {
        lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        out: WriteHalf<DuplexStream>,
    }

    impl FakeWorker {
        async fn next_request(&mut self) -> Message {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn emit(&mut self, value: Value) {
            let mut line = serde_json::to_string(&value).unwrap();
            line.push('\n');
            self.out.write_all(line.as_bytes()).await.unwrap();
        }
    }

    fn session(timeout: Option<Duration>) -> (Connection, FakeWorker) {
        let (controller, worker) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(controller);
        let mut options = ConnectOptions::builtin().unwrap();
        options.timeout = timeout;
        let connection = connect(read_half, write_half, options);
        let (worker_read, worker_write) = tokio::io::split(worker);
        (
            connection,
            FakeWorker {
                lines: BufReader::new(worker_read).lines(),
                out: worker_write,
            },
        )
    }

    #[tokio::test]
    async fn test_success_resolves_with_data() {
        let (connection, mut worker) = session(None);
        let correlator = Arc::clone(&connection.correlator);
        let call = tokio::spawn(async move { correlator.send("plan", json!({"x": 1})).await });

        let request = worker.next_request().await;
        assert_eq!(request.cmd, "plan");
        assert_eq!(request.data, json!({"x": 1}));
        worker
            .emit(json!({"cmd": "plan_Response", "status": "SUCCESS", "data": {"planId": "p"}}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"planId": "p"}));
        assert_eq!(connection.correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_error_rejects_with_payload_text() {
        let (connection, mut worker) = session(None);
        let correlator = Arc::clone(&connection.correlator);
        let call = tokio::spawn(async move { correlator.send("plan", json!({})).await });

        worker.next_request().await;
        worker
            .emit(json!({"cmd": "plan_Response", "status": "ERROR", "data": "Prop D is included"}))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, HarnessError::Operation(_)));
        assert_eq!(err.to_string(), "Prop D is included");
    }

    #[tokio::test]
    async fn test_unrelated_messages_are_ignored_until_true_response() {
        let (connection, mut worker) = session(None);
        let correlator = Arc::clone(&connection.correlator);
        let call = tokio::spawn(async move { correlator.send("apply", json!({"planId": "p"})).await });

        worker.next_request().await;
        for i in 0..10 {
            worker.emit(json!({"cmd": "log", "data": i})).await;
        }
        worker
            .emit(json!({"cmd": "plan_Response", "status": "ERROR", "data": "not for you"}))
            .await;
        worker
            .emit(json!({"cmd": "apply_Response", "status": "SUCCESS", "data": null}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_immediate_response_is_observed() {
        let (connection, mut worker) = session(None);
        let responder = tokio::spawn(async move {
            let request = worker.next_request().await;
            worker
                .emit(json!({"cmd": format!("{}_Response", request.cmd), "status": "SUCCESS", "data": "fast"}))
                .await;
            worker
        });

        let result = connection.correlator.send("initialize", json!({})).await.unwrap();
        assert_eq!(result, json!("fast"));
        let _worker = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_same_named_request_in_flight_is_rejected() {
        let (connection, mut worker) = session(None);
        let correlator = Arc::clone(&connection.correlator);
        let first = tokio::spawn(async move { correlator.send("plan", json!({})).await });
        worker.next_request().await;

        let err = connection.correlator.send("plan", json!({})).await.unwrap_err();
        assert!(matches!(err, HarnessError::RequestInFlight(ref c) if c == "plan"));

        worker
            .emit(json!({"cmd": "plan_Response", "status": "SUCCESS", "data": 1}))
            .await;
        assert_eq!(first.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_invalid_envelope_fails_pending_request() {
        let (connection, mut worker) = session(None);
        let correlator = Arc::clone(&connection.correlator);
        let call = tokio::spawn(async move { correlator.send("plan", json!({})).await });

        worker.next_request().await;
        worker
            .emit(json!({"cmd": "plan_Response", "status": "PERHAPS", "data": {}}))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_timeout_frees_the_slot() {
        let (connection, mut worker) = session(Some(Duration::from_millis(50)));
        let err = connection.correlator.send("plan", json!({})).await.unwrap_err();
        assert!(matches!(err, HarnessError::Timeout { .. }));
        assert_eq!(connection.correlator.pending_count().await, 0);
        worker.next_request().await;
    }

    #[tokio::test]
    async fn test_worker_exit_fails_pending_request() {
        let (connection, mut worker) = session(None);
        let correlator = Arc::clone(&connection.correlator);
        let call = tokio::spawn(async move { correlator.send("plan", json!({})).await });

        worker.next_request().await;
        drop(worker);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, HarnessError::ChannelClosed));
    }
}
