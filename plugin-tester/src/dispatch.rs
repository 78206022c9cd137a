//! Inbound dispatch.
//!
//! A single loop consumes the worker's messages in arrival order. Each one is
//! checked against the envelope schema, then either handed to the privileged
//! relay (`SUDO_REQUEST`) or offered to the correlator. Relay work runs on its
//! own task so a pending request never holds it up, and vice versa.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::channel::{Inbound, MessageChannel};
use crate::config::{HarnessConfig, RelayConfig};
use crate::correlator::ResponseCorrelator;
use crate::error::{HarnessError, HarnessResult};
use crate::protocol::{Message, ProtocolSchemas};
use crate::relay::SudoRelay;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub schemas: ProtocolSchemas,
    pub relay: RelayConfig,
    pub timeout: Option<Duration>,
}

impl ConnectOptions {
    /// Built-in schemas, default relay, no timeout.
    pub fn builtin() -> HarnessResult<Self> {
        Ok(Self {
            schemas: ProtocolSchemas::builtin()?,
            relay: RelayConfig::default(),
            timeout: None,
        })
    }

    pub fn from_config(config: &HarnessConfig, schemas: ProtocolSchemas) -> Self {
        Self {
            schemas,
            relay: config.relay.clone(),
            timeout: config.request_timeout(),
        }
    }
}

/// A live, fully wired connection to a worker.
#[derive(Debug)]
pub struct Connection {
    pub channel: MessageChannel,
    pub correlator: Arc<ResponseCorrelator>,
    pub relay: Arc<SudoRelay>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Close the channel and stop the background tasks.
    pub fn shutdown(&mut self) {
        self.channel.close();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Wire a channel, correlator and relay over `reader`/`writer`.
///
/// The relay is attached before this returns, so no message the worker sends
/// can reach the dispatch loop without a handler in place.
pub fn connect<R, W>(reader: R, writer: W, options: ConnectOptions) -> Connection
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (channel, inbound, mut tasks) = MessageChannel::open(reader, writer);
    let correlator = Arc::new(ResponseCorrelator::new(channel.clone(), options.timeout));
    let relay = Arc::new(SudoRelay::new(
        options.relay,
        channel.clone(),
        Arc::clone(&options.schemas.sudo_request),
    ));

    tasks.push(tokio::spawn(run_dispatch(
        inbound,
        options.schemas,
        Arc::clone(&correlator),
        Arc::clone(&relay),
    )));

    Connection {
        channel,
        correlator,
        relay,
        tasks,
    }
}

async fn run_dispatch(
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    schemas: ProtocolSchemas,
    correlator: Arc<ResponseCorrelator>,
    relay: Arc<SudoRelay>,
) {
    while let Some(item) = inbound.recv().await {
        if let Err(violation) = route(item, &schemas, &correlator, &relay).await {
            let details = match violation {
                HarnessError::ProtocolViolation(details) => details,
                other => other.to_string(),
            };
            error!("Protocol violation from worker: {}", details);
            correlator
                .fail_all(|| HarnessError::ProtocolViolation(details.clone()))
                .await;
        }
    }
    debug!("inbound queue closed, dispatch loop exiting");
    correlator.fail_all(|| HarnessError::ChannelClosed).await;
}

async fn route(
    item: Inbound,
    schemas: &ProtocolSchemas,
    correlator: &ResponseCorrelator,
    relay: &Arc<SudoRelay>,
) -> HarnessResult<()> {
    let value = match item {
        Inbound::Message(value) => value,
        Inbound::Malformed(line) => {
            return Err(HarnessError::ProtocolViolation(format!(
                "worker emitted a non-JSON line: {}",
                line
            )))
        }
    };

    schemas.envelope.validate(&value).into_result("message envelope")?;
    let message: Message = serde_json::from_value(value)
        .map_err(|e| HarnessError::ProtocolViolation(e.to_string()))?;

    if SudoRelay::handles(&message) {
        let request = relay.parse_request(&message.data)?;
        let relay = Arc::clone(relay);
        tokio::spawn(async move {
            if let Err(e) = relay.serve(request).await {
                error!("Failed to deliver sudo result to worker: {}", e);
            }
        });
        return Ok(());
    }

    correlator.resolve(&message).await;
    Ok(())
}
