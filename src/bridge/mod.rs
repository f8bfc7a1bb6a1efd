//! Command/status bridge
//!
//! Connects the HTTP endpoint to the MQTT endpoint through two bounded
//! channels, both of capacity 1:
//!
//! - the command channel, fed by [`BridgeHandle::enqueue`] and drained by the
//!   [`Dispatcher`];
//! - the status-reply channel, fed by [`ReplySink::deliver`] from the status
//!   subscription and drained by [`BridgeHandle::status`].
//!
//! Sends on either channel never wait. A full channel means the request is
//! refused with [`BridgeError::Unavailable`]. Only one status request is
//! serviced at a time; a second concurrent one is refused the same way.

mod command;
mod dispatch;

#[cfg(test)]
mod tests;

pub use command::Command;
pub use dispatch::{CommandPublisher, DispatchError, Dispatcher};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::BridgeConfig;
use crate::metrics::Metrics;

/// Device status as a JSON object, passed through untouched
pub type StatusReply = Map<String, Value>;

/// Why a bridge request failed. The `Display` text is what HTTP callers see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Command channel full or closed, status slot busy, or shutting down
    Unavailable,
    /// No status reply within the configured window
    Timeout,
    /// The reply was not a JSON object
    MalformedReply(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Unavailable => f.write_str("bridge unavailable"),
            BridgeError::Timeout => f.write_str("timeout"),
            BridgeError::MalformedReply(reason) => write!(f, "malformed reply: {}", reason),
        }
    }
}

impl std::error::Error for BridgeError {}

impl BridgeError {
    fn outcome(&self) -> &'static str {
        match self {
            BridgeError::Unavailable => "unavailable",
            BridgeError::Timeout => "timeout",
            BridgeError::MalformedReply(_) => "malformed",
        }
    }
}

/// The three halves of a bridge, handed to the endpoints separately
pub struct Bridge {
    pub handle: BridgeHandle,
    pub reply_sink: ReplySink,
    pub dispatcher: Dispatcher,
}

impl Bridge {
    pub fn new(
        config: &BridgeConfig,
        cancel: CancellationToken,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = mpsc::channel(1);

        Self {
            handle: BridgeHandle {
                commands: command_tx,
                replies: Arc::new(Mutex::new(reply_rx)),
                status_timeout: config.status_timeout,
                cancel: cancel.clone(),
                metrics: metrics.clone(),
            },
            reply_sink: ReplySink {
                replies: reply_tx,
                metrics,
            },
            dispatcher: Dispatcher::new(command_rx, config.device.clone(), cancel),
        }
    }
}

/// HTTP-side handle: enqueue commands and run status round trips
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::Sender<Command>,
    /// The status slot. Holding the lock means owning the in-flight request.
    replies: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    status_timeout: Duration,
    cancel: CancellationToken,
    metrics: Option<Arc<Metrics>>,
}

impl BridgeHandle {
    /// Queue a command for the dispatcher without waiting
    pub fn enqueue(&self, command: Command) -> Result<(), BridgeError> {
        match self.commands.try_send(command) {
            Ok(()) => {
                debug!("Enqueued {}", command);
                if let Some(ref metrics) = self.metrics {
                    metrics.command_enqueued(command.label());
                }
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    TrySendError::Full(_) => "channel full",
                    TrySendError::Closed(_) => "channel closed",
                };
                debug!("Rejected {}: {}", command, reason);
                if let Some(ref metrics) = self.metrics {
                    metrics.command_rejected(command.label());
                }
                Err(BridgeError::Unavailable)
            }
        }
    }

    /// Ask the device for its status and wait for the reply
    pub async fn status(&self) -> Result<StatusReply, BridgeError> {
        let result = self.round_trip().await;
        if let Some(ref metrics) = self.metrics {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.outcome(),
            };
            metrics.status_request(outcome);
        }
        result
    }

    async fn round_trip(&self) -> Result<StatusReply, BridgeError> {
        let Ok(mut replies) = self.replies.try_lock() else {
            debug!("Status request refused, another one is in flight");
            return Err(BridgeError::Unavailable);
        };

        while replies.try_recv().is_ok() {
            debug!("Discarding stale status reply");
        }

        self.enqueue(Command::RequestStatus)?;

        let payload = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(BridgeError::Unavailable),
            reply = tokio::time::timeout(self.status_timeout, replies.recv()) => match reply {
                Ok(Some(payload)) => Ok(payload),
                Ok(None) => Err(BridgeError::Unavailable),
                Err(_) => Err(BridgeError::Timeout),
            },
        };

        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                // A reply racing the deadline must not reach the next caller
                while replies.try_recv().is_ok() {}
                debug!("Status request failed: {}", e);
                return Err(e);
            }
        };

        serde_json::from_slice::<StatusReply>(&payload)
            .map_err(|e| BridgeError::MalformedReply(e.to_string()))
    }
}

/// MQTT-side sink for status replies
#[derive(Clone)]
pub struct ReplySink {
    replies: mpsc::Sender<Bytes>,
    metrics: Option<Arc<Metrics>>,
}

impl ReplySink {
    /// Hand a reply to the waiting status request, dropping it if one is already queued
    pub fn deliver(&self, payload: Bytes) -> bool {
        match self.replies.try_send(payload) {
            Ok(()) => true,
            Err(e) => {
                match e {
                    TrySendError::Full(_) => debug!("Status reply channel full, dropping reply"),
                    TrySendError::Closed(_) => debug!("Status reply channel closed, dropping reply"),
                }
                if let Some(ref metrics) = self.metrics {
                    metrics.status_reply_dropped();
                }
                false
            }
        }
    }
}
