//! Command dispatch loop
//!
//! The single consumer of the command channel. Each command becomes one
//! QoS 1, non-retained publish through a [`CommandPublisher`].

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::Command;
use crate::broker::{Broker, PublishError};
use crate::protocol::QoS;

/// Where dispatched commands are published
pub trait CommandPublisher: Send + Sync {
    fn publish_command(&self, topic: &str, payload: Bytes) -> Result<(), PublishError>;
}

impl CommandPublisher for Broker {
    fn publish_command(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        self.publish(topic, payload, QoS::AtLeastOnce, false)
    }
}

/// A command that could not be published. Ends the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchError {
    pub command: Command,
    pub source: PublishError,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to publish {}: {}", self.command, self.source)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Consumer side of the command channel
pub struct Dispatcher {
    commands: mpsc::Receiver<Command>,
    device: String,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub(super) fn new(
        commands: mpsc::Receiver<Command>,
        device: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            commands,
            device,
            cancel,
        }
    }

    /// Publish commands in arrival order until cancelled or every sender is gone
    pub async fn run<P>(mut self, publisher: &P) -> Result<(), DispatchError>
    where
        P: CommandPublisher + ?Sized,
    {
        loop {
            let command = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            let topic = command.topic(&self.device);
            debug!("Dispatching {} to {}", command, topic);
            if let Err(source) = publisher.publish_command(&topic, command.payload()) {
                // The broker stops serving as part of shutdown
                if self.cancel.is_cancelled() {
                    debug!("Dropping {} during shutdown", command);
                    break;
                }
                error!("Failed to publish {} to {}: {}", command, topic, source);
                return Err(DispatchError { command, source });
            }
        }

        info!("Command dispatcher stopped");
        Ok(())
    }
}
