//! Endpoint lifecycle
//!
//! Each network endpoint moves through `Created -> Running -> Stopping ->
//! Stopped` exactly once. The current state is published on a `watch`
//! channel so the supervisor and tests can observe it.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Endpoint state. Ordered, so `>= Stopping` reads as "shutting down or done".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Created => "created",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Observable state machine for one endpoint
#[derive(Debug, Clone)]
pub struct Lifecycle {
    name: &'static str,
    tx: Arc<watch::Sender<State>>,
}

impl Lifecycle {
    pub fn new(name: &'static str) -> Self {
        let (tx, _) = watch::channel(State::Created);
        Self {
            name,
            tx: Arc::new(tx),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> State {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.tx.subscribe()
    }

    /// Move forward to `to`. Backward or repeated transitions are ignored.
    pub(crate) fn transition(&self, to: State) {
        let moved = self.tx.send_if_modified(|current| {
            if to > *current {
                *current = to;
                true
            } else {
                false
            }
        });
        if moved {
            info!(endpoint = self.name, state = %to, "lifecycle transition");
        }
    }

    /// Wait until the endpoint has reached `state` (or a later one)
    pub async fn wait_for(&self, state: State) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|current| *current >= state).await;
    }
}
