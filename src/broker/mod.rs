//! MQTT Broker Core
//!
//! The embedded broker the device connects to. Besides serving MQTT v3.1.1
//! clients over TCP it acts as an in-process client: [`Broker::publish`]
//! routes a message as if a client had sent it, and
//! [`Broker::subscribe_inline`] registers a callback for a topic filter.

mod connection;
mod router;

pub use connection::{Connection, ConnectionError};
pub use router::{InlineHandler, MessageRouter};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::MqttConfig;
use crate::hooks::{DefaultHooks, Hooks};
use crate::lifecycle::{Lifecycle, State};
use crate::metrics::Metrics;
use crate::protocol::{Publish, QoS};
use crate::topic::{validate_topic_filter, validate_topic_name};

/// Pause after a failed accept so descriptor exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum connected clients (0 = unbounded)
    pub max_connections: usize,
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Keep alive applied when the client announces 0 (0 = none)
    pub default_keep_alive: u16,
    /// Time allowed for the CONNECT packet to arrive
    pub connect_timeout: Duration,
    /// Per-client outbound queue capacity
    pub outbound_channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from(&MqttConfig::default())
    }
}

impl From<&MqttConfig> for BrokerConfig {
    fn from(config: &MqttConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_packet_size: config.max_packet_size,
            default_keep_alive: config.default_keep_alive,
            connect_timeout: config.connect_timeout,
            outbound_channel_capacity: config.outbound_channel_capacity,
        }
    }
}

/// Errors from the in-process client API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The broker is not in the `Running` state
    NotServing,
    /// Topic name or filter failed validation
    InvalidTopic(&'static str),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NotServing => write!(f, "broker is not serving"),
            PublishError::InvalidTopic(reason) => write!(f, "invalid topic: {}", reason),
        }
    }
}

impl std::error::Error for PublishError {}

/// The MQTT Broker
#[derive(Clone)]
pub struct Broker {
    config: BrokerConfig,
    router: Arc<MessageRouter>,
    hooks: Arc<dyn Hooks>,
    metrics: Option<Arc<Metrics>>,
    lifecycle: Lifecycle,
    next_conn_id: Arc<AtomicU64>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        Self {
            config,
            router: Arc::new(MessageRouter::new(None)),
            hooks,
            metrics: None,
            lifecycle: Lifecycle::new("mqtt"),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attach metrics. Call before the broker is shared.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.router = Arc::new(MessageRouter::new(Some(metrics.clone())));
        self.metrics = Some(metrics);
        self
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Accept clients until `shutdown` fires, then close every connection.
    ///
    /// Returns once all connection tasks have finished; the broker is then
    /// `Stopped` and the listener has been dropped.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        self.lifecycle.transition(State::Running);
        if let Ok(addr) = listener.local_addr() {
            info!("MQTT/TCP listening on {}", addr);
        }

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        self.handle_connection(stream, addr, &tracker, &shutdown);
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        self.lifecycle.transition(State::Stopping);
        drop(listener);
        tracker.close();
        debug!("Waiting for {} MQTT connection task(s)", tracker.len());
        tracker.wait().await;
        self.lifecycle.transition(State::Stopped);
    }

    /// Handle a new connection
    fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        tracker: &TaskTracker,
        shutdown: &CancellationToken,
    ) {
        let _ = stream.set_nodelay(true);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = Connection::new(
            stream,
            addr,
            self.router.clone(),
            self.config.clone(),
            self.hooks.clone(),
            self.metrics.clone(),
            shutdown.clone(),
            conn_id,
        );

        tracker.spawn(async move {
            if let Err(e) = conn.run().await {
                debug!("Connection from {} ended: {}", addr, e);
            }
        });
    }

    /// Publish a message from inside the process.
    ///
    /// The message is routed exactly like a client PUBLISH: retained if
    /// asked, delivered to matching clients and inline subscribers.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError> {
        if self.lifecycle.state() != State::Running {
            return Err(PublishError::NotServing);
        }
        validate_topic_name(topic).map_err(PublishError::InvalidTopic)?;

        let mut publish = Publish::new(topic, payload, qos);
        publish.retain = retain;
        self.router.route(&publish);
        Ok(())
    }

    /// Register an in-process subscription.
    ///
    /// Matching retained messages are handed to `handler` before this
    /// returns. The returned id can be passed to [`Broker::unsubscribe_inline`].
    pub fn subscribe_inline<H: InlineHandler>(
        &self,
        filter: &str,
        qos: QoS,
        handler: H,
    ) -> Result<u64, PublishError> {
        validate_topic_filter(filter).map_err(PublishError::InvalidTopic)?;
        let id = self.router.add_inline(filter, qos, Arc::new(handler));
        debug!("Inline subscription {} on {}", id, filter);
        Ok(id)
    }

    pub fn unsubscribe_inline(&self, id: u64) -> bool {
        self.router.remove_inline(id)
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.router.connection_count()
    }

    /// Get retained message count
    pub fn retained_count(&self) -> usize {
        self.router.retained_count()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
