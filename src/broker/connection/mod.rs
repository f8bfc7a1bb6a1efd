//! MQTT Connection Handler
//!
//! Handles individual client connections, packet processing,
//! and the protocol state machine.

mod connect;
mod disconnect;
mod publish;
mod subscribe;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConfig, MessageRouter};
use crate::codec::{Decoder, Encoder};
use crate::hooks::Hooks;
use crate::metrics::Metrics;
use crate::protocol::{DecodeError, EncodeError, Packet, ProtocolError, Will};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Protocol(e.into())
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

fn violation(msg: &'static str) -> ConnectionError {
    ConnectionError::Protocol(ProtocolError::ProtocolViolation(msg))
}

/// Connection state
pub(crate) enum State {
    /// Waiting for CONNECT packet
    Connecting,
    /// CONNACK sent
    Connected {
        client_id: Arc<str>,
        will: Option<Will>,
    },
}

/// How a connected session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    /// Client sent DISCONNECT
    Disconnected,
    /// Socket closed, keep-alive expired or protocol error
    Dropped,
    /// Another connection claimed the client id
    TakenOver,
    /// Broker shutting down
    Shutdown,
}

impl Exit {
    fn publishes_will(self) -> bool {
        matches!(self, Exit::Dropped)
    }
}

/// Connection handler - generic over the stream type
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) router: Arc<MessageRouter>,
    pub(crate) config: BrokerConfig,
    pub(crate) hooks: Arc<dyn Hooks>,
    pub(crate) metrics: Option<Arc<Metrics>>,
    pub(crate) shutdown: CancellationToken,
    /// Child of `shutdown`, cancelled alone on client id takeover
    pub(crate) kick: CancellationToken,
    pub(crate) conn_id: u64,
    pub(crate) outbound_tx: mpsc::Sender<Packet>,
    pub(crate) outbound_rx: mpsc::Receiver<Packet>,
    /// Keep alive in seconds after CONNECT (0 = disabled)
    pub(crate) keep_alive: u16,
    pub(crate) next_packet_id: u16,
    /// Outbound QoS 1 packet ids awaiting PUBACK
    pub(crate) inflight: HashSet<u16>,
    /// Inbound QoS 2 packet ids awaiting PUBREL
    pub(crate) awaiting_rel: HashSet<u16>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: S,
        addr: SocketAddr,
        router: Arc<MessageRouter>,
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        metrics: Option<Arc<Metrics>>,
        shutdown: CancellationToken,
        conn_id: u64,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_channel_capacity.max(1));
        let kick = shutdown.child_token();
        Self {
            stream,
            addr,
            state: State::Connecting,
            decoder: Decoder::new().with_max_packet_size(config.max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            router,
            config,
            hooks,
            metrics,
            shutdown,
            kick,
            conn_id,
            outbound_tx,
            outbound_rx,
            keep_alive: 0,
            next_packet_id: 1,
            inflight: HashSet::new(),
            awaiting_rel: HashSet::new(),
        }
    }

    /// Run the connection handler until the client goes away or the broker shuts down
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let shutdown = self.shutdown.clone();
        let connect_timeout = self.config.connect_timeout;

        let connected = tokio::select! {
            biased;

            _ = shutdown.cancelled() => Err(ConnectionError::Shutdown),
            result = timeout(connect_timeout, self.read_connect()) => match result {
                Ok(result) => result,
                Err(_) => {
                    debug!("Connect timeout from {}", self.addr);
                    Err(ConnectionError::Timeout)
                }
            },
        };

        if let Err(e) = connected {
            // Registered but the CONNACK never made it out
            if self.client_id().is_some() {
                self.handle_disconnect(Exit::Dropped);
            }
            return Err(e);
        }

        let result = self.run_connected().await;
        let exit = match &result {
            Ok(exit) => *exit,
            Err(_) => Exit::Dropped,
        };
        self.handle_disconnect(exit);
        result.map(|_| ())
    }

    /// Run the main connection loop
    async fn run_connected(&mut self) -> Result<Exit, ConnectionError> {
        let shutdown = self.shutdown.clone();
        let kick = self.kick.clone();

        // 1.5x keep alive, measured from the last inbound packet
        let keep_alive = (self.keep_alive > 0)
            .then(|| Duration::from_millis(self.keep_alive as u64 * 1500));
        let mut keep_alive_deadline = keep_alive.map(|d| Instant::now() + d);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Closing {} for broker shutdown", self.addr);
                    return Ok(Exit::Shutdown);
                }

                _ = kick.cancelled() => {
                    info!("Client on {} taken over by a new connection", self.addr);
                    return Ok(Exit::TakenOver);
                }

                result = self.stream.read_buf(&mut self.read_buf) => {
                    if result? == 0 {
                        debug!("Connection closed from {}", self.addr);
                        return Ok(Exit::Dropped);
                    }
                    while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                        self.read_buf.advance(consumed);
                        keep_alive_deadline = keep_alive.map(|d| Instant::now() + d);
                        if let Some(exit) = self.handle_packet(packet).await? {
                            return Ok(exit);
                        }
                    }
                }

                Some(packet) = self.outbound_rx.recv() => {
                    match packet {
                        Packet::Publish(publish) => self.send_publish(publish).await?,
                        other => self.write_packet(&other).await?,
                    }
                }

                _ = async {
                    match keep_alive_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    info!("Keep alive timeout for {} - disconnecting", self.addr);
                    return Ok(Exit::Dropped);
                }
            }
        }
    }

    /// Handle an incoming packet. `Some(exit)` ends the session.
    async fn handle_packet(&mut self, packet: Packet) -> Result<Option<Exit>, ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(violation("duplicate CONNECT")),
            Packet::Publish(publish) => {
                self.handle_publish(publish).await?;
                Ok(None)
            }
            Packet::PubAck(puback) => {
                if !self.inflight.remove(&puback.packet_id) {
                    debug!("PUBACK for unknown packet id {}", puback.packet_id);
                }
                Ok(None)
            }
            Packet::PubRel(pubrel) => {
                self.handle_pubrel(pubrel).await?;
                Ok(None)
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(subscribe).await?;
                Ok(None)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(unsubscribe).await?;
                Ok(None)
            }
            Packet::PingReq => {
                self.write_packet(&Packet::PingResp).await?;
                Ok(None)
            }
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", self.addr);
                Ok(Some(Exit::Disconnected))
            }
            Packet::PubRec(_) | Packet::PubComp(_) => {
                // Outbound delivery never exceeds QoS 1
                warn!(
                    "Unexpected packet type from {}: {}",
                    self.addr,
                    packet.packet_type()
                );
                Ok(None)
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(violation("server-to-client packet sent by client"))
            }
        }
    }

    /// Encode and write a single packet
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Client id once connected
    pub(crate) fn client_id(&self) -> Option<&Arc<str>> {
        match &self.state {
            State::Connected { client_id, .. } => Some(client_id),
            State::Connecting => None,
        }
    }
}

/// Generate a random ID
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    RandomState::new().build_hasher().finish()
}
