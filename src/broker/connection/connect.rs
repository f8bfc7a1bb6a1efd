//! CONNECT packet handling

use std::sync::Arc;

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, error, info};

use super::{rand_id, violation, Connection, ConnectionError, State};
use crate::broker::router::ClientHandle;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolError,
};
use crate::topic::validate_topic_name;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read and process the CONNECT packet
    pub(crate) async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    return match packet {
                        Packet::Connect(connect) => self.handle_connect(*connect).await,
                        _ => {
                            debug!("First packet from {} was not CONNECT", self.addr);
                            Err(violation("first packet must be CONNECT"))
                        }
                    };
                }
                Ok(None) => {}
                Err(DecodeError::InvalidProtocolVersion(level)) => {
                    debug!("Unsupported protocol level {} from {}", level, self.addr);
                    self.refuse(ConnectReturnCode::UnacceptableProtocolVersion)
                        .await?;
                    return Err(DecodeError::InvalidProtocolVersion(level).into());
                }
                Err(e) => return Err(e.into()),
            }

            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before CONNECT",
                )));
            }
        }
    }

    /// Send a refusing CONNACK
    async fn refuse(&mut self, code: ConnectReturnCode) -> Result<(), ConnectionError> {
        self.write_packet(&Packet::ConnAck(ConnAck::new(code)))
            .await
    }

    /// Refuse the connection and end it
    async fn reject(&mut self, code: ConnectReturnCode) -> Result<(), ConnectionError> {
        self.refuse(code).await?;
        Err(ConnectionError::Protocol(ProtocolError::ConnectionRefused(
            code as u8,
        )))
    }

    /// Handle CONNECT packet
    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        // MQTT-3.1.3-8: an empty client id needs a clean session
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!(
                "Rejecting empty client ID without clean session from {}",
                self.addr
            );
            return self.reject(ConnectReturnCode::IdentifierRejected).await;
        }

        if let Some(ref will) = connect.will {
            if let Err(reason) = validate_topic_name(&will.topic) {
                debug!("Invalid will topic from {}: {}", self.addr, reason);
                return Err(violation("invalid will topic"));
            }
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            format!("powerbridge-{:x}", rand_id()).into()
        } else {
            connect.client_id.as_str().into()
        };

        debug!(
            "CONNECT from {} (client_id: {}, {:?})",
            self.addr, client_id, connect.protocol_version
        );

        match self
            .hooks
            .on_authenticate(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!("Authentication failed for {} from {}", client_id, self.addr);
                return self.reject(ConnectReturnCode::NotAuthorized).await;
            }
            Err(e) => {
                error!("Authentication error for {}: {}", client_id, e);
                return self.reject(ConnectReturnCode::ServerUnavailable).await;
            }
        }

        // A takeover replaces an existing entry, so it does not count against the limit
        let is_takeover = self.router.connections.contains_key(&client_id);
        if !is_takeover
            && self.config.max_connections > 0
            && self.router.connections.len() >= self.config.max_connections
        {
            info!(
                "Max connections ({}) reached, rejecting {}",
                self.config.max_connections, client_id
            );
            return self.reject(ConnectReturnCode::ServerUnavailable).await;
        }

        // Sessions are never persisted, so every connection starts clean
        self.router.subscriptions.unsubscribe_all(&client_id);
        let previous = self.router.connections.insert(
            client_id.clone(),
            ClientHandle {
                sender: self.outbound_tx.clone(),
                kick: self.kick.clone(),
                conn_id: self.conn_id,
            },
        );
        if let Some(previous) = previous {
            info!("Client {} reconnected, closing previous connection", client_id);
            previous.kick.cancel();
        }

        self.keep_alive = if connect.keep_alive > 0 {
            connect.keep_alive
        } else {
            self.config.default_keep_alive
        };
        self.state = State::Connected {
            client_id: client_id.clone(),
            will: connect.will,
        };
        if let Some(ref metrics) = self.metrics {
            metrics.client_connected();
        }

        self.write_packet(&Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted)))
            .await?;

        info!(
            "Client {} connected from {} (keep alive {}s)",
            client_id, self.addr, self.keep_alive
        );

        Ok(())
    }
}
