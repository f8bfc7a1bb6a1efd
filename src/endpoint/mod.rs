//! Network endpoints
//!
//! The MQTT endpoint (embedded broker plus command dispatch) and the HTTP
//! endpoint. Each is bound up front so that a bind failure aborts startup,
//! then run until the shared cancellation token fires.

pub mod http;
pub mod mqtt;

pub use http::HttpEndpoint;
pub use mqtt::MqttEndpoint;

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::bridge::DispatchError;
use crate::broker::PublishError;

/// Endpoint failures. All of them are fatal for the process.
#[derive(Debug)]
pub enum EndpointError {
    /// The listener could not be bound
    Bind { addr: SocketAddr, source: io::Error },
    Io(io::Error),
    /// An inline subscription was refused
    Subscribe(PublishError),
    /// The command dispatcher could not publish
    Dispatch(DispatchError),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::Bind { addr, source } => {
                write!(f, "failed to bind {}: {}", addr, source)
            }
            EndpointError::Io(e) => write!(f, "IO error: {}", e),
            EndpointError::Subscribe(e) => write!(f, "inline subscription failed: {}", e),
            EndpointError::Dispatch(e) => write!(f, "dispatch failed: {}", e),
        }
    }
}

impl std::error::Error for EndpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EndpointError::Bind { source, .. } => Some(source),
            EndpointError::Io(e) => Some(e),
            EndpointError::Subscribe(e) => Some(e),
            EndpointError::Dispatch(e) => Some(e),
        }
    }
}

impl From<io::Error> for EndpointError {
    fn from(e: io::Error) -> Self {
        EndpointError::Io(e)
    }
}

impl From<DispatchError> for EndpointError {
    fn from(e: DispatchError) -> Self {
        EndpointError::Dispatch(e)
    }
}

pub(crate) async fn bind(addr: SocketAddr) -> Result<TcpListener, EndpointError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| EndpointError::Bind { addr, source })
}
