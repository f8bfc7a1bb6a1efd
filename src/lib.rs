//! powerbridge - HTTP control for an MQTT power switch
//!
//! Embeds an MQTT v3.1.1 broker that a Tasmota-style device connects to, and
//! serves a small HTTP API that turns requests into device commands. Status
//! queries are correlated with the device's asynchronous reply.

pub mod auth;
pub mod bridge;
pub mod broker;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod hooks;
pub mod lifecycle;
pub mod metrics;
pub mod protocol;
pub mod supervisor;
pub mod topic;

pub use auth::AuthProvider;
pub use bridge::{Bridge, BridgeError, BridgeHandle, Command};
pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use hooks::{DefaultHooks, Hooks};
pub use lifecycle::{Lifecycle, State};
pub use metrics::Metrics;
pub use protocol::{ProtocolVersion, QoS};
pub use supervisor::{Supervisor, SupervisorError};
