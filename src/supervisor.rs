//! Process supervisor
//!
//! Wires the bridge between the two endpoints, runs both concurrently and
//! returns once both have stopped. The first fatal failure cancels the
//! shared token so the other endpoint shuts down as well.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::auth::AuthProvider;
use crate::bridge::{Bridge, Dispatcher, ReplySink};
use crate::broker::{Broker, BrokerConfig};
use crate::config::Config;
use crate::endpoint::{EndpointError, HttpEndpoint, MqttEndpoint};
use crate::lifecycle::Lifecycle;
use crate::metrics::Metrics;

#[derive(Debug)]
pub enum SupervisorError {
    /// The metrics registry could not be built
    Metrics(prometheus::Error),
    /// An endpoint failed to start or failed while running
    Endpoint {
        endpoint: &'static str,
        source: EndpointError,
    },
    /// An endpoint task panicked
    Join {
        endpoint: &'static str,
        source: JoinError,
    },
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::Metrics(e) => write!(f, "metrics setup failed: {}", e),
            SupervisorError::Endpoint { endpoint, source } => {
                write!(f, "{} endpoint: {}", endpoint, source)
            }
            SupervisorError::Join { endpoint, source } => {
                write!(f, "{} endpoint task failed: {}", endpoint, source)
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Metrics(e) => Some(e),
            SupervisorError::Endpoint { source, .. } => Some(source),
            SupervisorError::Join { source, .. } => Some(source),
        }
    }
}

impl From<prometheus::Error> for SupervisorError {
    fn from(e: prometheus::Error) -> Self {
        SupervisorError::Metrics(e)
    }
}

fn endpoint_error(endpoint: &'static str) -> impl FnOnce(EndpointError) -> SupervisorError {
    move |source| SupervisorError::Endpoint { endpoint, source }
}

/// Both endpoints, bound and ready to run
pub struct Supervisor {
    mqtt: MqttEndpoint,
    http: HttpEndpoint,
    reply_sink: ReplySink,
    dispatcher: Dispatcher,
    mqtt_addr: SocketAddr,
    http_addr: SocketAddr,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Build the bridge and bind both listeners. A bind failure is returned
    /// before anything is served.
    pub async fn bind(config: &Config, cancel: CancellationToken) -> Result<Self, SupervisorError> {
        let metrics = Arc::new(Metrics::new()?);
        let Bridge {
            handle,
            reply_sink,
            dispatcher,
        } = Bridge::new(&config.bridge, cancel.clone(), Some(metrics.clone()));

        let auth = AuthProvider::new(&config.mqtt.auth);
        if auth.is_enabled() {
            info!("MQTT authentication enabled");
        }
        let broker = Broker::with_hooks(BrokerConfig::from(&config.mqtt), Arc::new(auth))
            .with_metrics(metrics.clone());

        let mqtt = MqttEndpoint::bind(
            config.mqtt.bind,
            broker,
            config.bridge.device.as_str(),
            Some(metrics.clone()),
        )
        .await
        .map_err(endpoint_error("mqtt"))?;
        let http = HttpEndpoint::bind(&config.http, handle, Some(metrics))
            .await
            .map_err(endpoint_error("http"))?;

        let mqtt_addr = mqtt
            .local_addr()
            .map_err(|e| endpoint_error("mqtt")(e.into()))?;
        let http_addr = http
            .local_addr()
            .map_err(|e| endpoint_error("http")(e.into()))?;

        Ok(Self {
            mqtt,
            http,
            reply_sink,
            dispatcher,
            mqtt_addr,
            http_addr,
            cancel,
        })
    }

    pub fn mqtt_addr(&self) -> SocketAddr {
        self.mqtt_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn mqtt_lifecycle(&self) -> Lifecycle {
        self.mqtt.lifecycle().clone()
    }

    pub fn http_lifecycle(&self) -> Lifecycle {
        self.http.lifecycle().clone()
    }

    /// Run both endpoints until cancellation or the first fatal failure.
    ///
    /// Returns only after both endpoints have stopped.
    pub async fn run(self) -> Result<(), SupervisorError> {
        let Self {
            mqtt,
            http,
            reply_sink,
            dispatcher,
            mqtt_addr,
            http_addr,
            cancel,
        } = self;

        info!("Bridging HTTP {} to MQTT {}", http_addr, mqtt_addr);

        let mqtt_task = tokio::spawn(mqtt.run(reply_sink, dispatcher, cancel.clone()));
        let http_task = tokio::spawn(http.run(cancel.clone()));

        let (mqtt_result, http_result) = tokio::join!(
            supervise("mqtt", mqtt_task, &cancel),
            supervise("http", http_task, &cancel),
        );

        info!("All endpoints stopped");
        mqtt_result.and(http_result)
    }
}

/// Wait for an endpoint task, cancelling everything if it fails
async fn supervise(
    endpoint: &'static str,
    task: JoinHandle<Result<(), EndpointError>>,
    cancel: &CancellationToken,
) -> Result<(), SupervisorError> {
    let result = match task.await {
        Ok(result) => result.map_err(endpoint_error(endpoint)),
        Err(source) => Err(SupervisorError::Join { endpoint, source }),
    };
    if let Err(ref e) = result {
        error!("{}", e);
        cancel.cancel();
    }
    result
}
