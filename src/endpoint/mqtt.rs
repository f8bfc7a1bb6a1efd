//! MQTT endpoint
//!
//! Serves the embedded broker and drives the command dispatcher alongside
//! it. Two inline subscriptions connect the broker to the rest of the
//! process: the device's LWT topic is logged and tracked as a gauge, and its
//! `STATUS0` replies are handed to the bridge.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{bind, EndpointError};
use crate::bridge::{Dispatcher, ReplySink};
use crate::broker::Broker;
use crate::lifecycle::Lifecycle;
use crate::metrics::Metrics;
use crate::protocol::{Publish, QoS};

/// LWT payload a Tasmota device publishes while connected
const ONLINE: &str = "Online";

pub struct MqttEndpoint {
    broker: Broker,
    listener: TcpListener,
    device: String,
    metrics: Option<Arc<Metrics>>,
}

impl MqttEndpoint {
    /// Bind the broker listener. Nothing is served until [`MqttEndpoint::run`].
    pub async fn bind(
        addr: SocketAddr,
        broker: Broker,
        device: impl Into<String>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, EndpointError> {
        let listener = bind(addr).await?;
        Ok(Self {
            broker,
            listener,
            device: device.into(),
            metrics,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        self.broker.lifecycle()
    }

    /// Serve until `cancel` fires or the dispatcher fails.
    ///
    /// A dispatcher failure cancels `cancel` so that every other component
    /// shuts down too.
    pub async fn run(
        self,
        reply_sink: ReplySink,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Result<(), EndpointError> {
        let Self {
            broker,
            listener,
            device,
            metrics,
        } = self;

        let subscriptions = DeviceSubscriptions::register(&broker, &device, reply_sink, metrics)?;

        let dispatch = async {
            let result = dispatcher.run(&broker).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        };

        let ((), dispatched) = tokio::join!(broker.serve(listener, cancel.clone()), dispatch);

        subscriptions.remove(&broker);
        dispatched.map_err(EndpointError::from)
    }
}

/// Inline subscriptions on the device's LWT and status topics
struct DeviceSubscriptions {
    lwt: u64,
    status: u64,
}

impl DeviceSubscriptions {
    fn register(
        broker: &Broker,
        device: &str,
        reply_sink: ReplySink,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, EndpointError> {
        let lwt = broker
            .subscribe_inline(
                &format!("tele/{}/LWT", device),
                QoS::AtLeastOnce,
                lwt_handler(device.to_string(), metrics),
            )
            .map_err(EndpointError::Subscribe)?;

        let status = broker.subscribe_inline(
            &format!("stat/{}/STATUS0", device),
            QoS::AtLeastOnce,
            move |publish: &Publish| {
                debug!(
                    "Status reply on {} ({} bytes)",
                    publish.topic,
                    publish.payload.len()
                );
                reply_sink.deliver(publish.payload.clone());
            },
        );
        match status {
            Ok(status) => Ok(Self { lwt, status }),
            Err(e) => {
                broker.unsubscribe_inline(lwt);
                Err(EndpointError::Subscribe(e))
            }
        }
    }

    fn remove(self, broker: &Broker) {
        broker.unsubscribe_inline(self.lwt);
        broker.unsubscribe_inline(self.status);
    }
}

fn lwt_handler(
    device: String,
    metrics: Option<Arc<Metrics>>,
) -> impl Fn(&Publish) + Send + Sync + 'static {
    move |publish: &Publish| {
        let status = String::from_utf8_lossy(&publish.payload);
        info!("Device {} is {}", device, status);
        if let Some(ref metrics) = metrics {
            metrics.device_status(status == ONLINE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::broker::BrokerConfig;
    use crate::config::BridgeConfig;
    use crate::lifecycle::State;
    use pretty_assertions::assert_eq;

    fn serving_broker(metrics: &Arc<Metrics>) -> Broker {
        let broker = Broker::new(BrokerConfig::default()).with_metrics(metrics.clone());
        broker.lifecycle().transition(State::Running);
        broker
    }

    fn publish_lwt(broker: &Broker, topic: &str, payload: &'static str) {
        broker
            .publish(topic, payload, QoS::AtLeastOnce, true)
            .unwrap();
    }

    #[tokio::test]
    async fn test_lwt_tracks_device_online() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let broker = serving_broker(&metrics);
        let Bridge { reply_sink, .. } = Bridge::new(
            &BridgeConfig::default(),
            CancellationToken::new(),
            None,
        );

        let subscriptions =
            DeviceSubscriptions::register(&broker, "main", reply_sink, Some(metrics.clone()))
                .unwrap();

        publish_lwt(&broker, "tele/main/LWT", "Online");
        assert_eq!(metrics.device_online.get(), 1);

        // Another device's LWT is ignored
        publish_lwt(&broker, "tele/kitchen/LWT", "Offline");
        assert_eq!(metrics.device_online.get(), 1);

        publish_lwt(&broker, "tele/main/LWT", "Offline");
        assert_eq!(metrics.device_online.get(), 0);

        subscriptions.remove(&broker);
        publish_lwt(&broker, "tele/main/LWT", "Online");
        assert_eq!(metrics.device_online.get(), 0);
    }

    #[tokio::test]
    async fn test_retained_lwt_replayed_on_register() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let broker = serving_broker(&metrics);
        publish_lwt(&broker, "tele/main/LWT", "Online");

        let Bridge { reply_sink, .. } = Bridge::new(
            &BridgeConfig::default(),
            CancellationToken::new(),
            None,
        );
        DeviceSubscriptions::register(&broker, "main", reply_sink, Some(metrics.clone())).unwrap();

        assert_eq!(metrics.device_online.get(), 1);
    }

    #[tokio::test]
    async fn test_status_reply_reaches_waiting_request() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let broker = serving_broker(&metrics);
        let Bridge {
            handle,
            reply_sink,
            dispatcher: _dispatcher,
        } = Bridge::new(
            &BridgeConfig::default(),
            CancellationToken::new(),
            None,
        );
        DeviceSubscriptions::register(&broker, "main", reply_sink, None).unwrap();

        let mut status = tokio_test::task::spawn(handle.status());
        tokio_test::assert_pending!(status.poll());

        broker
            .publish(
                "stat/main/STATUS0",
                r#"{"Status":{"Power":1}}"#,
                QoS::AtLeastOnce,
                false,
            )
            .unwrap();

        let reply = tokio_test::assert_ready_ok!(status.poll());
        assert_eq!(reply["Status"]["Power"], 1);
    }
}
