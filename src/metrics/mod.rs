//! Prometheus metrics for powerbridge
//!
//! Exposed by the HTTP endpoint at `/metrics`.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// All powerbridge metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Bridge metrics
    pub commands_enqueued_total: IntCounterVec,
    pub commands_rejected_total: IntCounterVec,
    pub status_requests_total: IntCounterVec,
    pub status_replies_dropped_total: IntCounter,
    pub device_online: IntGauge,

    // Broker metrics
    pub connections_current: IntGauge,
    pub connections_total: IntCounter,
    pub publish_messages_received: IntCounter,
    pub publish_messages_sent: IntCounter,
    pub publish_messages_dropped: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let commands_enqueued_total = IntCounterVec::new(
            Opts::new(
                "powerbridge_commands_enqueued_total",
                "Commands accepted onto the command channel",
            ),
            &["command"],
        )?;

        let commands_rejected_total = IntCounterVec::new(
            Opts::new(
                "powerbridge_commands_rejected_total",
                "Commands rejected because the command channel was full or closed",
            ),
            &["command"],
        )?;

        let status_requests_total = IntCounterVec::new(
            Opts::new(
                "powerbridge_status_requests_total",
                "Status round trips by outcome",
            ),
            &["outcome"],
        )?;

        let status_replies_dropped_total = IntCounter::with_opts(Opts::new(
            "powerbridge_status_replies_dropped_total",
            "Status replies dropped because no request was waiting",
        ))?;

        let device_online = IntGauge::with_opts(Opts::new(
            "powerbridge_device_online",
            "1 while the device's last LWT payload was Online",
        ))?;

        let connections_current = IntGauge::with_opts(Opts::new(
            "powerbridge_mqtt_connections_current",
            "Current number of connected MQTT clients",
        ))?;

        let connections_total = IntCounter::with_opts(Opts::new(
            "powerbridge_mqtt_connections_total",
            "Total number of MQTT client connections since startup",
        ))?;

        let publish_messages_received = IntCounter::with_opts(Opts::new(
            "powerbridge_mqtt_publish_received_total",
            "Total PUBLISH packets received from clients",
        ))?;

        let publish_messages_sent = IntCounter::with_opts(Opts::new(
            "powerbridge_mqtt_publish_sent_total",
            "Total PUBLISH packets written to clients",
        ))?;

        let publish_messages_dropped = IntCounter::with_opts(Opts::new(
            "powerbridge_mqtt_publish_dropped_total",
            "Total PUBLISH messages dropped due to outbound queue overflow",
        ))?;

        registry.register(Box::new(commands_enqueued_total.clone()))?;
        registry.register(Box::new(commands_rejected_total.clone()))?;
        registry.register(Box::new(status_requests_total.clone()))?;
        registry.register(Box::new(status_replies_dropped_total.clone()))?;
        registry.register(Box::new(device_online.clone()))?;
        registry.register(Box::new(connections_current.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(publish_messages_received.clone()))?;
        registry.register(Box::new(publish_messages_sent.clone()))?;
        registry.register(Box::new(publish_messages_dropped.clone()))?;

        Ok(Self {
            registry,
            commands_enqueued_total,
            commands_rejected_total,
            status_requests_total,
            status_replies_dropped_total,
            device_online,
            connections_current,
            connections_total,
            publish_messages_received,
            publish_messages_sent,
            publish_messages_dropped,
        })
    }

    pub fn command_enqueued(&self, command: &str) {
        self.commands_enqueued_total
            .with_label_values(&[command])
            .inc();
    }

    pub fn command_rejected(&self, command: &str) {
        self.commands_rejected_total
            .with_label_values(&[command])
            .inc();
    }

    pub fn status_request(&self, outcome: &str) {
        self.status_requests_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn status_reply_dropped(&self) {
        self.status_replies_dropped_total.inc();
    }

    pub fn device_status(&self, online: bool) {
        self.device_online.set(i64::from(online));
    }

    pub fn client_connected(&self) {
        self.connections_total.inc();
        self.connections_current.inc();
    }

    pub fn client_disconnected(&self) {
        self.connections_current.dec();
    }

    pub fn publish_received(&self) {
        self.publish_messages_received.inc();
    }

    pub fn publish_sent(&self) {
        self.publish_messages_sent.inc();
    }

    pub fn publish_dropped(&self) {
        self.publish_messages_dropped.inc();
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn render(&self) -> Result<(String, String), prometheus::Error> {
        let encoder = TextEncoder::new();
        let body = encoder.encode_to_string(&self.registry.gather())?;
        Ok((body, prometheus::Encoder::format_type(&encoder).to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.connections_current.get(), 0);
        assert_eq!(metrics.connections_total.get(), 0);
    }

    #[test]
    fn test_client_connect_disconnect() {
        let metrics = Metrics::new().unwrap();

        metrics.client_connected();
        metrics.client_connected();
        assert_eq!(metrics.connections_current.get(), 2);
        assert_eq!(metrics.connections_total.get(), 2);

        metrics.client_disconnected();
        assert_eq!(metrics.connections_current.get(), 1);
        assert_eq!(metrics.connections_total.get(), 2);
    }

    #[test]
    fn test_command_counters_by_label() {
        let metrics = Metrics::new().unwrap();

        metrics.command_enqueued("PowerOn");
        metrics.command_enqueued("PowerOn");
        metrics.command_rejected("PowerOff");
        metrics.status_request("timeout");

        assert_eq!(
            metrics
                .commands_enqueued_total
                .with_label_values(&["PowerOn"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .commands_rejected_total
                .with_label_values(&["PowerOff"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .status_requests_total
                .with_label_values(&["timeout"])
                .get(),
            1
        );
    }

    #[test]
    fn test_render_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.publish_received();
        metrics.status_reply_dropped();

        let (body, content_type) = metrics.render().unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("powerbridge_mqtt_publish_received_total 1"));
        assert!(body.contains("powerbridge_status_replies_dropped_total 1"));
    }
}
