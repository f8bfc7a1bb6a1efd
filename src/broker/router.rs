//! Message Router
//!
//! Fans publishes out to connected clients and inline subscribers, and keeps
//! the retained message store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::metrics::Metrics;
use crate::protocol::{Packet, Publish, QoS};
use crate::topic::{topic_matches_filter, SubscriptionStore};

/// Callback for in-process subscriptions.
///
/// Invoked synchronously on the task that routed the message, so
/// implementations must not block.
pub trait InlineHandler: Send + Sync + 'static {
    fn handle(&self, publish: &Publish);
}

impl<F> InlineHandler for F
where
    F: Fn(&Publish) + Send + Sync + 'static,
{
    fn handle(&self, publish: &Publish) {
        self(publish)
    }
}

struct InlineSubscription {
    id: u64,
    filter: String,
    qos: QoS,
    handler: Arc<dyn InlineHandler>,
}

/// Registry entry for a connected client
pub(crate) struct ClientHandle {
    pub(crate) sender: mpsc::Sender<Packet>,
    /// Cancelled when another connection takes over the client id
    pub(crate) kick: CancellationToken,
    pub(crate) conn_id: u64,
}

/// Message router for distributing messages to subscribers
pub struct MessageRouter {
    pub(crate) subscriptions: SubscriptionStore,
    pub(crate) connections: DashMap<Arc<str>, ClientHandle>,
    retained: DashMap<String, Publish>,
    inline: RwLock<Vec<InlineSubscription>>,
    next_inline_id: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl MessageRouter {
    pub fn new(metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            subscriptions: SubscriptionStore::new(),
            connections: DashMap::new(),
            retained: DashMap::new(),
            inline: RwLock::new(Vec::new()),
            next_inline_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Store or clear the retained message and deliver to every subscriber
    pub fn route(&self, publish: &Publish) {
        if publish.retain {
            self.store_retained(publish);
        }

        for sub in self.subscriptions.matches(&publish.topic) {
            let Some(client) = self.connections.get(&sub.client_id) else {
                continue;
            };

            // Live deliveries never carry the retain flag
            let mut outbound = publish.clone();
            outbound.qos = publish.qos.min(sub.qos);
            outbound.retain = false;
            outbound.dup = false;
            outbound.packet_id = None;

            match client.sender.try_send(Packet::Publish(outbound)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Outbound queue full for {}, dropping message on {}",
                        sub.client_id, publish.topic
                    );
                    if let Some(ref metrics) = self.metrics {
                        metrics.publish_dropped();
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Client {} is going away, skipping delivery", sub.client_id);
                }
            }
        }

        // Clone the handlers out so a callback may register further inline
        // subscriptions without deadlocking
        let handlers: Vec<(QoS, Arc<dyn InlineHandler>)> = self
            .inline
            .read()
            .iter()
            .filter(|s| topic_matches_filter(&publish.topic, &s.filter))
            .map(|s| (s.qos, s.handler.clone()))
            .collect();

        for (qos, handler) in handlers {
            let mut delivered = publish.clone();
            delivered.qos = publish.qos.min(qos);
            delivered.retain = false;
            delivered.packet_id = None;
            handler.handle(&delivered);
        }
    }

    fn store_retained(&self, publish: &Publish) {
        if publish.payload.is_empty() {
            trace!("Clearing retained message on {}", publish.topic);
            self.retained.remove(publish.topic.as_ref());
        } else {
            trace!("Retaining message on {}", publish.topic);
            let mut stored = publish.clone();
            stored.dup = false;
            stored.packet_id = None;
            self.retained.insert(publish.topic.to_string(), stored);
        }
    }

    /// Retained messages whose topic matches `filter`, flagged retain
    pub fn retained_matching(&self, filter: &str) -> Vec<Publish> {
        self.retained
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Register an inline subscription and replay matching retained messages to it
    pub fn add_inline(&self, filter: &str, qos: QoS, handler: Arc<dyn InlineHandler>) -> u64 {
        let id = self.next_inline_id.fetch_add(1, Ordering::Relaxed);
        self.inline.write().push(InlineSubscription {
            id,
            filter: filter.to_string(),
            qos,
            handler: handler.clone(),
        });

        for mut retained in self.retained_matching(filter) {
            retained.qos = retained.qos.min(qos);
            handler.handle(&retained);
        }

        id
    }

    pub fn remove_inline(&self, id: u64) -> bool {
        let mut inline = self.inline.write();
        let len_before = inline.len();
        inline.retain(|s| s.id != id);
        inline.len() != len_before
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::Subscription;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn recorder() -> (Arc<Mutex<Vec<Publish>>>, Arc<dyn InlineHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Arc<dyn InlineHandler> =
            Arc::new(move |p: &Publish| sink.lock().push(p.clone()));
        (seen, handler)
    }

    fn register(router: &MessageRouter, client_id: &str, capacity: usize) -> mpsc::Receiver<Packet> {
        let (tx, rx) = mpsc::channel(capacity);
        router.connections.insert(
            client_id.into(),
            ClientHandle {
                sender: tx,
                kick: CancellationToken::new(),
                conn_id: 1,
            },
        );
        rx
    }

    #[test]
    fn test_route_to_client_downgrades_qos() {
        let router = MessageRouter::new(None);
        let mut rx = register(&router, "device", 8);
        router.subscriptions.subscribe(
            "cmnd/main/#",
            Subscription {
                client_id: "device".into(),
                qos: QoS::AtMostOnce,
            },
        );

        let mut publish = Publish::new("cmnd/main/Power", "ON", QoS::AtLeastOnce);
        publish.retain = true;
        router.route(&publish);

        match rx.try_recv().unwrap() {
            Packet::Publish(p) => {
                assert_eq!(p.qos, QoS::AtMostOnce);
                assert!(!p.retain);
                assert_eq!(&p.payload[..], b"ON");
            }
            other => panic!("unexpected packet {:?}", other),
        }
        assert_eq!(router.retained_count(), 1);
    }

    #[test]
    fn test_full_queue_drops_message() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let router = MessageRouter::new(Some(metrics.clone()));
        let mut rx = register(&router, "device", 1);
        router.subscriptions.subscribe(
            "cmnd/#",
            Subscription {
                client_id: "device".into(),
                qos: QoS::AtLeastOnce,
            },
        );

        router.route(&Publish::new("cmnd/main/Power", "ON", QoS::AtLeastOnce));
        router.route(&Publish::new("cmnd/main/Power", "OFF", QoS::AtLeastOnce));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.publish_messages_dropped.get(), 1);
    }

    #[test]
    fn test_inline_handler_receives_matching() {
        let router = MessageRouter::new(None);
        let (seen, handler) = recorder();
        router.add_inline("stat/main/STATUS0", QoS::AtLeastOnce, handler);

        router.route(&Publish::new("stat/main/STATUS0", "{}", QoS::AtLeastOnce));
        router.route(&Publish::new("stat/main/RESULT", "{}", QoS::AtLeastOnce));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].topic.as_ref(), "stat/main/STATUS0");
    }

    #[test]
    fn test_inline_registration_replays_retained() {
        let router = MessageRouter::new(None);
        let mut lwt = Publish::new("tele/main/LWT", "Online", QoS::AtLeastOnce);
        lwt.retain = true;
        router.route(&lwt);

        let (seen, handler) = recorder();
        router.add_inline("tele/+/LWT", QoS::AtMostOnce, handler);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].retain);
        assert_eq!(seen[0].qos, QoS::AtMostOnce);
        assert_eq!(&seen[0].payload[..], b"Online");
    }

    #[test]
    fn test_empty_retained_payload_clears() {
        let router = MessageRouter::new(None);
        let mut lwt = Publish::new("tele/main/LWT", "Online", QoS::AtLeastOnce);
        lwt.retain = true;
        router.route(&lwt);
        assert_eq!(router.retained_matching("tele/#").len(), 1);

        let mut clear = Publish::new("tele/main/LWT", "", QoS::AtLeastOnce);
        clear.retain = true;
        router.route(&clear);
        assert!(router.retained_matching("tele/#").is_empty());
    }

    #[test]
    fn test_remove_inline() {
        let router = MessageRouter::new(None);
        let (seen, handler) = recorder();
        let id = router.add_inline("#", QoS::AtLeastOnce, handler);

        assert!(router.remove_inline(id));
        assert!(!router.remove_inline(id));

        router.route(&Publish::new("cmnd/main/Power", "ON", QoS::AtMostOnce));
        assert!(seen.lock().is_empty());
    }
}
