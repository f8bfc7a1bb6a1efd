//! Topic matching and subscription management
//!
//! Topic name/filter validation and the per-client subscription store used
//! by the router. A device holds a handful of filters, so matching is a
//! linear scan over the registered filters.

pub mod validation;

pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::protocol::QoS;

/// A subscription entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: Arc<str>,
    /// Granted QoS
    pub qos: QoS,
}

/// Thread-safe subscription store keyed by topic filter
#[derive(Default)]
pub struct SubscriptionStore {
    filters: RwLock<HashMap<String, Vec<Subscription>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription, replacing the client's previous one on the same filter.
    ///
    /// Returns true if an existing subscription was replaced.
    pub fn subscribe(&self, filter: &str, subscription: Subscription) -> bool {
        let mut filters = self.filters.write();
        let subs = filters.entry(filter.to_string()).or_default();
        match subs
            .iter_mut()
            .find(|s| s.client_id == subscription.client_id)
        {
            Some(existing) => {
                existing.qos = subscription.qos;
                true
            }
            None => {
                subs.push(subscription);
                false
            }
        }
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let mut filters = self.filters.write();
        let Some(subs) = filters.get_mut(filter) else {
            return false;
        };
        let len_before = subs.len();
        subs.retain(|s| s.client_id.as_ref() != client_id);
        let removed = subs.len() != len_before;
        if subs.is_empty() {
            filters.remove(filter);
        }
        removed
    }

    /// Remove all subscriptions for a client
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut filters = self.filters.write();
        filters.retain(|_, subs| {
            subs.retain(|s| s.client_id.as_ref() != client_id);
            !subs.is_empty()
        });
    }

    /// Find the subscribers for a topic.
    ///
    /// A client matched by several overlapping filters appears once, with the
    /// highest granted QoS among them.
    pub fn matches(&self, topic: &str) -> Vec<Subscription> {
        let filters = self.filters.read();
        let mut result: Vec<Subscription> = Vec::new();

        for (filter, subs) in filters.iter() {
            if !topic_matches_filter(topic, filter) {
                continue;
            }
            for sub in subs {
                match result.iter_mut().find(|r| r.client_id == sub.client_id) {
                    Some(existing) => existing.qos = existing.qos.max(sub.qos),
                    None => result.push(sub.clone()),
                }
            }
        }

        result
    }

    /// Number of (filter, client) pairs
    pub fn len(&self) -> usize {
        self.filters.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.read().is_empty()
    }
}
