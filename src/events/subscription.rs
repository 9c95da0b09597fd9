//! Topic subscriptions of one [`EventSubscriber`](super::EventSubscriber).
//!
//! Wire filters are byte prefixes, so the broker may deliver topics nobody
//! asked for exactly; the registry matches exact topics.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::Event;

/// Callback invoked with every event of a subscribed topic.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// Callbacks per exact topic.
#[derive(Default)]
pub struct SubscriptionRegistry {
    topics: BTreeMap<String, Vec<EventCallback>>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.topics.iter().map(|(topic, cbs)| (topic, cbs.len())))
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a callback. Returns `true` if it is the first for `topic`, in
    /// which case the wire filter must be armed.
    pub fn add(&mut self, topic: &str, callback: EventCallback) -> bool {
        let callbacks = self.topics.entry(topic.to_string()).or_default();
        callbacks.push(callback);
        callbacks.len() == 1
    }

    /// Drops every callback of `topic`. Returns `true` if there were any.
    pub fn remove(&mut self, topic: &str) -> bool {
        self.topics.remove(topic).is_some()
    }

    /// Callbacks registered for exactly `topic`.
    #[must_use]
    pub fn callbacks(&self, topic: &str) -> Vec<EventCallback> {
        self.topics.get(topic).cloned().unwrap_or_default()
    }

    /// Subscribed topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    /// Number of subscribed topics.
    #[must_use]
    pub fn count(&self) -> usize {
        self.topics.len()
    }
}
