//! Broadcast Channel Adapters
//!
//! Implements delta event distribution using tokio broadcast channels
//! for efficient fan-out to multiple listeners.
//!
//! # Architecture
//!
//! The `BroadcastHub` keeps one topic per key of a key space. Topics are
//! created when the first listener joins and removed when the key is
//! unsubscribed. Each topic is a bounded ring: a listener that falls behind
//! loses the oldest events and is told how many it missed (`Lagged`) on its
//! next receive. Publishing never waits for listeners.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::domain::streaming::{DeltaEvent, StreamKey, StreamRecord};
use crate::infrastructure::metrics;

/// Event as delivered to listeners.
pub type SharedEvent<K, R> = Arc<DeltaEvent<K, R>>;

/// Receiving end of one key's topic.
pub type EventReceiver<K, R> = broadcast::Receiver<SharedEvent<K, R>>;

/// Default ring capacity per topic.
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// Per-key topics for one key space.
///
/// # Example
///
/// ```rust
/// use market_stream_bridge::domain::streaming::{BookLevel, DeltaEvent, Symbol};
/// use market_stream_bridge::infrastructure::broadcast::BroadcastHub;
///
/// let hub: BroadcastHub<Symbol, BookLevel> = BroadcastHub::new(16);
/// let key = Symbol::new("EURUSD");
///
/// let mut rx = hub.join(&key);
/// assert_eq!(hub.publish(DeltaEvent::sync(key.clone())), Some(1));
/// assert!(rx.try_recv().is_ok());
/// ```
pub struct BroadcastHub<K, R> {
    capacity: usize,
    topics: RwLock<HashMap<K, broadcast::Sender<SharedEvent<K, R>>>>,
}

impl<K: StreamKey, R: StreamRecord> Default for BroadcastHub<K, R> {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl<K: StreamKey, R: StreamRecord> BroadcastHub<K, R> {
    /// Create a hub whose topics hold at most `capacity` events each.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Join the topic for `key`, creating it if needed.
    ///
    /// Dropping the receiver leaves the topic.
    #[must_use]
    pub fn join(&self, key: &K) -> EventReceiver<K, R> {
        let existing = self.topics.read().get(key).map(broadcast::Sender::subscribe);
        if let Some(receiver) = existing {
            return receiver;
        }

        self.topics
            .write()
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event to the topic of its key.
    ///
    /// Returns the number of listeners the event was queued for, or `None`
    /// if the key has no topic or no listeners.
    pub fn publish(&self, event: DeltaEvent<K, R>) -> Option<usize> {
        let kind = event.kind();
        let delivered = self
            .topics
            .read()
            .get(&event.key)
            .and_then(|sender| sender.send(Arc::new(event)).ok());

        metrics::record_event_published(R::KIND, kind);
        if delivered.is_none() {
            metrics::record_event_undelivered(R::KIND);
        }
        delivered
    }

    /// Remove the topic for `key`.
    ///
    /// Listeners still drain what was already queued, then see the channel
    /// closed. Returns whether a topic existed.
    pub fn close_topic(&self, key: &K) -> bool {
        self.topics.write().remove(key).is_some()
    }

    /// Remove the topic for `key` if nobody listens to it.
    ///
    /// Checked under the write lock, so a concurrent `join` either keeps the
    /// topic alive or creates a fresh one afterwards.
    pub fn release_if_idle(&self, key: &K) -> bool {
        let mut topics = self.topics.write();
        let idle = topics
            .get(key)
            .is_some_and(|sender| sender.receiver_count() == 0);
        if idle {
            topics.remove(key);
        }
        idle
    }

    /// Remove every topic nobody listens to, except those `keep` retains.
    ///
    /// Returns how many topics were removed.
    pub fn prune_idle(&self, keep: impl Fn(&K) -> bool) -> usize {
        let mut topics = self.topics.write();
        let before = topics.len();
        topics.retain(|key, sender| sender.receiver_count() > 0 || keep(key));
        before - topics.len()
    }

    /// Remove every topic.
    pub fn clear(&self) {
        self.topics.write().clear();
    }

    /// Number of listeners joined to `key`.
    #[must_use]
    pub fn receiver_count(&self, key: &K) -> usize {
        self.topics
            .read()
            .get(key)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Whether a topic exists for `key`.
    #[must_use]
    pub fn has_topic(&self, key: &K) -> bool {
        self.topics.read().contains_key(key)
    }

    /// Ring capacity of each topic.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get statistics about all topics.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        let topics = self.topics.read();
        BroadcastStats {
            topics: topics.len(),
            receivers: topics.values().map(broadcast::Sender::receiver_count).sum(),
        }
    }
}

/// Statistics about broadcast topics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BroadcastStats {
    /// Number of open topics.
    pub topics: usize,
    /// Listeners across all topics.
    pub receivers: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    use super::*;
    use crate::domain::streaming::{BookLevel, DeltaKind, DeltaPayload, Symbol};

    type Hub = BroadcastHub<Symbol, BookLevel>;

    fn eurusd() -> Symbol {
        Symbol::new("EURUSD")
    }

    fn add_event(volume: i64) -> DeltaEvent<Symbol, BookLevel> {
        DeltaEvent::new(
            eurusd(),
            DeltaPayload::Add(BookLevel::bid(dec!(1.1), volume)),
            Utc::now(),
        )
    }

    #[test]
    fn hub_starts_empty() {
        let hub = Hub::default();
        assert_eq!(hub.stats(), BroadcastStats::default());
        assert_eq!(hub.capacity(), DEFAULT_TOPIC_CAPACITY);
        assert_eq!(Hub::new(0).capacity(), 1);
    }

    #[test]
    fn receiver_count_follows_joins_and_drops() {
        let hub = Hub::new(8);

        let rx1 = hub.join(&eurusd());
        assert_eq!(hub.receiver_count(&eurusd()), 1);

        {
            let _rx2 = hub.join(&eurusd());
            assert_eq!(hub.receiver_count(&eurusd()), 2);
        }

        assert_eq!(hub.receiver_count(&eurusd()), 1);
        drop(rx1);
        assert_eq!(hub.receiver_count(&eurusd()), 0);
        // the topic outlives its listeners
        assert!(hub.has_topic(&eurusd()));
    }

    #[tokio::test]
    async fn every_listener_gets_the_event() {
        let hub = Hub::new(8);
        let mut rx1 = hub.join(&eurusd());
        let mut rx2 = hub.join(&eurusd());

        assert_eq!(hub.publish(add_event(5)), Some(2));

        let r1 = rx1.recv().await.unwrap();
        let r2 = rx2.recv().await.unwrap();
        assert_eq!(r1.kind(), DeltaKind::Add);
        assert!(Arc::ptr_eq(&r1, &r2));
    }

    #[test]
    fn publish_without_topic_or_listeners_is_a_no_op() {
        let hub = Hub::new(8);
        assert_eq!(hub.publish(add_event(1)), None);
        assert!(!hub.has_topic(&eurusd()));

        drop(hub.join(&eurusd()));
        assert_eq!(hub.publish(add_event(1)), None);
    }

    #[test]
    fn topics_are_isolated_per_key() {
        let hub = Hub::new(8);
        let mut other = hub.join(&Symbol::new("GBPUSD"));
        let _eurusd = hub.join(&eurusd());

        hub.publish(add_event(1));

        assert!(matches!(other.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn slow_listener_lags_instead_of_blocking() {
        let hub = Hub::new(2);
        let mut rx = hub.join(&eurusd());

        for volume in 1..=5 {
            assert_eq!(hub.publish(add_event(volume)), Some(1));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.payload, DeltaPayload::Add(BookLevel::bid(dec!(1.1), 4)));
    }

    #[tokio::test]
    async fn closing_topic_drains_then_closes() {
        let hub = Hub::new(8);
        let mut rx = hub.join(&eurusd());

        hub.publish(DeltaEvent::clean(eurusd()));
        assert!(hub.close_topic(&eurusd()));
        assert!(!hub.close_topic(&eurusd()));

        assert_eq!(rx.recv().await.unwrap().kind(), DeltaKind::Clean);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
    }

    #[test]
    fn idle_topic_is_released() {
        let hub = Hub::new(8);
        let rx1 = hub.join(&eurusd());
        let rx2 = hub.join(&eurusd());

        drop(rx1);
        assert!(!hub.release_if_idle(&eurusd()));
        assert!(hub.has_topic(&eurusd()));

        drop(rx2);
        assert!(hub.release_if_idle(&eurusd()));
        assert!(!hub.has_topic(&eurusd()));
        assert!(!hub.release_if_idle(&eurusd()));
    }

    #[test]
    fn abandoned_topics_are_pruned() {
        let hub = Hub::new(8);
        for i in 0..1000 {
            drop(hub.join(&Symbol::new(format!("SYM{i}"))));
        }
        let _listener = hub.join(&eurusd());
        drop(hub.join(&Symbol::new("GBPUSD")));
        assert_eq!(hub.stats().topics, 1002);

        let removed = hub.prune_idle(|key| key.as_str() == "GBPUSD");

        assert_eq!(removed, 1000);
        assert_eq!(
            hub.stats(),
            BroadcastStats {
                topics: 2,
                receivers: 1
            }
        );
    }

    #[test]
    fn stats_count_topics_and_receivers() {
        let hub = Hub::new(8);
        let _a = hub.join(&eurusd());
        let _b = hub.join(&eurusd());
        let _c = hub.join(&Symbol::new("GBPUSD"));

        assert_eq!(
            hub.stats(),
            BroadcastStats {
                topics: 2,
                receivers: 3
            }
        );

        hub.clear();
        assert_eq!(hub.stats().topics, 0);
    }
}
