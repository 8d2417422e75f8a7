//! Shared state of one stream service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::application::ports::SharedConnector;
use crate::domain::streaming::{StreamKey, StreamRecord};
use crate::domain::subscription::SubscriptionTable;
use crate::infrastructure::broadcast::BroadcastHub;

use super::cache::SnapshotCache;
use super::stats::StatsAggregator;

/// Timing and sizing of one key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Interval between polls of one key.
    pub poll_interval: Duration,
    /// Upper bound on one upstream call.
    pub fetch_timeout: Duration,
    /// How long unsubscribe waits for a poller before aborting it.
    pub stop_grace: Duration,
    /// Interval between upstream connectivity checks.
    pub connection_check_interval: Duration,
    /// Ring capacity of each key's topic.
    pub topic_capacity: usize,
    /// Depth applied when a caller does not ask for one.
    pub default_depth: Option<usize>,
}

impl StreamConfig {
    /// Defaults for depth books.
    #[must_use]
    pub const fn books() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            fetch_timeout: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
            connection_check_interval: Duration::from_secs(1),
            topic_capacity: 256,
            default_depth: None,
        }
    }

    /// Defaults for account positions.
    #[must_use]
    pub const fn positions() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            topic_capacity: 64,
            ..Self::books()
        }
    }
}

/// Counter bumped every time the upstream comes back after a disconnect.
///
/// Pollers remember the value they last published under; seeing a newer one
/// makes them publish a full snapshot instead of deltas.
#[derive(Debug, Default)]
pub struct ResyncEpoch(AtomicU64);

impl ResyncEpoch {
    /// Current epoch.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Start a new epoch, returning it.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Everything the registry, pollers and connection monitor of one key space
/// share.
pub struct StreamContext<K, R> {
    pub(crate) config: StreamConfig,
    pub(crate) connector: SharedConnector<K, R>,
    pub(crate) subscriptions: SubscriptionTable<K>,
    pub(crate) cache: SnapshotCache<K, R>,
    pub(crate) hub: BroadcastHub<K, R>,
    pub(crate) stats: StatsAggregator,
    pub(crate) epoch: ResyncEpoch,
}

impl<K: StreamKey, R: StreamRecord> StreamContext<K, R> {
    /// Create empty shared state around a connector.
    #[must_use]
    pub fn new(connector: SharedConnector<K, R>, config: StreamConfig) -> Self {
        Self {
            config,
            connector,
            subscriptions: SubscriptionTable::new(),
            cache: SnapshotCache::new(),
            hub: BroadcastHub::new(config.topic_capacity),
            stats: StatsAggregator::new(),
            epoch: ResyncEpoch::default(),
        }
    }

    /// Ask the upstream whether it is usable, bounded by the fetch timeout.
    ///
    /// A check that times out counts as disconnected.
    pub async fn upstream_connected(&self) -> bool {
        tokio::time::timeout(self.config.fetch_timeout, self.connector.is_connected())
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_defaults_inherit_book_timing() {
        let books = StreamConfig::books();
        let positions = StreamConfig::positions();

        assert_eq!(books.poll_interval, Duration::from_millis(250));
        assert_eq!(positions.poll_interval, Duration::from_secs(2));
        assert_eq!(positions.fetch_timeout, books.fetch_timeout);
        assert_eq!(positions.topic_capacity, 64);
    }

    #[test]
    fn epoch_bumps_monotonically() {
        let epoch = ResyncEpoch::default();
        assert_eq!(epoch.current(), 0);
        assert_eq!(epoch.bump(), 1);
        assert_eq!(epoch.bump(), 2);
        assert_eq!(epoch.current(), 2);
    }
}
