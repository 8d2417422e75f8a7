//! Service statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Point-in-time statistics of one stream service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// Keys currently subscribed.
    pub active_subscriptions: usize,
    /// Subscriptions created since start.
    pub total_subscriptions: u64,
    /// Subscriptions removed since start.
    pub total_unsubscriptions: u64,
    /// Delta events produced by pollers since start.
    pub total_updates: u64,
    /// Seconds since the service was created.
    pub uptime_seconds: u64,
    /// When a poller last produced an event.
    pub last_update_timestamp: Option<DateTime<Utc>>,
}

/// Monotonic counters behind [`ServiceStats`].
#[derive(Debug)]
pub struct StatsAggregator {
    started_at: Instant,
    total_subscriptions: AtomicU64,
    total_unsubscriptions: AtomicU64,
    total_updates: AtomicU64,
    last_update: RwLock<Option<DateTime<Utc>>>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    /// Start counting from now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_subscriptions: AtomicU64::new(0),
            total_unsubscriptions: AtomicU64::new(0),
            total_updates: AtomicU64::new(0),
            last_update: RwLock::new(None),
        }
    }

    /// Record a created subscription.
    pub fn record_subscription(&self) {
        self.total_subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a removed subscription.
    pub fn record_unsubscription(&self) {
        self.total_unsubscriptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` delta events produced by one poll.
    pub fn record_updates(&self, count: usize, at: DateTime<Utc>) {
        if count == 0 {
            return;
        }
        self.total_updates.fetch_add(count as u64, Ordering::Relaxed);
        let mut last = self.last_update.write();
        if last.is_none_or(|previous| previous < at) {
            *last = Some(at);
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn snapshot(&self, active_subscriptions: usize) -> ServiceStats {
        ServiceStats {
            active_subscriptions,
            total_subscriptions: self.total_subscriptions.load(Ordering::Relaxed),
            total_unsubscriptions: self.total_unsubscriptions.load(Ordering::Relaxed),
            total_updates: self.total_updates.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            last_update_timestamp: *self.last_update.read(),
        }
    }
}
