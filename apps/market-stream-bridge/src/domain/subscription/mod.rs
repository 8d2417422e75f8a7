//! Subscription Management Types
//!
//! Domain types for tracking which keys of a key space are actively streamed.
//!
//! # Design
//!
//! The subscription table tracks:
//! - At most one `Subscription` per key
//! - Whether that subscription is still active or already being torn down
//! - The depth the first subscriber asked for
//!
//! The table itself never starts or stops pollers; the registry service does
//! that and uses the table as the source of truth for what is active.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use super::streaming::StreamKey;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier of one subscription lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Generate a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Parameters supplied with a subscribe request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeParams {
    /// Maximum levels per side in published snapshots (books only).
    pub max_depth: Option<usize>,
}

impl SubscribeParams {
    /// Parameters with a depth cap.
    #[must_use]
    pub const fn with_depth(max_depth: usize) -> Self {
        Self {
            max_depth: Some(max_depth),
        }
    }
}

/// One active key of a key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription<K> {
    /// Subscribed key.
    pub key: K,
    /// Id of this subscription lifetime.
    pub id: SubscriptionId,
    /// When the key went from zero to one subscription.
    pub subscribed_at: DateTime<Utc>,
    /// False once the poller has been told to stop.
    pub active: bool,
    /// Depth cap for published snapshots.
    pub max_depth: Option<usize>,
}

impl<K> Subscription<K> {
    fn new(key: K, params: SubscribeParams) -> Self {
        Self {
            key,
            id: SubscriptionId::generate(),
            subscribed_at: Utc::now(),
            active: true,
            max_depth: params.max_depth,
        }
    }
}

/// Outcome of a successful subscribe or unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionReceipt<K> {
    /// Key the operation applied to.
    pub key: K,
    /// Id of the subscription created, kept, or removed.
    pub subscription_id: SubscriptionId,
    /// When the subscription was created.
    pub subscribed_at: DateTime<Utc>,
    /// Whether this call changed the table (false for an idempotent subscribe).
    pub created: bool,
    /// When the operation completed.
    pub timestamp: DateTime<Utc>,
}

impl<K: fmt::Display> SubscriptionReceipt<K> {
    /// Human-readable description for subscribe outcomes.
    #[must_use]
    pub fn subscribe_message(&self) -> String {
        if self.created {
            format!("subscribed to {}", self.key)
        } else {
            format!("already subscribed to {}", self.key)
        }
    }

    /// Human-readable description for unsubscribe outcomes.
    #[must_use]
    pub fn unsubscribe_message(&self) -> String {
        format!("unsubscribed from {}", self.key)
    }
}

// =============================================================================
// Subscription Table
// =============================================================================

/// Thread-safe table of subscriptions for one key space.
///
/// # Example
///
/// ```rust
/// use market_stream_bridge::domain::streaming::Symbol;
/// use market_stream_bridge::domain::subscription::{SubscribeParams, SubscriptionTable};
///
/// let table = SubscriptionTable::new();
/// let key = Symbol::new("EURUSD");
///
/// let (first, created) = table.insert_if_absent(&key, SubscribeParams::default());
/// assert!(created);
///
/// // Second subscribe keeps the original subscription
/// let (second, created) = table.insert_if_absent(&key, SubscribeParams::with_depth(5));
/// assert!(!created);
/// assert_eq!(first.id, second.id);
///
/// table.deactivate(&key);
/// assert!(!table.is_active(&key));
/// assert!(table.remove(&key).is_some());
/// ```
pub struct SubscriptionTable<K> {
    subscriptions: RwLock<HashMap<K, Subscription<K>>>,
}

impl<K: StreamKey> Default for SubscriptionTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StreamKey> SubscriptionTable<K> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a subscription unless one already exists.
    ///
    /// Returns the subscription now in the table and whether it was created.
    /// An existing entry keeps its id, `subscribed_at` and depth.
    pub fn insert_if_absent(&self, key: &K, params: SubscribeParams) -> (Subscription<K>, bool) {
        let mut subscriptions = self.subscriptions.write();
        if let Some(existing) = subscriptions.get(key) {
            return (existing.clone(), false);
        }

        let subscription = Subscription::new(key.clone(), params);
        subscriptions.insert(key.clone(), subscription.clone());
        (subscription, true)
    }

    /// Mark a subscription as stopping.
    ///
    /// Returns the subscription if it was active.
    pub fn deactivate(&self, key: &K) -> Option<Subscription<K>> {
        let mut subscriptions = self.subscriptions.write();
        let subscription = subscriptions.get_mut(key).filter(|s| s.active)?;
        subscription.active = false;
        Some(subscription.clone())
    }

    /// Remove a subscription.
    pub fn remove(&self, key: &K) -> Option<Subscription<K>> {
        self.subscriptions.write().remove(key)
    }

    /// Get a subscription, active or stopping.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Subscription<K>> {
        self.subscriptions.read().get(key).cloned()
    }

    /// Whether the key has an active subscription.
    #[must_use]
    pub fn is_active(&self, key: &K) -> bool {
        self.subscriptions.read().get(key).is_some_and(|s| s.active)
    }

    /// Keys with an active subscription, in no particular order.
    #[must_use]
    pub fn active_keys(&self) -> Vec<K> {
        self.subscriptions
            .read()
            .values()
            .filter(|s| s.active)
            .map(|s| s.key.clone())
            .collect()
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.subscriptions.read().values().filter(|s| s.active).count()
    }

    /// Remove every subscription, returning what was removed.
    pub fn drain(&self) -> Vec<Subscription<K>> {
        self.subscriptions.write().drain().map(|(_, s)| s).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
