//! Snapshot Cache
//!
//! Last known full (uncapped) snapshot per key. It is the diff baseline for
//! the key's poller and answers immediate snapshot queries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::{Snapshot, StreamKey, StreamRecord};

/// Thread-safe map from key to its last good snapshot.
pub struct SnapshotCache<K, R> {
    entries: RwLock<HashMap<K, Arc<Snapshot<K, R>>>>,
}

impl<K: StreamKey, R: StreamRecord> Default for SnapshotCache<K, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StreamKey, R: StreamRecord> SnapshotCache<K, R> {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Last good snapshot for `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<Snapshot<K, R>>> {
        self.entries.read().get(key).cloned()
    }

    /// Store a snapshot unless the writer has been cancelled.
    ///
    /// The cancellation check and the write happen under the same lock, so a
    /// writer cancelled before an eviction can never re-create the entry.
    /// Returns whether the snapshot was stored.
    pub fn insert_unless_cancelled(
        &self,
        snapshot: Arc<Snapshot<K, R>>,
        cancel: &CancellationToken,
    ) -> bool {
        let mut entries = self.entries.write();
        if cancel.is_cancelled() {
            return false;
        }
        entries.insert(snapshot.key.clone(), snapshot);
        true
    }

    /// Evict `key`.
    pub fn remove(&self, key: &K) -> Option<Arc<Snapshot<K, R>>> {
        self.entries.write().remove(key)
    }

    /// Evict every key.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
