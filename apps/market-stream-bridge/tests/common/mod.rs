//! Shared fake upstream for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use market_stream_bridge::{ConnectorError, Snapshot, SnapshotConnector, StreamKey, StreamRecord};

/// Upstream whose books are set by the test.
///
/// Starts connected. Unknown keys answer 404.
pub struct FakeUpstream<K, R> {
    connected: AtomicBool,
    records: Mutex<HashMap<K, Vec<R>>>,
    failures: Mutex<HashMap<K, u32>>,
    fetches: Mutex<HashMap<K, usize>>,
}

impl<K: StreamKey, R: StreamRecord> FakeUpstream<K, R> {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            records: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_records(&self, key: &K, records: Vec<R>) {
        self.records.lock().insert(key.clone(), records);
    }

    pub fn fail_next(&self, key: &K, count: u32) {
        self.failures.lock().insert(key.clone(), count);
    }

    pub fn fetch_count(&self, key: &K) -> usize {
        self.fetches.lock().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl<K: StreamKey, R: StreamRecord> SnapshotConnector<K, R> for FakeUpstream<K, R> {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn fetch_snapshot(
        &self,
        key: &K,
        _depth: Option<usize>,
    ) -> Result<Snapshot<K, R>, ConnectorError> {
        *self.fetches.lock().entry(key.clone()).or_default() += 1;

        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectorError::Disconnected);
        }
        if let Some(remaining) = self.failures.lock().get_mut(key).filter(|n| **n > 0) {
            *remaining -= 1;
            return Err(ConnectorError::Upstream {
                status: 503,
                message: "injected failure".to_string(),
            });
        }

        self.records
            .lock()
            .get(key)
            .map(|records| Snapshot::new(key.clone(), records.clone(), Utc::now()))
            .ok_or_else(|| ConnectorError::Upstream {
                status: 404,
                message: format!("unknown key {key}"),
            })
    }
}
