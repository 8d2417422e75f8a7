//! Scripted connector for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::application::ports::{ConnectorError, SnapshotConnector};
use crate::domain::streaming::{Snapshot, StreamKey, StreamRecord};

struct Script<K, R> {
    records: HashMap<K, Vec<R>>,
    failures: HashMap<K, u32>,
    fetches: HashMap<K, usize>,
    delay: Option<Duration>,
}

/// In-memory connector whose answers are set by the test.
///
/// Starts connected with no keys. Fetching a key with no records set fails
/// with a 404 upstream error.
pub struct ScriptedConnector<K, R> {
    connected: AtomicBool,
    script: Mutex<Script<K, R>>,
}

impl<K: StreamKey, R: StreamRecord> Default for ScriptedConnector<K, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StreamKey, R: StreamRecord> ScriptedConnector<K, R> {
    /// Create a connected connector with no keys.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            script: Mutex::new(Script {
                records: HashMap::new(),
                failures: HashMap::new(),
                fetches: HashMap::new(),
                delay: None,
            }),
        }
    }

    /// Set what `is_connected` reports; fetches fail while disconnected.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Set the records returned for `key`.
    pub fn set_records(&self, key: &K, records: Vec<R>) {
        self.script.lock().records.insert(key.clone(), records);
    }

    /// Make the next `count` fetches of `key` fail.
    pub fn fail_next(&self, key: &K, count: u32) {
        self.script.lock().failures.insert(key.clone(), count);
    }

    /// Delay every fetch by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.script.lock().delay = Some(delay);
    }

    /// Number of fetches of `key` so far.
    #[must_use]
    pub fn fetch_count(&self, key: &K) -> usize {
        self.script.lock().fetches.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl<K: StreamKey, R: StreamRecord> SnapshotConnector<K, R> for ScriptedConnector<K, R> {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn fetch_snapshot(
        &self,
        key: &K,
        _depth: Option<usize>,
    ) -> Result<Snapshot<K, R>, ConnectorError> {
        let delay = {
            let mut script = self.script.lock();
            *script.fetches.entry(key.clone()).or_default() += 1;
            script.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectorError::Disconnected);
        }

        let mut script = self.script.lock();
        if let Some(remaining) = script.failures.get_mut(key).filter(|n| **n > 0) {
            *remaining -= 1;
            return Err(ConnectorError::Upstream {
                status: 503,
                message: "scripted failure".to_string(),
            });
        }

        script
            .records
            .get(key)
            .map(|records| Snapshot::new(key.clone(), records.clone(), Utc::now()))
            .ok_or_else(|| ConnectorError::Upstream {
                status: 404,
                message: format!("unknown key {key}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::streaming::{BookLevel, Symbol};

    #[tokio::test]
    async fn scripted_answers() {
        let connector: ScriptedConnector<Symbol, BookLevel> = ScriptedConnector::new();
        let key = Symbol::new("EURUSD");

        assert!(connector.fetch_snapshot(&key, None).await.is_err());

        connector.set_records(&key, vec![BookLevel::bid(dec!(1.1), 1)]);
        connector.fail_next(&key, 1);
        assert!(connector.fetch_snapshot(&key, None).await.is_err());
        assert_eq!(connector.fetch_snapshot(&key, None).await.unwrap().len(), 1);

        connector.set_connected(false);
        assert!(!connector.is_connected().await);
        assert_eq!(
            connector.fetch_snapshot(&key, None).await.unwrap_err(),
            ConnectorError::Disconnected
        );
        assert_eq!(connector.fetch_count(&key), 4);
    }

    #[test]
    fn connectivity_answer_is_immediate() {
        let connector: ScriptedConnector<Symbol, BookLevel> = ScriptedConnector::new();

        let mut check = tokio_test::task::spawn(connector.is_connected());

        assert!(tokio_test::assert_ready!(check.poll()));
    }
}
