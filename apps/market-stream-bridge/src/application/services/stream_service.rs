//! Stream Service
//!
//! Control surface of one key space. Combines the subscription registry,
//! snapshot cache, broadcast topics, statistics and connection monitor
//! around a single upstream connector.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use market_stream_bridge::application::services::{BookService, StreamConfig};
//! use market_stream_bridge::domain::streaming::Symbol;
//! use market_stream_bridge::domain::subscription::SubscribeParams;
//! use market_stream_bridge::infrastructure::connector::SimulatedConnector;
//!
//! async fn example() {
//!     let connector = Arc::new(SimulatedConnector::new());
//!     let books = BookService::new(connector, StreamConfig::books());
//!     let key = Symbol::new("EURUSD");
//!
//!     let mut events = books.join(&key);
//!     books.subscribe(key.clone(), SubscribeParams::with_depth(10)).await.unwrap();
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event.kind());
//!     }
//! }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ConnectorError, SharedConnector};
use crate::domain::streaming::{
    AccountId, BookLevel, Position, Snapshot, StreamKey, StreamRecord, Symbol,
};
use crate::domain::subscription::{SubscribeParams, SubscriptionReceipt};
use crate::infrastructure::broadcast::{BroadcastStats, EventReceiver};

use super::connection_monitor::ConnectionMonitor;
use super::context::{StreamConfig, StreamContext};
use super::error::StreamError;
use super::registry::SubscriptionRegistry;
use super::stats::ServiceStats;

/// Poll, diff and broadcast engine for one key space.
pub struct StreamService<K, R> {
    context: Arc<StreamContext<K, R>>,
    registry: SubscriptionRegistry<K, R>,
    root: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Depth book service.
pub type BookService = StreamService<Symbol, BookLevel>;

/// Account positions service.
pub type PositionService = StreamService<AccountId, Position>;

impl<K: StreamKey, R: StreamRecord> StreamService<K, R> {
    /// Create a service around `connector`.
    #[must_use]
    pub fn new(connector: SharedConnector<K, R>, config: StreamConfig) -> Self {
        let root = CancellationToken::new();
        let context = Arc::new(StreamContext::new(connector, config));
        let registry = SubscriptionRegistry::new(Arc::clone(&context), root.child_token());
        Self {
            context,
            registry,
            root,
            monitor: Mutex::new(None),
        }
    }

    /// Stream kind label (`book` or `positions`).
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        R::KIND
    }

    /// Configuration this service runs with.
    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.context.config
    }

    /// Subscribe to `key`.
    ///
    /// Without an explicit depth, the configured default depth is used.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionRegistry::subscribe`].
    pub async fn subscribe(
        &self,
        key: K,
        mut params: SubscribeParams,
    ) -> Result<SubscriptionReceipt<K>, StreamError> {
        params.max_depth = params.max_depth.or(self.context.config.default_depth);
        self.registry.subscribe(key, params).await
    }

    /// Unsubscribe from `key`.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionRegistry::unsubscribe`].
    pub async fn unsubscribe(&self, key: &K) -> Result<SubscriptionReceipt<K>, StreamError> {
        self.registry.unsubscribe(key).await
    }

    /// Whether `key` has an active subscription.
    #[must_use]
    pub fn is_subscribed(&self, key: &K) -> bool {
        self.registry.is_subscribed(key)
    }

    /// Keys with an active subscription.
    #[must_use]
    pub fn list_active_keys(&self) -> Vec<K> {
        self.registry.active_keys()
    }

    /// Current snapshot of `key`, capped to `depth`.
    ///
    /// Served from the cache when the key is polled; otherwise fetched once
    /// from the upstream. On-demand results are not cached.
    ///
    /// # Errors
    ///
    /// - `InvalidKey` if the key can never be queried
    /// - `NotAvailable` if the upstream is unusable or the fetch fails
    /// - `ShuttingDown` after [`Self::shutdown`]
    pub async fn get_snapshot(
        &self,
        key: &K,
        depth: Option<usize>,
    ) -> Result<Snapshot<K, R>, StreamError> {
        if !key.is_valid() {
            return Err(StreamError::InvalidKey {
                key: key.to_string(),
            });
        }
        if self.registry.is_shut_down() {
            return Err(StreamError::ShuttingDown);
        }

        let depth = depth.or(self.context.config.default_depth);
        if let Some(cached) = self.context.cache.get(key) {
            return Ok(cached.capped(depth));
        }

        self.fetch_on_demand(key, depth)
            .await
            .map_err(|reason| {
                tracing::debug!(
                    stream = R::KIND,
                    key = %key,
                    error = %reason,
                    "Snapshot not available"
                );
                StreamError::NotAvailable {
                    key: key.to_string(),
                    reason,
                }
            })
    }

    async fn fetch_on_demand(
        &self,
        key: &K,
        depth: Option<usize>,
    ) -> Result<Snapshot<K, R>, ConnectorError> {
        if !self.context.upstream_connected().await {
            return Err(ConnectorError::Disconnected);
        }

        let timeout = self.context.config.fetch_timeout;
        let mut snapshot =
            tokio::time::timeout(timeout, self.context.connector.fetch_snapshot(key, depth))
                .await
                .map_err(|_| ConnectorError::Timeout(timeout))??;

        R::normalize(&mut snapshot.records);
        Ok(snapshot.capped(depth))
    }

    /// Cached snapshot of `key`, capped to `depth`, without touching the
    /// upstream.
    #[must_use]
    pub fn cached_snapshot(&self, key: &K, depth: Option<usize>) -> Option<Snapshot<K, R>> {
        let depth = depth.or(self.context.config.default_depth);
        self.context.cache.get(key).map(|s| s.capped(depth))
    }

    /// Join the event topic of `key`.
    ///
    /// Joining is independent of subscribing: a listener may join before the
    /// key is subscribed and receives events once a poller runs. Call
    /// [`Self::leave`] after dropping the receiver.
    #[must_use]
    pub fn join(&self, key: &K) -> EventReceiver<K, R> {
        self.context.hub.join(key)
    }

    /// Release the topic of `key` after a listener dropped its receiver.
    ///
    /// The topic goes away once nobody listens and the key is not
    /// subscribed. Returns whether it was removed.
    pub fn leave(&self, key: &K) -> bool {
        !self.registry.is_subscribed(key) && self.context.hub.release_if_idle(key)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        self.context
            .stats
            .snapshot(self.context.subscriptions.active_count())
    }

    /// Topic statistics.
    #[must_use]
    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.context.hub.stats()
    }

    /// Whether the upstream currently reports itself usable.
    pub async fn is_upstream_connected(&self) -> bool {
        self.context.upstream_connected().await
    }

    /// Start the connection monitor. Calling it again is a no-op.
    pub fn spawn_connection_monitor(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() || self.root.is_cancelled() {
            return;
        }

        let task = ConnectionMonitor::new(Arc::clone(&self.context), self.root.child_token());
        *monitor = Some(tokio::spawn(task.run()));
    }

    /// Stop the connection monitor and every poller, then clear all state.
    pub async fn shutdown(&self) {
        self.root.cancel();

        let monitor = self.monitor.lock().take();
        if let Some(task) = monitor {
            if let Err(error) = task.await {
                tracing::error!(stream = R::KIND, error = %error, "Connection monitor failed");
            }
        }

        self.registry.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal_macros::dec;
    use test_case::test_case;

    use super::*;
    use crate::domain::streaming::DeltaKind;
    use crate::infrastructure::connector::ScriptedConnector;

    fn eurusd() -> Symbol {
        Symbol::new("EURUSD")
    }

    fn book_service() -> (Arc<ScriptedConnector<Symbol, BookLevel>>, BookService) {
        let connector = Arc::new(ScriptedConnector::<Symbol, BookLevel>::new());
        connector.set_records(
            &eurusd(),
            vec![
                BookLevel::bid(dec!(1.1000), 1),
                BookLevel::bid(dec!(1.0999), 2),
                BookLevel::ask(dec!(1.1001), 3),
                BookLevel::ask(dec!(1.1002), 4),
            ],
        );
        let config = StreamConfig {
            poll_interval: Duration::from_millis(10),
            ..StreamConfig::books()
        };
        let service = BookService::new(connector.clone(), config);
        (connector, service)
    }

    #[test_case(None, 4 ; "uncapped")]
    #[test_case(Some(1), 2 ; "one level per side")]
    #[test_case(Some(0), 0 ; "zero depth")]
    #[tokio::test]
    async fn on_demand_snapshot_is_capped(depth: Option<usize>, expected: usize) {
        let (_connector, service) = book_service();

        let snapshot = service.get_snapshot(&eurusd(), depth).await.unwrap();

        assert_eq!(snapshot.len(), expected);
        assert!(service.cached_snapshot(&eurusd(), None).is_none());
    }

    #[tokio::test]
    async fn snapshot_not_available_when_disconnected() {
        let (connector, service) = book_service();
        connector.set_connected(false);

        let err = service.get_snapshot(&eurusd(), None).await.unwrap_err();

        assert_eq!(
            err,
            StreamError::NotAvailable {
                key: "EURUSD".to_string(),
                reason: ConnectorError::Disconnected,
            }
        );
    }

    #[tokio::test]
    async fn snapshot_not_available_when_fetch_fails() {
        let (connector, service) = book_service();
        connector.fail_next(&eurusd(), 1);

        let err = service.get_snapshot(&eurusd(), None).await.unwrap_err();

        assert!(matches!(err, StreamError::NotAvailable { .. }));
    }

    #[tokio::test]
    async fn subscribed_key_is_served_from_cache() {
        let (connector, service) = book_service();
        service
            .subscribe(eurusd(), SubscribeParams::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        connector.set_connected(false);
        let snapshot = service.get_snapshot(&eurusd(), Some(1)).await.unwrap();

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.source_time <= Utc::now());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn default_depth_applies_to_subscriptions() {
        let connector = Arc::new(ScriptedConnector::<Symbol, BookLevel>::new());
        connector.set_records(
            &eurusd(),
            vec![BookLevel::bid(dec!(1.1), 1), BookLevel::bid(dec!(1.0), 1)],
        );
        let config = StreamConfig {
            default_depth: Some(1),
            ..StreamConfig::books()
        };
        let service = BookService::new(connector, config);
        let mut rx = service.join(&eurusd());

        service
            .subscribe(eurusd(), SubscribeParams::default())
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.kind(), DeltaKind::Snapshot);
        assert_eq!(
            event.payload,
            crate::domain::streaming::DeltaPayload::Snapshot(vec![BookLevel::bid(dec!(1.1), 1)])
        );
        service.shutdown().await;
    }

    #[tokio::test]
    async fn leaving_an_unsubscribed_key_drops_its_topic() {
        let (_connector, service) = book_service();
        let gbpusd = Symbol::new("GBPUSD");

        drop(service.join(&gbpusd));
        assert!(service.leave(&gbpusd));
        assert_eq!(service.broadcast_stats().topics, 0);

        service
            .subscribe(eurusd(), SubscribeParams::default())
            .await
            .unwrap();
        drop(service.join(&eurusd()));
        assert!(!service.leave(&eurusd()));
        assert_eq!(service.broadcast_stats().topics, 1);

        service.unsubscribe(&eurusd()).await.unwrap();
        assert_eq!(service.broadcast_stats().topics, 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_further_work() {
        let (_connector, service) = book_service();
        service.spawn_connection_monitor();
        service.spawn_connection_monitor();
        service
            .subscribe(eurusd(), SubscribeParams::default())
            .await
            .unwrap();

        service.shutdown().await;

        assert!(service.list_active_keys().is_empty());
        assert_eq!(service.stats().active_subscriptions, 0);
        assert_eq!(
            service.get_snapshot(&eurusd(), None).await.unwrap_err(),
            StreamError::ShuttingDown
        );
    }
}
