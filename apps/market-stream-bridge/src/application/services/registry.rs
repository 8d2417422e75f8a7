//! Subscription Registry
//!
//! Owns the poller lifecycle of one key space: the first subscribe of a key
//! starts its poller, unsubscribe stops it and purges everything held for
//! the key.
//!
//! # Concurrency
//!
//! Lifecycle operations on the same key are serialized by a per-key async
//! gate. Different keys never wait on each other. The gate is only held for
//! subscribe and unsubscribe, never by pollers or queries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::{DeltaEvent, StreamKey, StreamRecord};
use crate::domain::subscription::{SubscribeParams, Subscription, SubscriptionReceipt};
use crate::infrastructure::metrics;

use super::context::StreamContext;
use super::error::StreamError;
use super::poller::Poller;

type Gate = Arc<tokio::sync::Mutex<()>>;

struct PollerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Source of truth for which keys are polled.
pub struct SubscriptionRegistry<K, R> {
    context: Arc<StreamContext<K, R>>,
    pollers: Mutex<HashMap<K, PollerHandle>>,
    gates: Mutex<HashMap<K, Gate>>,
    root: CancellationToken,
}

impl<K: StreamKey, R: StreamRecord> SubscriptionRegistry<K, R> {
    /// Create a registry; pollers get child tokens of `root`.
    #[must_use]
    pub fn new(context: Arc<StreamContext<K, R>>, root: CancellationToken) -> Self {
        Self {
            context,
            pollers: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            root,
        }
    }

    /// Subscribe to `key`, starting its poller on the first subscription.
    ///
    /// Subscribing an already active key succeeds with the existing
    /// subscription and `created == false`.
    ///
    /// # Errors
    ///
    /// - `InvalidKey` if the key can never be polled
    /// - `ConnectionUnavailable` if the upstream is not usable
    /// - `ShuttingDown` after [`Self::shutdown`]
    pub async fn subscribe(
        &self,
        key: K,
        params: SubscribeParams,
    ) -> Result<SubscriptionReceipt<K>, StreamError> {
        if !key.is_valid() {
            return Err(StreamError::InvalidKey {
                key: key.to_string(),
            });
        }
        self.ensure_running()?;
        if !self.context.upstream_connected().await {
            return Err(StreamError::ConnectionUnavailable);
        }

        let gate = self.gate(&key);
        let result = {
            let _guard = gate.lock().await;
            self.subscribe_locked(&key, params)
        };
        self.release_gate(&key, gate);
        result
    }

    fn subscribe_locked(
        &self,
        key: &K,
        params: SubscribeParams,
    ) -> Result<SubscriptionReceipt<K>, StreamError> {
        self.ensure_running()?;

        let subscriptions = &self.context.subscriptions;
        let (subscription, created) = subscriptions.insert_if_absent(key, params);
        if !created {
            return Ok(receipt(&subscription, false));
        }

        let cancel = self.root.child_token();
        let poller = Poller::new(subscription.clone(), Arc::clone(&self.context), cancel.clone());
        let task = tokio::spawn(poller.run());
        self.pollers
            .lock()
            .insert(key.clone(), PollerHandle { cancel, task });

        // shutdown may have drained the poller map while we were spawning
        if self.root.is_cancelled() {
            self.pollers.lock().remove(key);
            subscriptions.remove(key);
            return Err(StreamError::ShuttingDown);
        }

        self.context.stats.record_subscription();
        metrics::set_active_subscriptions(R::KIND, subscriptions.active_count());
        tracing::info!(
            stream = R::KIND,
            key = %key,
            subscription_id = %subscription.id,
            max_depth = ?subscription.max_depth,
            "Subscribed"
        );

        Ok(receipt(&subscription, true))
    }

    /// Unsubscribe from `key`.
    ///
    /// Stops the poller (waiting up to the stop grace period before aborting
    /// it), then removes the subscription, the cached snapshot and the topic.
    /// Listeners receive a final `Clean` before the topic closes.
    ///
    /// # Errors
    ///
    /// - `InvalidKey` if the key can never be polled
    /// - `NotSubscribed` if the key has no active subscription
    pub async fn unsubscribe(&self, key: &K) -> Result<SubscriptionReceipt<K>, StreamError> {
        if !key.is_valid() {
            return Err(StreamError::InvalidKey {
                key: key.to_string(),
            });
        }

        let gate = self.gate(key);
        let result = {
            let _guard = gate.lock().await;
            self.unsubscribe_locked(key).await
        };
        self.release_gate(key, gate);
        result
    }

    async fn unsubscribe_locked(&self, key: &K) -> Result<SubscriptionReceipt<K>, StreamError> {
        let context = &self.context;
        let Some(subscription) = context.subscriptions.deactivate(key) else {
            return Err(StreamError::NotSubscribed {
                key: key.to_string(),
            });
        };

        let handle = self.pollers.lock().remove(key);
        if let Some(handle) = handle {
            stop_poller(key, handle, context.config.stop_grace).await;
        }

        context.subscriptions.remove(key);
        context.cache.remove(key);
        context.hub.publish(DeltaEvent::clean(key.clone()));
        context.hub.close_topic(key);

        context.stats.record_unsubscription();
        metrics::set_active_subscriptions(R::KIND, context.subscriptions.active_count());
        tracing::info!(
            stream = R::KIND,
            key = %key,
            subscription_id = %subscription.id,
            "Unsubscribed"
        );

        Ok(receipt(&subscription, true))
    }

    /// Whether `key` has an active subscription.
    #[must_use]
    pub fn is_subscribed(&self, key: &K) -> bool {
        self.context.subscriptions.is_active(key)
    }

    /// Keys with an active subscription.
    #[must_use]
    pub fn active_keys(&self) -> Vec<K> {
        self.context.subscriptions.active_keys()
    }

    /// Number of running pollers.
    #[must_use]
    pub fn poller_count(&self) -> usize {
        self.pollers.lock().len()
    }

    /// Whether [`Self::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Stop every poller and clear the subscription table, cache and topics.
    pub async fn shutdown(&self) {
        self.root.cancel();

        let handles: Vec<(K, PollerHandle)> = self.pollers.lock().drain().collect();
        let grace = self.context.config.stop_grace;
        let count = handles.len();
        futures::future::join_all(
            handles
                .into_iter()
                .map(|(key, handle)| async move { stop_poller(&key, handle, grace).await }),
        )
        .await;

        let context = &self.context;
        for subscription in context.subscriptions.drain() {
            context.hub.publish(DeltaEvent::clean(subscription.key));
        }
        context.cache.clear();
        context.hub.clear();
        metrics::set_active_subscriptions(R::KIND, 0);

        tracing::info!(stream = R::KIND, pollers = count, "Registry shut down");
    }

    fn ensure_running(&self) -> Result<(), StreamError> {
        if self.root.is_cancelled() {
            Err(StreamError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn gate(&self, key: &K) -> Gate {
        Arc::clone(self.gates.lock().entry(key.clone()).or_default())
    }

    fn release_gate(&self, key: &K, gate: Gate) {
        let mut gates = self.gates.lock();
        drop(gate);
        if gates.get(key).is_some_and(|g| Arc::strong_count(g) == 1) {
            gates.remove(key);
        }
    }
}

async fn stop_poller<K: StreamKey>(key: &K, handle: PollerHandle, grace: Duration) {
    handle.cancel.cancel();
    let abort = handle.task.abort_handle();

    match tokio::time::timeout(grace, handle.task).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::error!(key = %key, error = %error, "Poller task failed");
        }
        Err(_) => {
            tracing::warn!(
                key = %key,
                grace_ms = grace.as_millis(),
                "Poller did not stop in time, aborting"
            );
            abort.abort();
        }
    }
}

fn receipt<K: Clone>(subscription: &Subscription<K>, created: bool) -> SubscriptionReceipt<K> {
    SubscriptionReceipt {
        key: subscription.key.clone(),
        subscription_id: subscription.id,
        subscribed_at: subscription.subscribed_at,
        created,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use tokio::sync::broadcast::error::RecvError;

    use super::*;
    use crate::application::services::context::StreamConfig;
    use crate::domain::streaming::{AccountId, BookLevel, DeltaKind, Position, Symbol};
    use crate::infrastructure::connector::ScriptedConnector;

    fn eurusd() -> Symbol {
        Symbol::new("EURUSD")
    }

    fn book_registry() -> (
        Arc<ScriptedConnector<Symbol, BookLevel>>,
        SubscriptionRegistry<Symbol, BookLevel>,
    ) {
        let connector = Arc::new(ScriptedConnector::<Symbol, BookLevel>::new());
        connector.set_records(&eurusd(), vec![BookLevel::bid(dec!(1.1), 1)]);
        let config = StreamConfig {
            poll_interval: Duration::from_millis(10),
            stop_grace: Duration::from_millis(200),
            ..StreamConfig::books()
        };
        let context = Arc::new(StreamContext::new(connector.clone(), config));
        (connector, SubscriptionRegistry::new(context, CancellationToken::new()))
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let (_connector, registry) = book_registry();

        let first = registry
            .subscribe(eurusd(), SubscribeParams::with_depth(5))
            .await
            .unwrap();
        let second = registry
            .subscribe(eurusd(), SubscribeParams::with_depth(9))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.subscription_id, second.subscription_id);
        assert_eq!(first.subscribed_at, second.subscribed_at);
        assert_eq!(registry.poller_count(), 1);
        assert_eq!(registry.context.stats.snapshot(0).total_subscriptions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn simultaneous_subscribes_start_one_poller() {
        let (_connector, registry) = book_registry();

        let (first, second) = tokio::join!(
            registry.subscribe(eurusd(), SubscribeParams::default()),
            registry.subscribe(eurusd(), SubscribeParams::default())
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert!(first.created ^ second.created);
        assert_eq!(first.subscription_id, second.subscription_id);
        assert_eq!(registry.poller_count(), 1);
        assert_eq!(registry.active_keys(), vec![eurusd()]);
        assert_eq!(registry.context.stats.snapshot(0).total_subscriptions, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_rejects_invalid_key_before_touching_state() {
        let (_connector, registry) = book_registry();

        let err = registry
            .subscribe(Symbol::new("  "), SubscribeParams::default())
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::InvalidKey { .. }));
        assert!(registry.active_keys().is_empty());
    }

    #[tokio::test]
    async fn subscribe_fails_fast_when_disconnected() {
        let (connector, registry) = book_registry();
        connector.set_connected(false);

        let err = registry
            .subscribe(eurusd(), SubscribeParams::default())
            .await
            .unwrap_err();

        assert_eq!(err, StreamError::ConnectionUnavailable);
        assert!(!registry.is_subscribed(&eurusd()));
        assert_eq!(registry.poller_count(), 0);
        assert_eq!(connector.fetch_count(&eurusd()), 0);
    }

    #[tokio::test]
    async fn unsubscribe_tears_everything_down() {
        let (_connector, registry) = book_registry();
        registry
            .subscribe(eurusd(), SubscribeParams::default())
            .await
            .unwrap();
        let mut rx = registry.context.hub.join(&eurusd());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.context.cache.get(&eurusd()).is_some());

        registry.unsubscribe(&eurusd()).await.unwrap();

        assert!(!registry.is_subscribed(&eurusd()));
        assert_eq!(registry.poller_count(), 0);
        assert!(registry.context.cache.get(&eurusd()).is_none());
        assert!(!registry.context.hub.has_topic(&eurusd()));
        assert!(registry.gates.lock().is_empty());

        let mut last = None;
        loop {
            match rx.recv().await {
                Ok(event) => last = Some(event.kind()),
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(_)) => {}
            }
        }
        assert_eq!(last, Some(DeltaKind::Clean));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_key_fails() {
        let (_connector, registry) = book_registry();

        let err = registry.unsubscribe(&eurusd()).await.unwrap_err();

        assert!(matches!(err, StreamError::NotSubscribed { .. }));
    }

    #[tokio::test]
    async fn unsubscribe_cancels_in_flight_fetch() {
        let (connector, registry) = book_registry();
        connector.set_delay(Duration::from_secs(30));
        registry
            .subscribe(eurusd(), SubscribeParams::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        registry.unsubscribe(&eurusd()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(registry.context.cache.is_empty());
    }

    #[tokio::test]
    async fn shutdown_drains_everything() {
        let connector = Arc::new(ScriptedConnector::<AccountId, Position>::new());
        let context = Arc::new(StreamContext::new(connector.clone(), StreamConfig::positions()));
        let registry = SubscriptionRegistry::new(context, CancellationToken::new());
        for login in 1..=3 {
            connector.set_records(&AccountId::new(login), vec![]);
            registry
                .subscribe(AccountId::new(login), SubscribeParams::default())
                .await
                .unwrap();
        }

        registry.shutdown().await;

        assert!(registry.is_shut_down());
        assert_eq!(registry.poller_count(), 0);
        assert!(registry.active_keys().is_empty());
        assert!(registry.context.cache.is_empty());
        assert_eq!(registry.context.hub.stats().topics, 0);
        assert_eq!(
            registry
                .subscribe(AccountId::new(9), SubscribeParams::default())
                .await
                .unwrap_err(),
            StreamError::ShuttingDown
        );
    }
}
