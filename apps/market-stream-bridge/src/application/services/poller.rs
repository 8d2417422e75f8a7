//! Per-key Poller
//!
//! One poller runs per subscribed key. Each cycle it pulls the full snapshot
//! from the upstream, diffs it against the cached one, stores the new
//! snapshot and publishes the resulting events.
//!
//! The cache always holds the full pull. Published events describe the view
//! capped to the subscription's depth, so a listener applying them in order
//! holds the same records `get_snapshot` returns for that depth.
//!
//! # Failure handling
//!
//! A failed or timed-out fetch never ends the loop. It is logged with the
//! number of consecutive failures, metered, and the cache keeps the last good
//! snapshot. No event is published for a failed cycle.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::ports::ConnectorError;
use crate::domain::diff::diff;
use crate::domain::streaming::{Snapshot, StreamKey, StreamRecord};
use crate::domain::subscription::Subscription;
use crate::infrastructure::metrics;

use super::context::StreamContext;

/// Supervised polling loop for one key.
pub struct Poller<K, R> {
    subscription: Subscription<K>,
    context: Arc<StreamContext<K, R>>,
    cancel: CancellationToken,
    published_epoch: u64,
    consecutive_failures: u32,
}

impl<K: StreamKey, R: StreamRecord> Poller<K, R> {
    /// Create a poller for an active subscription.
    #[must_use]
    pub fn new(
        subscription: Subscription<K>,
        context: Arc<StreamContext<K, R>>,
        cancel: CancellationToken,
    ) -> Self {
        let published_epoch = context.epoch.current();
        Self {
            subscription,
            context,
            cancel,
            published_epoch,
            consecutive_failures: 0,
        }
    }

    /// Run until cancelled.
    ///
    /// The first poll happens immediately. Cancellation is observed while
    /// waiting for the next tick and while a fetch is in flight.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut interval = tokio::time::interval(self.context.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(
            stream = R::KIND,
            key = %self.subscription.key,
            subscription_id = %self.subscription.id,
            "Poller started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.poll_once() => {}
            }
        }

        tracing::debug!(
            stream = R::KIND,
            key = %self.subscription.key,
            "Poller stopped"
        );
    }

    async fn poll_once(&mut self) {
        let started = Instant::now();
        let timeout = self.context.config.fetch_timeout;
        let fetch = self
            .context
            .connector
            .fetch_snapshot(&self.subscription.key, None);

        let result = tokio::time::timeout(timeout, fetch)
            .await
            .unwrap_or_else(|_| Err(ConnectorError::Timeout(timeout)));
        metrics::record_poll_duration(R::KIND, started.elapsed());

        match result {
            Ok(snapshot) => self.handle_snapshot(snapshot),
            Err(error) => self.handle_failure(&error),
        }
    }

    fn handle_snapshot(&mut self, mut snapshot: Snapshot<K, R>) {
        if snapshot.key != self.subscription.key {
            self.handle_failure(&ConnectorError::Decode(format!(
                "snapshot for {} returned while polling {}",
                snapshot.key, self.subscription.key
            )));
            return;
        }
        R::normalize(&mut snapshot.records);

        let epoch = self.context.epoch.current();
        let previous = if epoch == self.published_epoch {
            self.context.cache.get(&snapshot.key)
        } else {
            None
        };

        // listeners see the capped view; the cache keeps the full pull
        let depth = self.subscription.max_depth;
        let view = snapshot.capped(depth);
        let events = match previous {
            Some(previous) => diff(Some(&previous.capped(depth)), &view),
            None => diff(None, &view),
        };

        let source_time = snapshot.source_time;
        if !self
            .context
            .cache
            .insert_unless_cancelled(Arc::new(snapshot), &self.cancel)
        {
            return;
        }
        self.published_epoch = epoch;

        if self.consecutive_failures > 0 {
            tracing::info!(
                stream = R::KIND,
                key = %self.subscription.key,
                failures = self.consecutive_failures,
                "Poller recovered"
            );
            self.consecutive_failures = 0;
        }
        metrics::record_poll(R::KIND, "ok");

        self.context.stats.record_updates(events.len(), source_time);
        for event in events {
            self.context.hub.publish(event);
        }
    }

    fn handle_failure(&mut self, error: &ConnectorError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        metrics::record_poll(R::KIND, error.label());

        if self.consecutive_failures == 1 {
            tracing::warn!(
                stream = R::KIND,
                key = %self.subscription.key,
                error = %error,
                "Poll failed, keeping last snapshot"
            );
        } else {
            tracing::debug!(
                stream = R::KIND,
                key = %self.subscription.key,
                error = %error,
                failures = self.consecutive_failures,
                "Poll failed again"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;
    use crate::application::services::context::StreamConfig;
    use crate::domain::diff::apply;
    use crate::domain::streaming::{BookLevel, DeltaKind, DeltaPayload, Symbol};
    use crate::domain::subscription::{SubscribeParams, SubscriptionTable};
    use crate::infrastructure::broadcast::EventReceiver;
    use crate::infrastructure::connector::ScriptedConnector;

    fn eurusd() -> Symbol {
        Symbol::new("EURUSD")
    }

    fn setup(
        levels: Vec<BookLevel>,
        max_depth: Option<usize>,
    ) -> (
        Arc<ScriptedConnector<Symbol, BookLevel>>,
        Arc<StreamContext<Symbol, BookLevel>>,
        Poller<Symbol, BookLevel>,
    ) {
        let connector = Arc::new(ScriptedConnector::<Symbol, BookLevel>::new());
        connector.set_records(&eurusd(), levels);

        let config = StreamConfig {
            fetch_timeout: Duration::from_millis(50),
            ..StreamConfig::books()
        };
        let context = Arc::new(StreamContext::new(connector.clone(), config));

        let table = SubscriptionTable::new();
        let (subscription, _) = table.insert_if_absent(&eurusd(), SubscribeParams { max_depth });
        let poller = Poller::new(subscription, context.clone(), CancellationToken::new());

        (connector, context, poller)
    }

    #[tokio::test]
    async fn first_poll_publishes_capped_snapshot_and_caches_full_book() {
        let (_connector, context, mut poller) = setup(
            vec![
                BookLevel::bid(dec!(1.1000), 1),
                BookLevel::bid(dec!(1.0999), 2),
                BookLevel::bid(dec!(1.0998), 3),
                BookLevel::ask(dec!(1.1001), 4),
            ],
            Some(2),
        );
        let mut rx = context.hub.join(&eurusd());

        poller.poll_once().await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind(), DeltaKind::Snapshot);
        let DeltaPayload::Snapshot(levels) = &event.payload else {
            panic!("expected snapshot payload");
        };
        assert_eq!(levels.len(), 3);
        assert_eq!(context.cache.get(&eurusd()).unwrap().len(), 4);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn later_polls_publish_only_changes() {
        let (connector, context, mut poller) =
            setup(vec![BookLevel::bid(dec!(1.1000), 100)], None);
        poller.poll_once().await;
        let mut rx = context.hub.join(&eurusd());

        connector.set_records(
            &eurusd(),
            vec![BookLevel::bid(dec!(1.1000), 150), BookLevel::bid(dec!(1.0999), 50)],
        );
        poller.poll_once().await;
        poller.poll_once().await;

        assert_eq!(rx.try_recv().unwrap().kind(), DeltaKind::Update);
        assert_eq!(rx.try_recv().unwrap().kind(), DeltaKind::Add);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(context.stats.snapshot(0).total_updates, 3);
    }

    fn drain(
        rx: &mut EventReceiver<Symbol, BookLevel>,
        state: &mut Vec<BookLevel>,
    ) {
        while let Ok(event) = rx.try_recv() {
            apply(state, &event.payload);
        }
        BookLevel::normalize(state);
    }

    #[tokio::test]
    async fn capped_listener_follows_best_level_removal() {
        let (connector, context, mut poller) = setup(
            vec![
                BookLevel::bid(dec!(1.3), 10),
                BookLevel::bid(dec!(1.2), 20),
                BookLevel::bid(dec!(1.1), 30),
            ],
            Some(2),
        );
        let mut rx = context.hub.join(&eurusd());
        let mut book = Vec::new();

        poller.poll_once().await;
        drain(&mut rx, &mut book);
        assert_eq!(book, vec![BookLevel::bid(dec!(1.3), 10), BookLevel::bid(dec!(1.2), 20)]);

        connector.set_records(
            &eurusd(),
            vec![BookLevel::bid(dec!(1.2), 20), BookLevel::bid(dec!(1.1), 30)],
        );
        poller.poll_once().await;
        drain(&mut rx, &mut book);

        let expected = context.cache.get(&eurusd()).unwrap().capped(Some(2));
        assert_eq!(book, expected.records);
        assert_eq!(book, vec![BookLevel::bid(dec!(1.2), 20), BookLevel::bid(dec!(1.1), 30)]);
    }

    #[tokio::test]
    async fn changes_below_the_cap_are_not_published() {
        let (connector, context, mut poller) = setup(
            vec![
                BookLevel::bid(dec!(1.3), 10),
                BookLevel::bid(dec!(1.2), 20),
                BookLevel::bid(dec!(1.1), 30),
            ],
            Some(2),
        );
        poller.poll_once().await;
        let mut rx = context.hub.join(&eurusd());

        connector.set_records(
            &eurusd(),
            vec![
                BookLevel::bid(dec!(1.3), 10),
                BookLevel::bid(dec!(1.2), 20),
                BookLevel::bid(dec!(1.1), 99),
            ],
        );
        poller.poll_once().await;

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(context.cache.get(&eurusd()).unwrap().records[2].volume, 99);
    }

    #[tokio::test]
    async fn failure_keeps_cache_and_publishes_nothing() {
        let (connector, context, mut poller) =
            setup(vec![BookLevel::bid(dec!(1.1000), 100)], None);
        poller.poll_once().await;
        let mut rx = context.hub.join(&eurusd());

        connector.fail_next(&eurusd(), 3);
        for _ in 0..3 {
            poller.poll_once().await;
        }

        assert_eq!(poller.consecutive_failures, 3);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(context.cache.get(&eurusd()).unwrap().records[0].volume, 100);

        poller.poll_once().await;
        assert_eq!(poller.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let (connector, context, mut poller) = setup(vec![BookLevel::bid(dec!(1.1), 1)], None);
        connector.set_delay(Duration::from_millis(500));

        poller.poll_once().await;

        assert_eq!(poller.consecutive_failures, 1);
        assert!(context.cache.is_empty());
    }

    #[tokio::test]
    async fn new_epoch_forces_full_snapshot() {
        let (_connector, context, mut poller) = setup(vec![BookLevel::bid(dec!(1.1), 1)], None);
        poller.poll_once().await;
        let mut rx = context.hub.join(&eurusd());

        context.epoch.bump();
        poller.poll_once().await;
        poller.poll_once().await;

        assert_eq!(rx.try_recv().unwrap().kind(), DeltaKind::Snapshot);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn cancelled_poller_never_writes_cache() {
        let (_connector, context, mut poller) = setup(vec![BookLevel::bid(dec!(1.1), 1)], None);
        poller.cancel.cancel();

        poller.poll_once().await;

        assert!(context.cache.is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (_connector, context, poller) = setup(vec![BookLevel::bid(dec!(1.1), 1)], None);
        let cancel = poller.cancel.clone();

        let task = tokio::spawn(poller.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(context.cache.get(&eurusd()).is_some());
        assert!(context.stats.snapshot(0).last_update_timestamp.unwrap() <= Utc::now());
    }
}
