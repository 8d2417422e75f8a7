//! Connection Monitor
//!
//! Watches upstream connectivity for one key space and tells listeners to
//! resynchronize when it changes.
//!
//! - connected → disconnected: every active key's topic gets `Clean`
//! - disconnected → connected: every active key's topic gets `Sync`, and the
//!   resync epoch is bumped so each poller publishes a full `Snapshot` on its
//!   next successful poll
//!
//! The first observation only establishes the baseline. Each tick also
//! drops topics that lost all listeners while their key is not subscribed.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::{DeltaEvent, StreamKey, StreamRecord};
use crate::infrastructure::metrics;

use super::context::StreamContext;

/// Connectivity transition seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The upstream stopped reporting itself usable.
    Lost,
    /// The upstream is usable again.
    Restored,
}

/// Periodic upstream connectivity check.
pub struct ConnectionMonitor<K, R> {
    context: Arc<StreamContext<K, R>>,
    cancel: CancellationToken,
    last_connected: Option<bool>,
}

impl<K: StreamKey, R: StreamRecord> ConnectionMonitor<K, R> {
    /// Create a monitor.
    #[must_use]
    pub const fn new(context: Arc<StreamContext<K, R>>, cancel: CancellationToken) -> Self {
        Self {
            context,
            cancel,
            last_connected: None,
        }
    }

    /// Run the monitoring loop until cancelled.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.context.config.connection_check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!(stream = R::KIND, "Connection monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    self.check().await;
                    self.prune_idle_topics();
                }
            }
        }
    }

    /// Remove topics whose listeners all left and whose key is not
    /// subscribed.
    pub fn prune_idle_topics(&self) -> usize {
        let active: HashSet<K> = self.context.subscriptions.active_keys().into_iter().collect();
        let removed = self.context.hub.prune_idle(|key| active.contains(key));
        if removed > 0 {
            tracing::debug!(stream = R::KIND, removed, "Pruned idle topics");
        }
        removed
    }

    /// Check connectivity once and signal listeners on a transition.
    pub async fn check(&mut self) -> Option<ConnectionEvent> {
        let connected = self.context.upstream_connected().await;
        metrics::set_upstream_connected(R::KIND, connected);

        let previous = self.last_connected.replace(connected);
        let event = match (previous, connected) {
            (Some(true), false) => ConnectionEvent::Lost,
            (Some(false), true) => ConnectionEvent::Restored,
            _ => return None,
        };

        let keys = self.context.subscriptions.active_keys();
        match event {
            ConnectionEvent::Lost => {
                tracing::warn!(
                    stream = R::KIND,
                    keys = keys.len(),
                    "Upstream disconnected, cleaning listeners"
                );
                for key in keys {
                    self.context.hub.publish(DeltaEvent::clean(key));
                }
            }
            ConnectionEvent::Restored => {
                let epoch = self.context.epoch.bump();
                metrics::record_resync(R::KIND);
                tracing::info!(
                    stream = R::KIND,
                    keys = keys.len(),
                    epoch,
                    "Upstream reconnected, resyncing listeners"
                );
                for key in keys {
                    self.context.hub.publish(DeltaEvent::sync(key));
                }
            }
        }

        Some(event)
    }
}
