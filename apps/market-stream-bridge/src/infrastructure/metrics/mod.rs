//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Polls**: Upstream poll outcomes and durations per stream
//! - **Events**: Delta events published, undelivered and lost to lagging listeners
//! - **Subscriptions**: Active subscription counts
//! - **Upstream**: Connectivity and resync signals
//!
//! Every series carries a `stream` label (`book` or `positions`).
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::DeltaKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling this again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed (e.g. another global
/// recorder is already set).
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "stream_bridge_polls_total",
        "Upstream polls by stream and outcome"
    );
    describe_histogram!(
        "stream_bridge_poll_duration_seconds",
        "Time spent fetching one snapshot from the upstream"
    );

    describe_counter!(
        "stream_bridge_events_published_total",
        "Delta events published by stream and event type"
    );
    describe_counter!(
        "stream_bridge_events_undelivered_total",
        "Delta events published to a key with no listeners"
    );
    describe_counter!(
        "stream_bridge_listener_lagged_total",
        "Delta events a slow listener missed"
    );

    describe_gauge!(
        "stream_bridge_active_subscriptions",
        "Number of actively polled keys"
    );

    describe_gauge!(
        "stream_bridge_upstream_connected",
        "Whether the upstream reports itself usable (1) or not (0)"
    );
    describe_counter!(
        "stream_bridge_resyncs_total",
        "Upstream reconnects that triggered a resync"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one poll outcome; `outcome` is `ok` or a connector error label.
pub fn record_poll(stream: &'static str, outcome: &'static str) {
    counter!(
        "stream_bridge_polls_total",
        "stream" => stream,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record how long one upstream fetch took.
pub fn record_poll_duration(stream: &'static str, duration: Duration) {
    histogram!(
        "stream_bridge_poll_duration_seconds",
        "stream" => stream
    )
    .record(duration.as_secs_f64());
}

/// Record a published delta event.
pub fn record_event_published(stream: &'static str, kind: DeltaKind) {
    counter!(
        "stream_bridge_events_published_total",
        "stream" => stream,
        "event" => kind.as_str()
    )
    .increment(1);
}

/// Record a delta event that reached no listener.
pub fn record_event_undelivered(stream: &'static str) {
    counter!(
        "stream_bridge_events_undelivered_total",
        "stream" => stream
    )
    .increment(1);
}

/// Record events a lagging listener lost.
pub fn record_listener_lagged(stream: &'static str, missed: u64) {
    counter!(
        "stream_bridge_listener_lagged_total",
        "stream" => stream
    )
    .increment(missed);
}

/// Update the active subscription gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(stream: &'static str, count: usize) {
    gauge!(
        "stream_bridge_active_subscriptions",
        "stream" => stream
    )
    .set(count as f64);
}

/// Update the upstream connectivity gauge.
pub fn set_upstream_connected(stream: &'static str, connected: bool) {
    gauge!(
        "stream_bridge_upstream_connected",
        "stream" => stream
    )
    .set(if connected { 1.0 } else { 0.0 });
}

/// Record a resync after an upstream reconnect.
pub fn record_resync(stream: &'static str) {
    counter!(
        "stream_bridge_resyncs_total",
        "stream" => stream
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
