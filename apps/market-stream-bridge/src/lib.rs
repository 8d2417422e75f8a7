#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Market Stream Bridge - Poll-to-Push Streaming Engine
//!
//! Turns a pull-only upstream that serves full snapshots (depth books per
//! symbol, open positions per account) into per-key push topics. Each
//! subscribed key is polled by its own task; consecutive snapshots are
//! diffed and only the changes are fanned out to listeners.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core streaming logic and data types
//!   - `streaming`: Keys, records, snapshots and delta events
//!   - `diff`: Snapshot comparison
//!   - `subscription`: Subscription tracking
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: The upstream connector interface
//!   - `services`: Registry, pollers, cache, stats, resync
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `connector`: HTTP and simulated upstreams
//!   - `broadcast`: Per-key event topics
//!   - `http`: Control API and WebSocket push adapter
//!   - `config`: Configuration from the environment
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                 ┌──────────┐   ┌──────┐   ┌───────────┐
//! Upstream ◄─poll─┤  Poller  ├──►│ Diff ├──►│ Broadcast ├──► Listener 1
//!  (REST)         │ (per key)│   └──────┘   │  (topic)  ├──► Listener N
//!                 └────┬─────┘              └───────────┘
//!                      ▼
//!                    Cache ──► GetSnapshot
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{
    AccountId, BookEvent, BookLevel, BookSide, BookSnapshot, DeltaEvent, DeltaKind, DeltaPayload,
    Position, PositionEvent, PositionSnapshot, PositionType, Snapshot, StreamKey, StreamRecord,
    Symbol,
};
pub use domain::subscription::{SubscribeParams, SubscriptionId, SubscriptionReceipt};

// Ports and services
pub use application::ports::{ConnectorError, SharedConnector, SnapshotConnector};
pub use application::services::{
    BookService, PositionService, ServiceStats, StreamConfig, StreamError, StreamService,
};

// Infrastructure config
pub use infrastructure::config::{BridgeConfig, ConfigError, ConnectorKind};

// Connectors
pub use infrastructure::connector::{HttpConnector, SimulatedConnector};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerState};
pub use infrastructure::http::{ApiServer, ServerError, create_router};

// Broadcast hub
pub use infrastructure::broadcast::{BroadcastHub, BroadcastStats, EventReceiver};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
