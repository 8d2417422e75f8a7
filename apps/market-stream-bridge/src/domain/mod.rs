//! Domain Layer - Core streaming types and business logic.
//!
//! This layer contains the snapshot, record and delta event types, the pure
//! diff engine and the subscription table. Nothing here performs I/O.

/// Keys, records, snapshots and delta events.
pub mod streaming;

/// Snapshot comparison producing ordered delta events.
pub mod diff;

/// Subscription tracking.
pub mod subscription;
