//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `StreamService`: Control surface of one key space
//! - `SubscriptionRegistry`: Poller lifecycle per key
//! - `Poller`: Poll, diff, cache and publish loop for one key
//! - `ConnectionMonitor`: Resync signals on upstream disconnect/reconnect
//! - `SnapshotCache`, `StatsAggregator`: Shared state behind the above

mod cache;
mod connection_monitor;
mod context;
mod error;
mod poller;
mod registry;
mod stats;
mod stream_service;

pub use cache::SnapshotCache;
pub use connection_monitor::{ConnectionEvent, ConnectionMonitor};
pub use context::{ResyncEpoch, StreamConfig, StreamContext};
pub use error::StreamError;
pub use poller::Poller;
pub use registry::SubscriptionRegistry;
pub use stats::{ServiceStats, StatsAggregator};
pub use stream_service::{BookService, PositionService, StreamService};
