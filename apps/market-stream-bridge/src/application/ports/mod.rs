//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `SnapshotConnector`: pull-only access to the upstream that owns the
//!   books and positions. It has no push or subscribe primitive; the engine
//!   polls it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::streaming::{
    AccountId, BookLevel, Position, Snapshot, StreamKey, StreamRecord, Symbol,
};

/// Upstream connector error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    /// The upstream session is not usable.
    #[error("upstream disconnected")]
    Disconnected,

    /// The request did not complete in time.
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    /// The upstream answered with an error status.
    #[error("upstream returned {status}: {message}")]
    Upstream {
        /// HTTP-like status code.
        status: u16,
        /// Error details.
        message: String,
    },

    /// The request could not be sent or the response not read.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("upstream response could not be decoded: {0}")]
    Decode(String),
}

impl ConnectorError {
    /// Short label used as a metric dimension.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Timeout(_) => "timeout",
            Self::Upstream { .. } => "upstream",
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
        }
    }
}

/// Pull-only upstream for one key space.
///
/// Implementations must be cheap to call concurrently; every poller and every
/// on-demand query shares one connector instance.
#[async_trait]
pub trait SnapshotConnector<K: StreamKey, R: StreamRecord>: Send + Sync {
    /// Whether the upstream session is currently usable.
    async fn is_connected(&self) -> bool;

    /// Fetch the current state of `key`.
    ///
    /// `depth` is a hint; the caller caps the result itself.
    async fn fetch_snapshot(
        &self,
        key: &K,
        depth: Option<usize>,
    ) -> Result<Snapshot<K, R>, ConnectorError>;
}

/// Shared connector handle.
pub type SharedConnector<K, R> = Arc<dyn SnapshotConnector<K, R>>;

/// Shared depth book connector.
pub type BookConnector = SharedConnector<Symbol, BookLevel>;

/// Shared positions connector.
pub type PositionConnector = SharedConnector<AccountId, Position>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_error_labels() {
        assert_eq!(ConnectorError::Disconnected.label(), "disconnected");
        assert_eq!(ConnectorError::Timeout(Duration::from_secs(1)).label(), "timeout");
        assert_eq!(
            ConnectorError::Upstream {
                status: 500,
                message: "boom".to_string()
            }
            .label(),
            "upstream"
        );
    }

    #[test]
    fn connector_error_display() {
        let err = ConnectorError::Upstream {
            status: 502,
            message: "bad gateway".to_string(),
        };
        assert_eq!(err.to_string(), "upstream returned 502: bad gateway");
    }
}
