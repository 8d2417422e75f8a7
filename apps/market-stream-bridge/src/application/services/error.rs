//! Stream service errors.

use crate::application::ports::ConnectorError;

/// Errors returned by the stream service control surface.
///
/// Keys are carried in their display form so the error stays independent of
/// the key space.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The key can never be subscribed or queried.
    #[error("invalid key: {key:?}")]
    InvalidKey {
        /// Offending key text.
        key: String,
    },

    /// The upstream is not usable, nothing was changed.
    #[error("upstream connection unavailable")]
    ConnectionUnavailable,

    /// The key has no active subscription.
    #[error("not subscribed to {key}")]
    NotSubscribed {
        /// Key text.
        key: String,
    },

    /// No real data could be produced for the key.
    #[error("snapshot for {key} not available: {reason}")]
    NotAvailable {
        /// Key text.
        key: String,
        /// Why the upstream could not answer.
        reason: ConnectorError,
    },

    /// The service has been shut down.
    #[error("stream service is shutting down")]
    ShuttingDown,
}

impl StreamError {
    /// Short label used in logs and metric dimensions.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::InvalidKey { .. } => "invalid_key",
            Self::ConnectionUnavailable => "connection_unavailable",
            Self::NotSubscribed { .. } => "not_subscribed",
            Self::NotAvailable { .. } => "not_available",
            Self::ShuttingDown => "shutting_down",
        }
    }
}
