//! Response bodies of the control API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::application::services::{ServiceStats, StreamError};
use crate::domain::subscription::{SubscriptionId, SubscriptionReceipt};
use crate::infrastructure::broadcast::BroadcastStats;

/// Active keys of one stream.
#[derive(Debug, Serialize)]
pub struct KeysResponse<K> {
    /// Stream kind.
    pub stream: &'static str,
    /// Active keys.
    pub keys: Vec<K>,
    /// Number of active keys.
    pub count: usize,
}

/// Statistics of one stream.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Stream kind.
    pub stream: &'static str,
    /// Subscription and update counters.
    #[serde(flatten)]
    pub service: ServiceStats,
    /// Topic and listener counts.
    pub broadcast: BroadcastStats,
}

/// Outcome of a subscribe or unsubscribe call.
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse<K> {
    /// Always true.
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
    /// Key the call applied to.
    pub key: K,
    /// Subscription id.
    pub subscription_id: SubscriptionId,
    /// False when the key was already subscribed.
    pub created: bool,
    /// When the call completed.
    pub timestamp: DateTime<Utc>,
}

impl<K: std::fmt::Display> SubscriptionResponse<K> {
    /// Body for a subscribe receipt.
    #[must_use]
    pub fn subscribed(receipt: SubscriptionReceipt<K>) -> Self {
        let message = receipt.subscribe_message();
        Self::from_receipt(receipt, message)
    }

    /// Body for an unsubscribe receipt.
    #[must_use]
    pub fn unsubscribed(receipt: SubscriptionReceipt<K>) -> Self {
        let message = receipt.unsubscribe_message();
        Self::from_receipt(receipt, message)
    }

    fn from_receipt(receipt: SubscriptionReceipt<K>, message: String) -> Self {
        Self {
            success: true,
            message,
            key: receipt.key,
            subscription_id: receipt.subscription_id,
            created: receipt.created,
            timestamp: receipt.timestamp,
        }
    }
}

/// Error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Always false.
    pub success: bool,
    /// What went wrong.
    pub message: String,
    /// Key as sent by the caller.
    pub key: String,
    /// When the error was produced.
    pub timestamp: DateTime<Utc>,
}

/// A [`StreamError`] bound to the key text of the request.
#[derive(Debug)]
pub struct ApiError {
    error: StreamError,
    key: String,
}

impl ApiError {
    /// Wrap a service error.
    #[must_use]
    pub fn new(error: StreamError, key: impl Into<String>) -> Self {
        Self {
            error,
            key: key.into(),
        }
    }

    /// Error for key text that cannot be parsed.
    #[must_use]
    pub fn invalid_key(raw: &str) -> Self {
        Self::new(
            StreamError::InvalidKey {
                key: raw.to_string(),
            },
            raw,
        )
    }

    /// HTTP status for the wrapped error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self.error {
            StreamError::InvalidKey { .. } => StatusCode::BAD_REQUEST,
            StreamError::NotSubscribed { .. } => StatusCode::NOT_FOUND,
            StreamError::ConnectionUnavailable
            | StreamError::NotAvailable { .. }
            | StreamError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            success: false,
            message: self.error.to_string(),
            key: self.key,
            timestamp: Utc::now(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::application::ports::ConnectorError;

    #[test_case(StreamError::InvalidKey { key: String::new() }, StatusCode::BAD_REQUEST ; "invalid key")]
    #[test_case(StreamError::NotSubscribed { key: "X".into() }, StatusCode::NOT_FOUND ; "not subscribed")]
    #[test_case(StreamError::ConnectionUnavailable, StatusCode::SERVICE_UNAVAILABLE ; "disconnected")]
    #[test_case(
        StreamError::NotAvailable { key: "X".into(), reason: ConnectorError::Disconnected },
        StatusCode::SERVICE_UNAVAILABLE ;
        "not available"
    )]
    #[test_case(StreamError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE ; "shutting down")]
    fn error_status(error: StreamError, expected: StatusCode) {
        assert_eq!(ApiError::new(error, "X").status(), expected);
    }
}
