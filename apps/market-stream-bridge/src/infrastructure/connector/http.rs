//! HTTP connector for the pull-only REST upstream.
//!
//! # Endpoints
//!
//! - `GET /health` → `{"connected": bool}`
//! - `GET /books/{symbol}?depth=N` → `{symbol, time?, bids: [{price, volume}], asks: [...]}`
//! - `GET /accounts/{login}/positions` → `{time?, positions: [...]}`
//!
//! Requests carry the bearer token when one is configured. There is no retry
//! here; the poller's next cycle is the retry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::application::ports::{ConnectorError, SnapshotConnector};
use crate::domain::streaming::{AccountId, BookLevel, Position, Snapshot, Symbol};
use crate::infrastructure::config::UpstreamSettings;

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct HealthResponse {
    connected: bool,
}

#[derive(Debug, Deserialize)]
struct LevelDto {
    price: Decimal,
    volume: i64,
}

#[derive(Debug, Deserialize)]
struct BookResponse {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
    #[serde(default)]
    bids: Vec<LevelDto>,
    #[serde(default)]
    asks: Vec<LevelDto>,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    time: Option<DateTime<Utc>>,
    positions: Vec<Position>,
}

// =============================================================================
// Connector
// =============================================================================

/// REST client for the upstream; serves both key spaces.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
    base_url: Url,
    token: Option<String>,
    timeout: Duration,
}

impl HttpConnector {
    /// Create a connector; every request is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the client cannot be
    /// built.
    pub fn new(settings: &UpstreamSettings, timeout: Duration) -> Result<Self, ConnectorError> {
        let base_url = Url::parse(settings.base_url())
            .map_err(|e| ConnectorError::Transport(format!("invalid upstream url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ConnectorError::Transport(format!(
                "invalid upstream url: {base_url}"
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            token: settings.token().map(str::to_string),
            timeout,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, ConnectorError> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| self.transport_error(&e))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(&e))?;

        if !status.is_success() {
            let message = String::from_utf8_lossy(&body).trim().to_string();
            return Err(ConnectorError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&body).map_err(|e| ConnectorError::Decode(e.to_string()))
    }

    fn transport_error(&self, error: &reqwest::Error) -> ConnectorError {
        if error.is_timeout() {
            ConnectorError::Timeout(self.timeout)
        } else {
            ConnectorError::Transport(error.to_string())
        }
    }

    /// Ask the upstream whether its session is usable.
    ///
    /// Any failure to answer counts as disconnected.
    pub async fn health(&self) -> bool {
        match self.get_json::<HealthResponse>(self.url(&["health"]), &[]).await {
            Ok(health) => health.connected,
            Err(error) => {
                tracing::debug!(error = %error, "Upstream health check failed");
                false
            }
        }
    }

    /// Fetch the depth book of `symbol`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the upstream answers with an
    /// error status, or the body is not a book for `symbol`.
    pub async fn fetch_book(
        &self,
        symbol: &Symbol,
        depth: Option<usize>,
    ) -> Result<Snapshot<Symbol, BookLevel>, ConnectorError> {
        let query: Vec<(&str, String)> = depth.map(|d| ("depth", d.to_string())).into_iter().collect();
        let book: BookResponse = self
            .get_json(self.url(&["books", symbol.as_str()]), &query)
            .await?;

        match book.symbol.as_deref() {
            Some(returned) if returned != symbol.as_str() => {
                return Err(ConnectorError::Decode(format!(
                    "requested book for {symbol}, got {returned}"
                )));
            }
            _ => {}
        }

        let levels = book
            .bids
            .into_iter()
            .map(|l| BookLevel::bid(l.price, l.volume))
            .chain(book.asks.into_iter().map(|l| BookLevel::ask(l.price, l.volume)))
            .collect();

        Ok(Snapshot::new(
            symbol.clone(),
            levels,
            book.time.unwrap_or_else(Utc::now),
        ))
    }

    /// Fetch the open positions of `account`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the upstream answers with an
    /// error status, or the body cannot be decoded.
    pub async fn fetch_positions(
        &self,
        account: AccountId,
    ) -> Result<Snapshot<AccountId, Position>, ConnectorError> {
        let login = account.to_string();
        let response: PositionsResponse = self
            .get_json(self.url(&["accounts", &login, "positions"]), &[])
            .await?;

        Ok(Snapshot::new(
            account,
            response.positions,
            response.time.unwrap_or_else(Utc::now),
        ))
    }
}

#[async_trait]
impl SnapshotConnector<Symbol, BookLevel> for HttpConnector {
    async fn is_connected(&self) -> bool {
        self.health().await
    }

    async fn fetch_snapshot(
        &self,
        key: &Symbol,
        depth: Option<usize>,
    ) -> Result<Snapshot<Symbol, BookLevel>, ConnectorError> {
        self.fetch_book(key, depth).await
    }
}

#[async_trait]
impl SnapshotConnector<AccountId, Position> for HttpConnector {
    async fn is_connected(&self) -> bool {
        self.health().await
    }

    async fn fetch_snapshot(
        &self,
        key: &AccountId,
        _depth: Option<usize>,
    ) -> Result<Snapshot<AccountId, Position>, ConnectorError> {
        self.fetch_positions(*key).await
    }
}

// =============================================================================
// Tests
// =============================================================================
