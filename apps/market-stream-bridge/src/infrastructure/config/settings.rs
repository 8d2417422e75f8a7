//! Bridge Configuration Settings
//!
//! Configuration types for the stream bridge, loaded from environment variables.

use std::time::Duration;

use crate::application::services::StreamConfig;

/// Which upstream connector the binary wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectorKind {
    /// Pull-only REST upstream.
    #[default]
    Http,
    /// Synthetic data for local development.
    Simulated,
}

impl ConnectorKind {
    /// Parse connector kind from string.
    ///
    /// # Errors
    ///
    /// Returns an error for anything other than `http` or `simulated`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "simulated" => Ok(Self::Simulated),
            other => Err(ConfigError::InvalidValue {
                key: "BRIDGE_CONNECTOR".to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// Get the connector name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Simulated => "simulated",
        }
    }
}

/// Upstream endpoint and credentials.
#[derive(Clone)]
pub struct UpstreamSettings {
    base_url: String,
    token: Option<String>,
}

impl UpstreamSettings {
    /// Create upstream settings.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Base URL without trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Bearer token, if any.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

impl std::fmt::Debug for UpstreamSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSettings")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Timing shared by both key spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSettings {
    /// Upper bound on one upstream call.
    pub fetch_timeout: Duration,
    /// How long unsubscribe waits for a poller before aborting it.
    pub stop_grace: Duration,
    /// Interval between upstream connectivity checks.
    pub connection_check_interval: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        let defaults = StreamConfig::books();
        Self {
            fetch_timeout: defaults.fetch_timeout,
            stop_grace: defaults.stop_grace,
            connection_check_interval: defaults.connection_check_interval,
        }
    }
}

/// Settings of one key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Interval between polls of one key.
    pub poll_interval: Duration,
    /// Ring capacity of each key's topic.
    pub topic_capacity: usize,
    /// Depth applied when a caller does not ask for one.
    pub default_depth: Option<usize>,
}

impl StreamSettings {
    /// Defaults for depth books.
    #[must_use]
    pub const fn books() -> Self {
        Self::from_stream_config(StreamConfig::books())
    }

    /// Defaults for account positions.
    #[must_use]
    pub const fn positions() -> Self {
        Self::from_stream_config(StreamConfig::positions())
    }

    const fn from_stream_config(config: StreamConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            topic_capacity: config.topic_capacity,
            default_depth: config.default_depth,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Control API and WebSocket port.
    pub api_port: u16,
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            api_port: 8090,
            health_port: 8091,
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Connector to wire in.
    pub connector: ConnectorKind,
    /// Upstream endpoint (required for the HTTP connector).
    pub upstream: Option<UpstreamSettings>,
    /// Server port settings.
    pub server: ServerSettings,
    /// Timing shared by both key spaces.
    pub timing: TimingSettings,
    /// Depth book settings.
    pub books: StreamSettings,
    /// Position settings.
    pub positions: StreamSettings,
}

impl BridgeConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value cannot
    /// be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value cannot
    /// be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let connector = env
            .get("BRIDGE_CONNECTOR")
            .map(|s| ConnectorKind::parse(&s))
            .transpose()?
            .unwrap_or_default();

        let upstream = match env.get("BRIDGE_UPSTREAM_URL") {
            Some(url) if url.trim().is_empty() => {
                return Err(ConfigError::EmptyValue("BRIDGE_UPSTREAM_URL".to_string()));
            }
            Some(url) => Some(UpstreamSettings::new(
                url.trim(),
                env.get("BRIDGE_UPSTREAM_TOKEN").filter(|t| !t.is_empty()),
            )),
            None if connector == ConnectorKind::Http => {
                return Err(ConfigError::MissingEnvVar("BRIDGE_UPSTREAM_URL".to_string()));
            }
            None => None,
        };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            api_port: env.parse_or("BRIDGE_API_PORT", server_defaults.api_port)?,
            health_port: env.parse_or("BRIDGE_HEALTH_PORT", server_defaults.health_port)?,
        };

        let timing_defaults = TimingSettings::default();
        let timing = TimingSettings {
            fetch_timeout: env.millis_or("BRIDGE_FETCH_TIMEOUT_MS", timing_defaults.fetch_timeout)?,
            stop_grace: env.millis_or("BRIDGE_STOP_GRACE_MS", timing_defaults.stop_grace)?,
            connection_check_interval: env.millis_or(
                "BRIDGE_CONNECTION_CHECK_INTERVAL_MS",
                timing_defaults.connection_check_interval,
            )?,
        };

        let book_defaults = StreamSettings::books();
        let books = StreamSettings {
            poll_interval: env.millis_or(
                "BRIDGE_BOOK_POLL_INTERVAL_MS",
                book_defaults.poll_interval,
            )?,
            topic_capacity: env.parse_or(
                "BRIDGE_BOOK_TOPIC_CAPACITY",
                book_defaults.topic_capacity,
            )?,
            default_depth: env.parse_opt("BRIDGE_DEFAULT_BOOK_DEPTH")?,
        };

        let position_defaults = StreamSettings::positions();
        let positions = StreamSettings {
            poll_interval: env.millis_or(
                "BRIDGE_POSITION_POLL_INTERVAL_MS",
                position_defaults.poll_interval,
            )?,
            topic_capacity: env.parse_or(
                "BRIDGE_POSITION_TOPIC_CAPACITY",
                position_defaults.topic_capacity,
            )?,
            default_depth: None,
        };

        Ok(Self {
            connector,
            upstream,
            server,
            timing,
            books,
            positions,
        })
    }

    /// Engine configuration for the depth book service.
    #[must_use]
    pub const fn book_stream(&self) -> StreamConfig {
        self.stream_config(self.books)
    }

    /// Engine configuration for the position service.
    #[must_use]
    pub const fn position_stream(&self) -> StreamConfig {
        self.stream_config(self.positions)
    }

    const fn stream_config(&self, settings: StreamSettings) -> StreamConfig {
        StreamConfig {
            poll_interval: settings.poll_interval,
            fetch_timeout: self.timing.fetch_timeout,
            stop_grace: self.timing.stop_grace,
            connection_check_interval: self.timing.connection_check_interval,
            topic_capacity: settings.topic_capacity,
            default_depth: settings.default_depth,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse_opt<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get(key)
            .map(|value| {
                value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    fn millis_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .parse_opt::<u64>(key)?
            .map_or(default, Duration::from_millis))
    }
}
