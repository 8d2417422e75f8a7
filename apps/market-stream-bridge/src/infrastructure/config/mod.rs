//! Configuration Module
//!
//! Configuration loading for the bridge service.

mod settings;

pub use settings::{
    BridgeConfig, ConfigError, ConnectorKind, ServerSettings, StreamSettings, TimingSettings,
    UpstreamSettings,
};
