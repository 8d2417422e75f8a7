//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Per-key broadcast topics for delta events.
pub mod broadcast;

/// Configuration from the environment.
pub mod config;

/// Upstream connectors (HTTP, simulated).
pub mod connector;

/// Health check HTTP endpoint.
pub mod health;

/// Control API and WebSocket push adapter.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
