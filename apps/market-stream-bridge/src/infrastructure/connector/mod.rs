//! Upstream connector adapters.
//!
//! - `http`: the pull-only REST upstream used in production
//! - `simulated`: synthetic data for local development
//! - `scripted`: in-memory answers for unit tests

pub mod http;
#[cfg(test)]
pub(crate) mod scripted;
pub mod simulated;

pub use http::HttpConnector;
#[cfg(test)]
pub(crate) use scripted::ScriptedConnector;
pub use simulated::SimulatedConnector;
