//! Control API and Push Adapter
//!
//! Axum server exposing both stream services: books under `/books` and
//! positions under `/positions`. See [`routes`] for the endpoints of each.

pub mod response;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{BookService, PositionService};

pub use response::{ApiError, ErrorResponse, SubscriptionResponse};
pub use routes::stream_routes;

/// Router serving both stream services.
pub fn create_router(books: Arc<BookService>, positions: Arc<PositionService>) -> Router {
    Router::new()
        .nest("/books", stream_routes(books))
        .nest("/positions", stream_routes(positions))
}

/// HTTP listener errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

/// Serve `router` on `port` until `cancel` fires.
///
/// # Errors
///
/// Returns `ServerError` if binding fails or the server stops with an error.
pub async fn serve(
    name: &'static str,
    port: u16,
    router: Router,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::BindFailed(port, e.to_string()))?;

    tracing::info!(server = name, port, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| ServerError::ServerFailed(e.to_string()))?;

    tracing::info!(server = name, "HTTP server stopped");
    Ok(())
}

/// Control API server.
pub struct ApiServer {
    port: u16,
    router: Router,
    cancel: CancellationToken,
}

impl ApiServer {
    /// Create the server for both services.
    #[must_use]
    pub fn new(
        port: u16,
        books: Arc<BookService>,
        positions: Arc<PositionService>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            router: create_router(books, positions),
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// See [`serve`].
    pub async fn run(self) -> Result<(), ServerError> {
        serve("api", self.port, self.router, self.cancel).await
    }
}
