//! Control routes and event push adapter for one stream.
//!
//! # Endpoints (relative to the stream prefix)
//!
//! - `GET /` - active keys
//! - `GET /stats` - service and topic statistics
//! - `GET /{key}?depth=N` - current snapshot
//! - `POST /{key}/subscription?depth=N` - subscribe
//! - `DELETE /{key}/subscription` - unsubscribe
//! - `GET /{key}/events` - WebSocket, one JSON text frame per event

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use crate::application::services::StreamService;
use crate::domain::streaming::{Snapshot, StreamKey, StreamRecord};
use crate::domain::subscription::SubscribeParams;
use crate::infrastructure::broadcast::EventReceiver;
use crate::infrastructure::metrics;

use super::response::{
    ApiError, KeysResponse, StatsResponse, SubscriptionResponse,
};

type SharedService<K, R> = Arc<StreamService<K, R>>;

/// Optional depth cap of snapshot and subscribe requests.
#[derive(Debug, Default, Deserialize)]
pub struct DepthQuery {
    /// Levels per side.
    pub depth: Option<usize>,
}

/// Routes for one stream service.
pub fn stream_routes<K: StreamKey, R: StreamRecord>(service: SharedService<K, R>) -> Router {
    Router::new()
        .route("/", get(list_keys::<K, R>))
        .route("/stats", get(stats::<K, R>))
        .route("/{key}", get(snapshot::<K, R>))
        .route(
            "/{key}/subscription",
            post(subscribe::<K, R>).delete(unsubscribe::<K, R>),
        )
        .route("/{key}/events", get(events::<K, R>))
        .with_state(service)
}

fn parse_key<K: StreamKey>(raw: &str) -> Result<K, ApiError> {
    K::parse_key(raw)
        .filter(StreamKey::is_valid)
        .ok_or_else(|| ApiError::invalid_key(raw))
}

async fn list_keys<K: StreamKey, R: StreamRecord>(
    State(service): State<SharedService<K, R>>,
) -> Json<KeysResponse<K>> {
    let keys = service.list_active_keys();
    Json(KeysResponse {
        stream: R::KIND,
        count: keys.len(),
        keys,
    })
}

async fn stats<K: StreamKey, R: StreamRecord>(
    State(service): State<SharedService<K, R>>,
) -> Json<StatsResponse> {
    Json(StatsResponse {
        stream: R::KIND,
        service: service.stats(),
        broadcast: service.broadcast_stats(),
    })
}

async fn snapshot<K: StreamKey, R: StreamRecord>(
    State(service): State<SharedService<K, R>>,
    Path(raw): Path<String>,
    Query(query): Query<DepthQuery>,
) -> Result<Json<Snapshot<K, R>>, ApiError> {
    let key = parse_key::<K>(&raw)?;
    service
        .get_snapshot(&key, query.depth)
        .await
        .map(Json)
        .map_err(|e| ApiError::new(e, raw))
}

async fn subscribe<K: StreamKey, R: StreamRecord>(
    State(service): State<SharedService<K, R>>,
    Path(raw): Path<String>,
    Query(query): Query<DepthQuery>,
) -> Result<Response, ApiError> {
    let key = parse_key::<K>(&raw)?;
    let params = SubscribeParams {
        max_depth: query.depth,
    };

    let receipt = service
        .subscribe(key, params)
        .await
        .map_err(|e| ApiError::new(e, raw))?;

    let status = if receipt.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(SubscriptionResponse::subscribed(receipt))).into_response())
}

async fn unsubscribe<K: StreamKey, R: StreamRecord>(
    State(service): State<SharedService<K, R>>,
    Path(raw): Path<String>,
) -> Result<Json<SubscriptionResponse<K>>, ApiError> {
    let key = parse_key::<K>(&raw)?;
    service
        .unsubscribe(&key)
        .await
        .map(|receipt| Json(SubscriptionResponse::unsubscribed(receipt)))
        .map_err(|e| ApiError::new(e, raw))
}

async fn events<K: StreamKey, R: StreamRecord>(
    State(service): State<SharedService<K, R>>,
    Path(raw): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let key = parse_key::<K>(&raw)?;
    let events = service.join(&key);
    Ok(ws.on_upgrade(move |socket| async move {
        forward_events::<K, R>(socket, &key, events).await;
        service.leave(&key);
    }))
}

/// Push topic events to one WebSocket listener until either side closes.
async fn forward_events<K: StreamKey, R: StreamRecord>(
    socket: WebSocket,
    key: &K,
    mut events: EventReceiver<K, R>,
) {
    let (mut sender, mut receiver) = socket.split();
    tracing::debug!(stream = R::KIND, key = %key, "Listener joined");

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    let text = match serde_json::to_string(&*event) {
                        Ok(text) => text,
                        Err(error) => {
                            tracing::error!(stream = R::KIND, key = %key, error = %error, "Failed to encode event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    metrics::record_listener_lagged(R::KIND, missed);
                    tracing::warn!(stream = R::KIND, key = %key, missed, "Listener lagged, events dropped");
                }
                Err(RecvError::Closed) => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!(stream = R::KIND, key = %key, "Listener left");
}
