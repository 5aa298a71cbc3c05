//! Batchline HTTP API
//!
//! - `POST /ingest/{channel}` - raw JSON entry for a channel
//! - `GET /health` - engine counters
//!
//! The receiver only reports whether the entry was taken. Grouping and
//! channel errors are logged by the relay and never reach the caller.

use crate::relay::{Relay, RelayStats};
use crate::RelayError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::debug;

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/ingest/{channel}", post(ingest))
        .route("/health", get(health))
        .with_state(relay)
}

async fn ingest(
    State(relay): State<Arc<Relay>>,
    Path(channel): Path<String>,
    body: String,
) -> Response {
    match relay.ingest(&channel, &body) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(RelayError::NotAccepting) => {
            (StatusCode::SERVICE_UNAVAILABLE, "not accepting entries").into_response()
        }
        Err(e) => {
            debug!(channel = %channel, error = %e, "Entry dropped after acceptance");
            StatusCode::ACCEPTED.into_response()
        }
    }
}

async fn health(State(relay): State<Arc<Relay>>) -> Json<RelayStats> {
    Json(relay.stats().await)
}
