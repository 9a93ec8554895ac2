// src/routes/packets.rs
//! Reading ingestion endpoint.
//!
//! `POST /packets` validates a device packet, persists it to the reading
//! history and publishes it to the rule engine queue. Persisting first means
//! the cold-window fallback query can already see the reading by the time
//! the engine evaluates it.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use tracing::{debug, error, warn};

use super::AppState;
use crate::RawReading;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/packets", post(handler))
}

async fn handler(
    State(state): State<AppState>,
    payload: Result<Json<RawReading>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    // ---
    let Json(raw) = match payload {
        Ok(json) => json,
        Err(e) => {
            warn!("decode error: {}", e);
            return (StatusCode::BAD_REQUEST, "invalid json").into_response();
        }
    };

    let reading = match raw.validate() {
        Ok(reading) => reading,
        Err(e) => {
            warn!(?raw, "validation error: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let insert = tokio::time::timeout(state.store_timeout, state.store.insert_reading(&reading));
    match insert.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(device_id = reading.device_id, "store insert error: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
        Err(_) => {
            error!(device_id = reading.device_id, "store insert timed out");
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    }

    match state.publisher.publish_json(&reading).await {
        Ok(tag) => {
            debug!(device_id = reading.device_id, delivery_tag = tag, "packet accepted");
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => {
            error!(device_id = reading.device_id, "queue publish error: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}
