// src/routes/health.rs
//! Liveness and engine counters.
//!
//! `/health` is used by container orchestrators to check the service
//! responds; it touches neither the database nor the queue. `/stats` returns
//! the rule engine counters as JSON.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::consumer::StatsSnapshot;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

/// Create a subrouter containing the `/health` and `/stats` routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
}
