use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use crate::consumer::EngineStats;
use crate::queue::Publisher;
use crate::store::HistoryStore;

mod health;
mod packets;

// ---

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    // ---
    pub store: Arc<dyn HistoryStore>,
    pub publisher: Publisher,
    pub stats: Arc<EngineStats>,
    /// Deadline for the ingestion insert.
    pub store_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(packets::router())
        .merge(health::router())
        .with_state(state)
}
