//! Rule engine for device telemetry.
//!
//! Readings posted to the ingestion route are persisted and queued; consumer
//! tasks evaluate each reading against the instant threshold rule and the
//! sustained pressure-trend rule, using a per-device window cache with a
//! store fallback while the cache is cold, and write resulting alerts.
//!
//! Module layout follows the Explicit Module Boundary Pattern (EMBP): this
//! file is the gateway, siblings import shared types through it.

pub mod config;
pub mod consumer;
pub mod error;
pub mod models;
pub mod queue;
pub mod routes;
pub mod rules;
pub mod schema;
pub mod store;
pub mod window;

pub use config::Config;
pub use consumer::{AckStrategy, EngineSettings, RuleEngine, StreamConsumer};
pub use error::{ConsumerError, ProcessError, QueueError, StoreError, ValidationError};
pub use models::{Alert, AlertKind, HistoryPoint, RawReading, Reading};
pub use store::{HistoryStore, MemoryStore, PgHistoryStore};
pub use window::{WindowCache, WindowSnapshot};
