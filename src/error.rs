//! Error taxonomy for the rule engine.
//!
//! Per-message failures are [`ProcessError`]s and never escape the consumer
//! loop; only [`ConsumerError`] ends a consumer task.

use thiserror::Error;

// ---

/// Rejection reasons for a posted packet.
#[derive(Debug, Error)]
pub enum ValidationError {
    // ---
    #[error("device_id must be a positive integer, got {0:?}")]
    DeviceId(Option<i64>),

    #[error("timestamp is required")]
    MissingTimestamp,

    #[error("invalid RFC-3339 timestamp '{0}': {1}")]
    Timestamp(String, chrono::ParseError),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("pressure must be non-negative, got {0}")]
    NegativePressure(f64),

    #[error("temperature must be non-negative, got {0}")]
    NegativeTemperature(f64),
}

/// Failure of a history store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    // ---
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failure while processing a single inbound message.
#[derive(Debug, Error)]
pub enum ProcessError {
    // ---
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("store operation exceeded the {0:?} message deadline")]
    Timeout(std::time::Duration),
}

impl ProcessError {
    // ---
    /// Whether a later attempt at the same message could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessError::Store(_) | ProcessError::Timeout(_))
    }
}

/// Conditions that stop a consumer task.
#[derive(Debug, Error)]
pub enum ConsumerError {
    // ---
    #[error("delivery channel for queue '{0}' closed")]
    ChannelClosed(String),
}

/// Failure to publish onto, or settle a delivery with, the in-process queue.
#[derive(Debug, Error)]
pub enum QueueError {
    // ---
    #[error("queue '{0}' is closed")]
    Closed(String),

    #[error("queue '{0}' is full")]
    Full(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}
