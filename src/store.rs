//! History store: durable reading history and the alert sink.
//!
//! [`PgHistoryStore`] is the production backend. [`MemoryStore`] keeps
//! everything in process and can inject failures and stalls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::models::{Alert, AlertKind, HistoryPoint, Reading};

// ---

#[async_trait]
pub trait HistoryStore: Send + Sync {
    // ---
    /// Persist an accepted reading.
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError>;

    /// The `limit` most recent readings for a device, newest first.
    async fn find_recent(&self, device_id: i64, limit: usize)
        -> Result<Vec<HistoryPoint>, StoreError>;

    /// Write one alert as a single atomic insert. Writing an alert already
    /// stored for the same kind, device and timestamp is a no-op.
    async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

// ---

/// PostgreSQL-backed store using the `readings` and `alerts` tables.
#[derive(Debug, Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    // ---
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO readings (device_id, timestamp_utc, pressure, temperature)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(reading.device_id)
        .bind(reading.timestamp)
        .bind(reading.pressure)
        .bind(reading.temperature)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_recent(
        &self,
        device_id: i64,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>, StoreError> {
        // ---
        let points = sqlx::query_as::<_, HistoryPoint>(
            r#"
            SELECT timestamp_utc AS timestamp, pressure
            FROM readings
            WHERE device_id = $1
            ORDER BY timestamp_utc DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(points)
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        // ---
        let (pressure, temperature, change) = match alert.kind {
            AlertKind::Instant {
                pressure,
                temperature,
            } => (Some(pressure), Some(temperature), None),
            AlertKind::Sustained { change } => (None, None, Some(change)),
        };

        sqlx::query(
            r#"
            INSERT INTO alerts (
                kind, device_id, timestamp_utc, reason,
                pressure, temperature, change
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (kind, device_id, timestamp_utc) DO NOTHING
            "#,
        )
        .bind(alert.kind_label())
        .bind(alert.device_id)
        .bind(alert.timestamp)
        .bind(&alert.reason)
        .bind(pressure)
        .bind(temperature)
        .bind(change)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}

// ---

/// In-process store.
///
/// `set_failing(true)` makes every operation return
/// [`StoreError::Unavailable`]; `fail_alert_writes` fails only the next few
/// alert writes of one kind; `set_stall` delays every operation, which is
/// how deadline handling is exercised.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    readings: Arc<RwLock<Vec<Reading>>>,
    alerts: Arc<RwLock<Vec<Alert>>>,
    failing: Arc<AtomicBool>,
    stall_ms: Arc<AtomicUsize>,
    find_recent_calls: Arc<AtomicUsize>,
    alert_failures: Arc<Mutex<HashMap<&'static str, usize>>>,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_stall(&self, stall: Duration) {
        let ms = usize::try_from(stall.as_millis()).unwrap_or(usize::MAX);
        self.stall_ms.store(ms, Ordering::SeqCst);
    }

    /// Fail the next `times` alert writes whose kind label is `kind`.
    pub fn fail_alert_writes(&self, kind: &'static str, times: usize) {
        self.alert_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, times);
    }

    fn take_alert_failure(&self, kind: &str) -> bool {
        // ---
        let mut failures = self.alert_failures.lock().unwrap_or_else(PoisonError::into_inner);
        match failures.get_mut(kind) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    /// How many times `find_recent` has been called.
    pub fn find_recent_calls(&self) -> usize {
        self.find_recent_calls.load(Ordering::SeqCst)
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }

    pub async fn readings(&self) -> Vec<Reading> {
        self.readings.read().await.clone()
    }

    async fn gate(&self) -> Result<(), StoreError> {
        // ---
        let stall = self.stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall as u64)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    // ---
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        self.gate().await?;
        self.readings.write().await.push(reading.clone());
        Ok(())
    }

    async fn find_recent(
        &self,
        device_id: i64,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>, StoreError> {
        // ---
        self.find_recent_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;

        let mut points: Vec<HistoryPoint> = self
            .readings
            .read()
            .await
            .iter()
            .filter(|r| r.device_id == device_id)
            .map(Reading::to_history_point)
            .collect();
        points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        points.truncate(limit);
        Ok(points)
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        // ---
        self.gate().await?;
        if self.take_alert_failure(alert.kind_label()) {
            return Err(StoreError::Unavailable(format!(
                "{} alert write set to fail",
                alert.kind_label()
            )));
        }

        let mut alerts = self.alerts.write().await;
        let stored = alerts.iter().any(|a| {
            a.kind_label() == alert.kind_label()
                && a.device_id == alert.device_id
                && a.timestamp == alert.timestamp
        });
        if !stored {
            alerts.push(alert.clone());
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
