//! Database schema management for `sensorflow-rule-engine`.
//!
//! Ensures the reading history and alert tables exist before the engine
//! starts consuming. Applied once on startup from `main.rs`.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the `readings` table used by ingestion and the cold-window
/// fallback query, and the `alerts` table written by the rule engine.
/// Safe to call on every startup; no-op if objects already exist.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Accepted device readings, queried newest-first per device
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readings (
            id            BIGSERIAL PRIMARY KEY,
            device_id     BIGINT           NOT NULL,
            timestamp_utc TIMESTAMPTZ      NOT NULL,
            pressure      DOUBLE PRECISION NOT NULL,
            temperature   DOUBLE PRECISION NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Emitted alerts; instant alerts carry values, sustained alerts the change
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id            BIGSERIAL PRIMARY KEY,
            kind          TEXT             NOT NULL,
            device_id     BIGINT           NOT NULL,
            timestamp_utc TIMESTAMPTZ      NOT NULL,
            reason        TEXT             NOT NULL,
            pressure      DOUBLE PRECISION,
            temperature   DOUBLE PRECISION,
            change        DOUBLE PRECISION
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_readings_device_ts
            ON readings (device_id, timestamp_utc DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // One alert per kind, device and reading timestamp; redelivery relies on it
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_event
            ON alerts (kind, device_id, timestamp_utc);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_alerts_device_id
            ON alerts (device_id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
