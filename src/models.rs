//! Data models for the rule engine: readings, history points and alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// ---

/// Raw telemetry packet as posted by a device, before validation.
///
/// Every field is optional so that a structurally incomplete packet is
/// reported as a validation failure rather than a generic decode error.
#[derive(Debug, Deserialize)]
pub struct RawReading {
    // ---
    pub device_id: Option<i64>,
    pub timestamp: Option<String>,
    pub pressure: Option<f64>,
    pub temperature: Option<f64>,
}

/// One validated device telemetry sample.
///
/// This is also the queue payload: `timestamp` travels as an RFC-3339 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    // ---
    pub device_id: i64,
    pub timestamp: DateTime<Utc>,
    /// Megapascals.
    pub pressure: f64,
    /// Degrees Celsius.
    pub temperature: f64,
}

/// The subset of a stored reading needed by the sustained rule.
#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct HistoryPoint {
    // ---
    pub timestamp: DateTime<Utc>,
    pub pressure: f64,
}

/// Rule-specific payload of an alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    // ---
    Instant { pressure: f64, temperature: f64 },
    Sustained { change: f64 },
}

/// An alert produced by the rule evaluator and written once to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    // ---
    pub device_id: i64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(flatten)]
    pub kind: AlertKind,
}

impl RawReading {
    // ---
    /// Validate a posted packet into a [`Reading`].
    ///
    /// Rejects non-positive device ids, negative pressure or temperature,
    /// and missing or non RFC-3339 timestamps.
    pub fn validate(&self) -> Result<Reading, ValidationError> {
        // ---
        let device_id = match self.device_id {
            Some(id) if id > 0 => id,
            other => return Err(ValidationError::DeviceId(other)),
        };

        let raw_ts = self
            .timestamp
            .as_deref()
            .filter(|ts| !ts.is_empty())
            .ok_or(ValidationError::MissingTimestamp)?;
        let timestamp = DateTime::parse_from_rfc3339(raw_ts)
            .map_err(|e| ValidationError::Timestamp(raw_ts.to_string(), e))?
            .with_timezone(&Utc);

        let pressure = self.pressure.ok_or(ValidationError::MissingField("pressure"))?;
        if pressure < 0.0 {
            return Err(ValidationError::NegativePressure(pressure));
        }

        let temperature = self
            .temperature
            .ok_or(ValidationError::MissingField("temperature"))?;
        if temperature < 0.0 {
            return Err(ValidationError::NegativeTemperature(temperature));
        }

        Ok(Reading {
            device_id,
            timestamp,
            pressure,
            temperature,
        })
    }
}

impl Reading {
    // ---
    pub fn to_history_point(&self) -> HistoryPoint {
        HistoryPoint {
            timestamp: self.timestamp,
            pressure: self.pressure,
        }
    }
}

impl Alert {
    // ---
    /// Short label used for storage and log fields.
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            AlertKind::Instant { .. } => "instant",
            AlertKind::Sustained { .. } => "sustained",
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn create_test_raw_reading(pressure: f64, temperature: f64) -> RawReading {
        // ---
        RawReading {
            device_id: Some(7),
            timestamp: Some("2025-03-26T18:45:00Z".to_string()),
            pressure: Some(pressure),
            temperature: Some(temperature),
        }
    }

    #[test]
    fn test_valid_reading_passes() {
        // ---
        let reading = create_test_raw_reading(0.05, 21.5).validate().unwrap();

        assert_eq!(reading.device_id, 7);
        assert_eq!(reading.pressure, 0.05);
        assert_eq!(reading.temperature, 21.5);
        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap()
        );
    }

    #[test]
    fn test_timestamp_offset_normalized_to_utc() {
        // ---
        let mut raw = create_test_raw_reading(0.05, 21.5);
        raw.timestamp = Some("2025-03-26T21:45:00+03:00".to_string());

        let reading = raw.validate().unwrap();
        assert_eq!(reading.timestamp.hour(), 18);
    }

    #[test]
    fn test_device_id_must_be_positive() {
        // ---
        let mut raw = create_test_raw_reading(0.05, 21.5);
        raw.device_id = Some(0);
        assert!(matches!(raw.validate(), Err(ValidationError::DeviceId(Some(0)))));

        raw.device_id = None;
        assert!(matches!(raw.validate(), Err(ValidationError::DeviceId(None))));
    }

    #[test]
    fn test_negative_values_rejected() {
        // ---
        let negative_pressure = create_test_raw_reading(-0.01, 21.5);
        assert!(matches!(
            negative_pressure.validate(),
            Err(ValidationError::NegativePressure(_))
        ));

        let negative_temp = create_test_raw_reading(0.05, -1.0);
        assert!(matches!(
            negative_temp.validate(),
            Err(ValidationError::NegativeTemperature(_))
        ));

        // Zero is a legal value for both
        assert!(create_test_raw_reading(0.0, 0.0).validate().is_ok());
    }

    #[test]
    fn test_bad_timestamps_rejected() {
        // ---
        let mut raw = create_test_raw_reading(0.05, 21.5);
        raw.timestamp = Some("26/03/2025 18:45".to_string());
        assert!(matches!(raw.validate(), Err(ValidationError::Timestamp(..))));

        raw.timestamp = Some(String::new());
        assert!(matches!(raw.validate(), Err(ValidationError::MissingTimestamp)));

        // No timezone designator
        raw.timestamp = Some("2025-03-26T18:45:00".to_string());
        assert!(matches!(raw.validate(), Err(ValidationError::Timestamp(..))));
    }

    #[test]
    fn test_reading_wire_format() {
        // ---
        let body = r#"{"device_id":3,"timestamp":"2025-01-01T12:00:00Z","pressure":0.051,"temperature":19.0}"#;
        let reading: Reading = serde_json::from_str(body).unwrap();

        assert_eq!(reading.device_id, 3);
        assert_eq!(reading.pressure, 0.051);

        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["timestamp"], "2025-01-01T12:00:00Z");
    }

    #[test]
    fn test_alert_serializes_flat() {
        // ---
        let alert = Alert {
            device_id: 1,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
            reason: "rapid pressure decrease".to_string(),
            kind: AlertKind::Sustained { change: -0.5 },
        };

        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["kind"], "sustained");
        assert_eq!(json["change"], -0.5);
        assert_eq!(alert.kind_label(), "sustained");
    }
}
