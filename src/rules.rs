//! Alert rules: the instant threshold rule and the sustained pressure-trend rule.
//!
//! Both rules are pure. Window resolution (cache or store) is the caller's job;
//! see `consumer::RuleEngine`.

use crate::models::{Alert, AlertKind, HistoryPoint, Reading};

// ---

/// Pressure below this is "pressure low" (MPa).
pub const LOW_PRESSURE: f64 = 0.03;
/// Pressure above this is "pressure high" (MPa).
pub const HIGH_PRESSURE: f64 = 0.07;
/// Temperature at or below this is "temperature low" (°C).
pub const LOW_TEMPERATURE: f64 = 5.0;
/// Temperature above this is "temperature high" (°C).
pub const HIGH_TEMPERATURE: f64 = 40.0;

/// Classification produced by the instant rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstantReason {
    // ---
    PressureLow,
    PressureHigh,
    TemperatureLow,
    TemperatureHigh,
}

impl InstantReason {
    // ---
    pub fn as_str(&self) -> &'static str {
        match self {
            InstantReason::PressureLow => "pressure low",
            InstantReason::PressureHigh => "pressure high",
            InstantReason::TemperatureLow => "temperature low",
            InstantReason::TemperatureHigh => "temperature high",
        }
    }
}

/// Classify a single reading; the first matching condition wins.
pub fn classify_instant(reading: &Reading) -> Option<InstantReason> {
    // ---
    if reading.pressure < LOW_PRESSURE {
        Some(InstantReason::PressureLow)
    } else if reading.pressure > HIGH_PRESSURE {
        Some(InstantReason::PressureHigh)
    } else if reading.temperature <= LOW_TEMPERATURE {
        Some(InstantReason::TemperatureLow)
    } else if reading.temperature > HIGH_TEMPERATURE {
        Some(InstantReason::TemperatureHigh)
    } else {
        None
    }
}

/// Instant rule: an alert when the reading leaves the normal envelope.
pub fn evaluate_instant(reading: &Reading) -> Option<Alert> {
    // ---
    classify_instant(reading).map(|reason| Alert {
        device_id: reading.device_id,
        timestamp: reading.timestamp,
        reason: reason.as_str().to_string(),
        kind: AlertKind::Instant {
            pressure: reading.pressure,
            temperature: reading.temperature,
        },
    })
}

/// Sustained rule parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SustainedRule {
    // ---
    /// Number of readings in the evaluated window.
    pub window_size: usize,
    /// Minimum absolute pressure swing across the window (MPa).
    pub delta_pressure: f64,
}

impl SustainedRule {
    // ---
    /// Pressure change across `window`, newest minus oldest by timestamp.
    ///
    /// Returns `None` unless the window holds exactly `window_size` points.
    /// The window may arrive in any order; it is sorted by timestamp first
    /// (stable, so equal timestamps keep their arrival order).
    pub fn pressure_change(&self, window: &[HistoryPoint]) -> Option<f64> {
        // ---
        if window.len() != self.window_size || window.is_empty() {
            return None;
        }

        let mut ordered = window.to_vec();
        ordered.sort_by_key(|p| p.timestamp);

        let first = ordered.first()?;
        let last = ordered.last()?;
        Some(last.pressure - first.pressure)
    }

    /// Evaluate the trend for `reading` over its device window.
    pub fn evaluate(&self, reading: &Reading, window: &[HistoryPoint]) -> Option<Alert> {
        // ---
        let change = self.pressure_change(window)?;
        if change.abs() < self.delta_pressure {
            return None;
        }

        let direction = if change > 0.0 { "increase" } else { "decrease" };
        Some(Alert {
            device_id: reading.device_id,
            timestamp: reading.timestamp,
            reason: format!("rapid pressure {direction}"),
            kind: AlertKind::Sustained { change },
        })
    }
}
