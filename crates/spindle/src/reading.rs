// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sensor reading data model.
//!
//! One `Reading` is one sample from one machine. The telemetry fields are
//! fixed at design time; additions are additive (new optional fields).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sensor sample from one machine.
///
/// `sequence` is strictly monotonic per `machine_id` and starts at 1 after a
/// cold install. `timestamp` is non-decreasing per machine; it carries the
/// *intended* sampling instant, not the wall time of delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Machine identifier (short opaque text).
    pub machine_id: String,

    /// Per-machine monotonic sequence number, starting at 1.
    pub sequence: u64,

    /// Sampling instant, microsecond resolution.
    #[serde(with = "timestamp_micros")]
    pub timestamp: DateTime<Utc>,

    /// Telemetry payload, flattened into the wire record.
    #[serde(flatten)]
    pub telemetry: Telemetry,
}

/// Fixed telemetry payload of a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Spindle temperature (degrees C).
    pub temperature: f64,

    /// Spindle speed (RPM).
    pub spindle_speed: f64,

    /// X axis position (mm).
    pub x_pos_mm: f64,

    /// Y axis position (mm).
    pub y_pos_mm: f64,

    /// Z axis position (mm).
    pub z_pos_mm: f64,

    /// Actual feed rate (mm/min).
    pub feed_rate_actual: f64,

    /// Spindle load (percent).
    pub spindle_load_percent: f64,

    /// Controller state text (e.g. "RUNNING", "IDLE").
    pub machine_state: String,

    /// Line number of the active NC program.
    pub active_program_line: u32,

    /// Total power draw (kW).
    pub total_power_kw: f64,
}

/// Serde adapter for the fixed wire timestamp form.
///
/// Always six fractional digits, always UTC with a trailing `Z`:
/// `2026-08-01T09:30:00.123456Z`.
pub mod timestamp_micros {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Wire format string for reading timestamps.
    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}
