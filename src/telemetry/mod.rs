//! # Telemetry Module
//!
//! Vehicle telemetry as the session layer sees it.
//!
//! This module handles:
//! - The immutable [`TelemetrySnapshot`] value handed to every consumer
//! - Normalising decoder/IPC payloads ([`RawTelemetry`]) once, at ingestion
//! - The single current-value register with subscriber fan-out ([`hub`])
//! - Fixed-capacity rolling history for charts ([`history`])

pub mod history;
pub mod hub;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Flight mode label used before the vehicle reports one
pub const UNKNOWN_MODE: &str = "UNKNOWN";

/// Battery percentage bounds
const BATTERY_MIN_PERCENT: f64 = 0.0;
const BATTERY_MAX_PERCENT: f64 = 100.0;

/// Throttle percentage bounds
const THROTTLE_MIN_PERCENT: f64 = 0.0;
const THROTTLE_MAX_PERCENT: f64 = 100.0;

/// Largest GPS fix status code
const GPS_STATUS_MAX: i32 = 255;

/// What to do with values outside their physical range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangePolicy {
    /// Clamp battery, throttle, satellites and GPS status into range
    #[default]
    Clamp,
    /// Store values exactly as received
    PassThrough,
}

impl RangePolicy {
    /// Policy selected by the `[telemetry] clamp_ranges` flag
    pub fn from_clamp_flag(clamp: bool) -> Self {
        if clamp {
            RangePolicy::Clamp
        } else {
            RangePolicy::PassThrough
        }
    }
}

/// Telemetry as delivered by a decoder or an IPC payload.
///
/// Every field is optional; nothing here is trusted until
/// [`TelemetrySnapshot::from_raw`] has normalised it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTelemetry {
    pub altitude: Option<f64>,
    /// Legacy name for ground speed, used when `groundSpeed` is absent
    pub speed: Option<f64>,
    pub ground_speed: Option<f64>,
    pub air_speed: Option<f64>,
    pub climb_rate: Option<f64>,
    pub throttle: Option<f64>,
    pub battery: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub gps_alt: Option<f64>,
    pub satellites: Option<f64>,
    pub gps_status: Option<f64>,
    pub heading: Option<f64>,
    pub roll: Option<f64>,
    pub pitch: Option<f64>,
    pub yaw: Option<f64>,
    pub mode: Option<String>,
    pub armed: Option<bool>,
    pub rssi: Option<f64>,
    pub failsafe: Option<bool>,
    pub system_status: Option<f64>,
    pub flight_mode: Option<f64>,
    pub last_heartbeat: Option<f64>,
}

/// One complete telemetry reading.
///
/// Snapshots are replaced whole, never patched. Units: metres, m/s, percent,
/// volts, amperes, degrees, dBm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub altitude: f64,
    pub ground_speed: f64,
    pub air_speed: f64,
    pub climb_rate: f64,
    pub throttle: f64,
    pub battery: f64,
    pub voltage: f64,
    pub current: f64,
    pub gps_lat: f64,
    pub gps_lon: f64,
    pub gps_alt: f64,
    pub satellites: i32,
    pub gps_status: i32,
    pub heading: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub mode: String,
    pub armed: bool,
    pub rssi: i32,
    pub failsafe: bool,
    pub system_status: i32,
    pub flight_mode: i32,
    /// Monotonic milliseconds of the last heartbeat seen by the decoder
    pub last_heartbeat: u64,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            altitude: 0.0,
            ground_speed: 0.0,
            air_speed: 0.0,
            climb_rate: 0.0,
            throttle: 0.0,
            battery: 0.0,
            voltage: 0.0,
            current: 0.0,
            gps_lat: 0.0,
            gps_lon: 0.0,
            gps_alt: 0.0,
            satellites: 0,
            gps_status: 0,
            heading: 0.0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            mode: UNKNOWN_MODE.to_string(),
            armed: false,
            rssi: 0,
            failsafe: false,
            system_status: 0,
            flight_mode: 0,
            last_heartbeat: 0,
        }
    }
}

/// Missing and non-finite numbers read as zero
fn finite(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn integer(value: Option<f64>) -> i32 {
    // `as` saturates at the i32 bounds
    finite(value).round() as i32
}

fn clamp_logged(name: &str, value: f64, min: f64, max: f64) -> f64 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        debug!("Clamped {} from {} to {}", name, value, clamped);
    }
    clamped
}

impl TelemetrySnapshot {
    /// Normalise a raw payload into a complete snapshot
    ///
    /// Missing or NaN numbers become 0, a missing mode becomes `"UNKNOWN"` and
    /// missing flags become `false`. With [`RangePolicy::Clamp`] battery and
    /// throttle are limited to 0..=100, satellites to >= 0 and the GPS status
    /// to 0..=255.
    ///
    /// # Examples
    ///
    /// ```
    /// use skypulse_gcs::telemetry::{RangePolicy, RawTelemetry, TelemetrySnapshot};
    ///
    /// let raw = RawTelemetry { battery: Some(130.0), ..Default::default() };
    /// let snapshot = TelemetrySnapshot::from_raw(raw, RangePolicy::Clamp);
    /// assert_eq!(snapshot.battery, 100.0);
    /// assert_eq!(snapshot.mode, "UNKNOWN");
    /// ```
    pub fn from_raw(raw: RawTelemetry, policy: RangePolicy) -> Self {
        let mut snapshot = Self {
            altitude: finite(raw.altitude),
            ground_speed: finite(raw.ground_speed.or(raw.speed)),
            air_speed: finite(raw.air_speed),
            climb_rate: finite(raw.climb_rate),
            throttle: finite(raw.throttle),
            battery: finite(raw.battery),
            voltage: finite(raw.voltage),
            current: finite(raw.current),
            gps_lat: finite(raw.gps_lat),
            gps_lon: finite(raw.gps_lon),
            gps_alt: finite(raw.gps_alt),
            satellites: integer(raw.satellites),
            gps_status: integer(raw.gps_status),
            heading: finite(raw.heading),
            roll: finite(raw.roll),
            pitch: finite(raw.pitch),
            yaw: finite(raw.yaw),
            mode: raw
                .mode
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_MODE.to_string()),
            armed: raw.armed.unwrap_or(false),
            rssi: integer(raw.rssi),
            failsafe: raw.failsafe.unwrap_or(false),
            system_status: integer(raw.system_status),
            flight_mode: integer(raw.flight_mode),
            last_heartbeat: finite(raw.last_heartbeat).max(0.0) as u64,
        };

        if policy == RangePolicy::Clamp {
            snapshot.battery =
                clamp_logged("battery", snapshot.battery, BATTERY_MIN_PERCENT, BATTERY_MAX_PERCENT);
            snapshot.throttle =
                clamp_logged("throttle", snapshot.throttle, THROTTLE_MIN_PERCENT, THROTTLE_MAX_PERCENT);
            if snapshot.satellites < 0 {
                debug!("Clamped satellites from {} to 0", snapshot.satellites);
                snapshot.satellites = 0;
            }
            snapshot.gps_status = snapshot.gps_status.clamp(0, GPS_STATUS_MAX);
        }

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_snapshot_is_zeroed() {
        let snapshot = TelemetrySnapshot::default();
        assert_eq!(snapshot.altitude, 0.0);
        assert_eq!(snapshot.battery, 0.0);
        assert_eq!(snapshot.mode, UNKNOWN_MODE);
        assert!(!snapshot.armed);
        assert_eq!(snapshot.last_heartbeat, 0);
    }

    #[test]
    fn test_empty_raw_matches_default() {
        let snapshot = TelemetrySnapshot::from_raw(RawTelemetry::default(), RangePolicy::Clamp);
        assert_eq!(snapshot, TelemetrySnapshot::default());
    }

    #[test]
    fn test_non_finite_values_become_zero() {
        let raw = RawTelemetry {
            altitude: Some(f64::NAN),
            voltage: Some(f64::INFINITY),
            roll: Some(f64::NEG_INFINITY),
            ..Default::default()
        };
        let snapshot = TelemetrySnapshot::from_raw(raw, RangePolicy::PassThrough);
        assert_eq!(snapshot.altitude, 0.0);
        assert_eq!(snapshot.voltage, 0.0);
        assert_eq!(snapshot.roll, 0.0);
    }

    #[test]
    fn test_clamp_policy_limits_ranges() {
        let raw = RawTelemetry {
            battery: Some(-5.0),
            throttle: Some(140.0),
            satellites: Some(-3.0),
            gps_status: Some(900.0),
            ..Default::default()
        };
        let snapshot = TelemetrySnapshot::from_raw(raw, RangePolicy::Clamp);
        assert_eq!(snapshot.battery, 0.0);
        assert_eq!(snapshot.throttle, 100.0);
        assert_eq!(snapshot.satellites, 0);
        assert_eq!(snapshot.gps_status, 255);
    }

    #[test]
    fn test_pass_through_keeps_out_of_range_values() {
        let raw = RawTelemetry {
            battery: Some(120.0),
            satellites: Some(-1.0),
            ..Default::default()
        };
        let snapshot = TelemetrySnapshot::from_raw(raw, RangePolicy::PassThrough);
        assert_eq!(snapshot.battery, 120.0);
        assert_eq!(snapshot.satellites, -1);
    }

    #[test]
    fn test_legacy_speed_fills_ground_speed() {
        let raw = RawTelemetry { speed: Some(7.5), ..Default::default() };
        let snapshot = TelemetrySnapshot::from_raw(raw, RangePolicy::Clamp);
        assert_eq!(snapshot.ground_speed, 7.5);

        let raw = RawTelemetry {
            speed: Some(7.5),
            ground_speed: Some(9.0),
            ..Default::default()
        };
        let snapshot = TelemetrySnapshot::from_raw(raw, RangePolicy::Clamp);
        assert_eq!(snapshot.ground_speed, 9.0);
    }

    #[test]
    fn test_blank_mode_reads_unknown() {
        let raw = RawTelemetry { mode: Some("  ".to_string()), ..Default::default() };
        let snapshot = TelemetrySnapshot::from_raw(raw, RangePolicy::Clamp);
        assert_eq!(snapshot.mode, UNKNOWN_MODE);
    }

    #[test]
    fn test_camel_case_payload() {
        let payload = r#"{
            "altitude": 12.5,
            "groundSpeed": 3.0,
            "battery": 45,
            "gpsLat": 41.01,
            "gpsLon": 28.97,
            "satellites": 11,
            "mode": "GUIDED",
            "armed": true,
            "rssi": -67,
            "lastHeartbeat": 123456
        }"#;
        let raw: RawTelemetry = serde_json::from_str(payload).unwrap();
        let snapshot = TelemetrySnapshot::from_raw(raw, RangePolicy::Clamp);
        assert_eq!(snapshot.altitude, 12.5);
        assert_eq!(snapshot.ground_speed, 3.0);
        assert_eq!(snapshot.battery, 45.0);
        assert_eq!(snapshot.satellites, 11);
        assert_eq!(snapshot.mode, "GUIDED");
        assert!(snapshot.armed);
        assert_eq!(snapshot.rssi, -67);
        assert_eq!(snapshot.last_heartbeat, 123_456);
    }
}
