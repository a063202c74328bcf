//! # Telemetry History
//!
//! Rolling per-metric buffers feeding the time-series charts.
//!
//! Each tracked metric has a fixed-capacity FIFO (50 points by default); once
//! full, the oldest point is evicted. Points are only recorded while the link is
//! connected, and every buffer is emptied when recording stops so a dead session
//! never shows stale history.
//!
//! Statistics are computed over the buffer at read time. With at most a few
//! dozen points there is nothing to gain from maintaining them incrementally.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::TelemetrySnapshot;
use crate::error::GcsError;

/// Default number of points kept per metric
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Metrics with a rolling history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Metric {
    Altitude,
    Battery,
    GroundSpeed,
    Voltage,
    Rssi,
    Roll,
    Pitch,
    Yaw,
}

impl Metric {
    /// Every tracked metric, in chart order
    pub const ALL: [Metric; 8] = [
        Metric::Altitude,
        Metric::Battery,
        Metric::GroundSpeed,
        Metric::Voltage,
        Metric::Rssi,
        Metric::Roll,
        Metric::Pitch,
        Metric::Yaw,
    ];

    /// Name used by chart consumers (`"groundSpeed"`, `"rssi"`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Altitude => "altitude",
            Metric::Battery => "battery",
            Metric::GroundSpeed => "groundSpeed",
            Metric::Voltage => "voltage",
            Metric::Rssi => "rssi",
            Metric::Roll => "roll",
            Metric::Pitch => "pitch",
            Metric::Yaw => "yaw",
        }
    }

    /// Read this metric out of a snapshot
    pub fn value_of(&self, snapshot: &TelemetrySnapshot) -> f64 {
        match self {
            Metric::Altitude => snapshot.altitude,
            Metric::Battery => snapshot.battery,
            Metric::GroundSpeed => snapshot.ground_speed,
            Metric::Voltage => snapshot.voltage,
            Metric::Rssi => f64::from(snapshot.rssi),
            Metric::Roll => snapshot.roll,
            Metric::Pitch => snapshot.pitch,
            Metric::Yaw => snapshot.yaw,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = GcsError;

    /// Accepts the chart names plus snake_case spellings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "altitude" => Ok(Metric::Altitude),
            "battery" => Ok(Metric::Battery),
            "groundSpeed" | "ground_speed" | "speed" => Ok(Metric::GroundSpeed),
            "voltage" => Ok(Metric::Voltage),
            "rssi" => Ok(Metric::Rssi),
            "roll" => Ok(Metric::Roll),
            "pitch" => Ok(Metric::Pitch),
            "yaw" => Ok(Metric::Yaw),
            other => Err(GcsError::InputValidation(format!("unknown metric '{}'", other))),
        }
    }
}

/// One charted sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Statistics over a buffer's current contents
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryStats {
    pub max: f64,
    pub min: f64,
    pub average: f64,
    pub len: usize,
}

/// Fixed-capacity FIFO of history points
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Create an empty buffer. A zero capacity is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a point, evicting the oldest one when full
    pub fn push(&mut self, point: HistoryPoint) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    /// Points oldest first
    pub fn iter(&self) -> impl Iterator<Item = &HistoryPoint> {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Max, min and mean of the current contents; `None` when empty
    pub fn stats(&self) -> Option<HistoryStats> {
        if self.points.is_empty() {
            return None;
        }

        let mut max = f64::NEG_INFINITY;
        let mut min = f64::INFINITY;
        let mut sum = 0.0;
        for point in &self.points {
            max = max.max(point.value);
            min = min.min(point.value);
            sum += point.value;
        }

        Some(HistoryStats {
            max,
            min,
            average: sum / self.points.len() as f64,
            len: self.points.len(),
        })
    }
}

/// Rolling history for every [`Metric`]
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use skypulse_gcs::telemetry::history::{HistoryStore, Metric};
///
/// let mut store = HistoryStore::new(50);
///
/// // Not recording yet: ignored
/// assert!(!store.append(Metric::Battery, 45.0, Utc::now()));
///
/// store.set_recording(true);
/// assert!(store.append(Metric::Battery, 45.0, Utc::now()));
/// assert_eq!(store.read(Metric::Battery).len(), 1);
///
/// // Stopping clears everything
/// store.set_recording(false);
/// assert!(store.read(Metric::Battery).is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct HistoryStore {
    buffers: HashMap<Metric, HistoryBuffer>,
    recording: bool,
    capacity: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryStore {
    /// Create empty buffers for every metric, not recording
    pub fn new(capacity: usize) -> Self {
        let buffers = Metric::ALL
            .iter()
            .map(|metric| (*metric, HistoryBuffer::new(capacity)))
            .collect();

        Self {
            buffers,
            recording: false,
            capacity: capacity.max(1),
        }
    }

    /// Whether appends are currently accepted
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Follow the connection's liveness
    ///
    /// Turning recording off empties every buffer.
    pub fn set_recording(&mut self, recording: bool) {
        if self.recording && !recording {
            self.clear(None);
            debug!("History recording stopped, buffers cleared");
        } else if !self.recording && recording {
            debug!("History recording started");
        }
        self.recording = recording;
    }

    /// Append one point to a metric's buffer
    ///
    /// Returns `false` (and stores nothing) while not recording.
    pub fn append(&mut self, metric: Metric, value: f64, timestamp: DateTime<Utc>) -> bool {
        if !self.recording {
            return false;
        }

        let capacity = self.capacity;
        self.buffers
            .entry(metric)
            .or_insert_with(|| HistoryBuffer::new(capacity))
            .push(HistoryPoint { timestamp, value });
        true
    }

    /// Append every tracked metric from one snapshot
    pub fn record(&mut self, snapshot: &TelemetrySnapshot, timestamp: DateTime<Utc>) -> bool {
        if !self.recording {
            return false;
        }

        for metric in Metric::ALL {
            self.append(metric, metric.value_of(snapshot), timestamp);
        }
        true
    }

    /// Clear one buffer, or all of them with `None`
    pub fn clear(&mut self, metric: Option<Metric>) {
        match metric {
            Some(metric) => {
                if let Some(buffer) = self.buffers.get_mut(&metric) {
                    buffer.clear();
                }
            }
            None => self.buffers.values_mut().for_each(HistoryBuffer::clear),
        }
    }

    /// Points for one metric, oldest first
    pub fn read(&self, metric: Metric) -> Vec<HistoryPoint> {
        self.buffers
            .get(&metric)
            .map(|buffer| buffer.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Statistics for one metric; `None` when its buffer is empty
    pub fn stats(&self, metric: Metric) -> Option<HistoryStats> {
        self.buffers.get(&metric).and_then(HistoryBuffer::stats)
    }

    /// Per-buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
