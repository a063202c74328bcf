//! # SkyPulse GCS Library
//!
//! Telemetry session layer for a ground-control station.
//!
//! This library turns the asynchronous event stream of a vehicle link into
//! state that many display surfaces can consume safely: the connection
//! lifecycle with timeout and cancellation, new-device detection, a single
//! current-telemetry register with subscriber fan-out, and rolling history
//! buffers for charts.

pub mod config;
pub mod error;
pub mod link;
pub mod session;
pub mod settings;
pub mod telemetry;
