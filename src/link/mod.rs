//! # Link Module
//!
//! The vehicle link as seen from the session layer.
//!
//! This module handles:
//! - The [`Link`] capability trait (connect, disconnect, flight commands, port listing)
//! - Push events from the link ([`LinkEvent`]): port list, connection status, telemetry
//! - Decoding IPC-style JSON event payloads at the boundary
//! - A tokio-serial backed transport ([`serial::SerialLink`])
//!
//! Wire-level protocol decoding is not done here; a decoder attached to the
//! transport pushes `ConnectionStatus` and `TelemetryUpdate` events.

pub mod serial;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{GcsError, Result};
use crate::telemetry::RawTelemetry;

/// IPC channel carrying port list snapshots
pub const CHANNEL_PORTS_UPDATED: &str = "ports-updated";

/// IPC channel carrying connection status changes
pub const CHANNEL_CONNECTION_STATUS: &str = "connection-status";

/// IPC channel carrying telemetry payloads
pub const CHANNEL_TELEMETRY_UPDATE: &str = "telemetry-update";

/// A serial device offered for connection, identified by its path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    /// USB vendor id, lowercase hex (e.g. "0403")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    /// USB product id, lowercase hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    /// Hint that the device looks like a telemetry radio
    #[serde(default)]
    pub is_known_telemetry: bool,
}

impl Port {
    /// Port with only a path
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Friendly name when present, path otherwise
    pub fn display_name(&self) -> &str {
        self.friendly_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.path)
    }
}

/// Outcome reported by the link for a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkResponse {
    pub success: bool,
    pub message: String,
}

impl LinkResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    /// Turn a failed response into `GcsError::Link`
    pub fn into_result(self) -> Result<LinkResponse> {
        if self.success {
            Ok(self)
        } else {
            Err(GcsError::Link(self.message))
        }
    }
}

/// Connection status pushed by the link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(default)]
    pub message: String,
}

/// Events pushed by the link, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Full snapshot of the currently available ports
    PortsUpdated(Vec<Port>),
    /// Liveness confirmed (`connected = true`) or lost
    ConnectionStatus(ConnectionStatus),
    /// A decoded telemetry update, not yet normalised
    TelemetryUpdate(RawTelemetry),
}

impl LinkEvent {
    /// Decode a JSON payload received on a named IPC channel
    ///
    /// # Errors
    ///
    /// Returns `TransientEvent` for unknown channels and malformed payloads.
    ///
    /// # Examples
    ///
    /// ```
    /// use skypulse_gcs::link::LinkEvent;
    ///
    /// let event = LinkEvent::from_json(
    ///     "connection-status",
    ///     r#"{"connected": true, "message": "Heartbeat received"}"#,
    /// )?;
    /// assert!(matches!(event, LinkEvent::ConnectionStatus(s) if s.connected));
    /// # Ok::<(), skypulse_gcs::error::GcsError>(())
    /// ```
    pub fn from_json(channel: &str, payload: &str) -> Result<Self> {
        let malformed =
            |e: serde_json::Error| GcsError::TransientEvent(format!("{} payload: {}", channel, e));

        match channel {
            CHANNEL_PORTS_UPDATED => serde_json::from_str(payload)
                .map(LinkEvent::PortsUpdated)
                .map_err(malformed),
            CHANNEL_CONNECTION_STATUS => serde_json::from_str(payload)
                .map(LinkEvent::ConnectionStatus)
                .map_err(malformed),
            CHANNEL_TELEMETRY_UPDATE => serde_json::from_str(payload)
                .map(LinkEvent::TelemetryUpdate)
                .map_err(malformed),
            other => Err(GcsError::TransientEvent(format!("unknown channel '{}'", other))),
        }
    }
}

/// Decode a channel payload and queue the event for the session
///
/// Unknown channels and malformed payloads are logged and dropped without
/// reaching the session.
///
/// # Returns
///
/// * `Ok(true)` - The event was queued
/// * `Ok(false)` - The payload was dropped
///
/// # Errors
///
/// Returns `SessionClosed` if nothing receives link events any more.
pub async fn forward_payload(
    events: &mpsc::Sender<LinkEvent>,
    channel: &str,
    payload: &str,
) -> Result<bool> {
    let event = match LinkEvent::from_json(channel, payload) {
        Ok(event) => event,
        Err(e) => {
            warn!("Discarding link event: {}", e);
            return Ok(false);
        }
    };

    events.send(event).await.map_err(|_| GcsError::SessionClosed)?;
    Ok(true)
}

/// Request/response side of the vehicle link
///
/// `Err` means the call itself failed (transport error); a completed call that
/// the vehicle side rejected is `Ok` with `success = false`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Link: Send + Sync {
    /// Start connecting; liveness is confirmed later by a `ConnectionStatus` event
    async fn connect(&self, port: &str, baud_rate: u32) -> Result<LinkResponse>;

    /// Close the connection (also aborts a pending connect)
    async fn disconnect(&self) -> Result<LinkResponse>;

    async fn arm(&self) -> Result<LinkResponse>;

    async fn disarm(&self) -> Result<LinkResponse>;

    async fn takeoff(&self, altitude_m: f64) -> Result<LinkResponse>;

    async fn land(&self) -> Result<LinkResponse>;

    /// Currently available ports
    async fn get_ports(&self) -> Result<Vec<Port>>;
}
