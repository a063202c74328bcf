//! # Serial Link
//!
//! Transport-level [`Link`] over a USB serial telemetry radio.
//!
//! This module handles:
//! - Enumerating serial ports and flagging likely telemetry radios
//! - Opening the selected port 8N1 at the requested baud rate
//! - Closing it again on disconnect
//!
//! Liveness and telemetry come from a protocol decoder, which pushes
//! [`LinkEvent`]s through [`SerialLink::event_sender`]. Without one, flight
//! commands are answered with a failed response.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::{debug, info, warn};

use super::{Link, LinkEvent, LinkResponse, Port};
use crate::error::{GcsError, Result};

/// Queue depth for events pushed by an attached decoder
pub const LINK_EVENT_QUEUE_DEPTH: usize = 256;

/// USB vendor ids of common telemetry radios and flight controllers
const KNOWN_TELEMETRY_VENDORS: &[(u16, &str)] = &[
    (0x0403, "FTDI"),           // SiK radios, FTDI cables
    (0x10C4, "Silicon Labs"),   // CP210x bridges (RFD900, HolyBro)
    (0x26AC, "3D Robotics"),    // Pixhawk / 3DR radios
    (0x1209, "ArduPilot"),      // pid.codes ArduPilot boards
    (0x0483, "STMicroelectronics"), // STM32 CDC flight controllers
];

const NO_ENCODER_MESSAGE: &str = "No MAVLink encoder attached to serial link";

/// Whether a USB vendor id belongs to a known telemetry radio
pub fn is_known_telemetry_vendor(vid: u16) -> bool {
    KNOWN_TELEMETRY_VENDORS.iter().any(|(known, _)| *known == vid)
}

/// An open serial device
struct OpenPort {
    path: String,
    // Held open until disconnect; reads belong to the decoder
    _stream: SerialStream,
}

/// Serial-port backed link
pub struct SerialLink {
    open: Mutex<Option<OpenPort>>,
    events: mpsc::Sender<LinkEvent>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink").finish_non_exhaustive()
    }
}

impl SerialLink {
    /// Create a closed link and the receiving end of its event stream
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use skypulse_gcs::link::serial::SerialLink;
    ///
    /// let (link, events) = SerialLink::new();
    /// ```
    pub fn new() -> (Self, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel(LINK_EVENT_QUEUE_DEPTH);
        (
            Self {
                open: Mutex::new(None),
                events: tx,
            },
            rx,
        )
    }

    /// Sender a protocol decoder uses to push status and telemetry events
    pub fn event_sender(&self) -> mpsc::Sender<LinkEvent> {
        self.events.clone()
    }

    /// Hand a decoded `channel` payload to the session
    ///
    /// Malformed payloads are logged and dropped; see [`super::forward_payload`].
    pub async fn push_payload(&self, channel: &str, payload: &str) -> Result<bool> {
        super::forward_payload(&self.events, channel, payload).await
    }

    /// Path of the open port, if any
    pub async fn device_path(&self) -> Option<String> {
        self.open.lock().await.as_ref().map(|p| p.path.clone())
    }

    /// Open a specific serial port, 8N1, no flow control
    ///
    /// # Arguments
    ///
    /// * `path` - Device path (e.g., "/dev/ttyUSB0" or "COM3")
    /// * `baud_rate` - Radio baud rate (e.g., 57600)
    fn open_port(path: &str, baud_rate: u32) -> Result<SerialStream> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| GcsError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }

    /// Convert a system port description into a [`Port`]
    fn describe(info: tokio_serial::SerialPortInfo) -> Port {
        let mut port = Port::new(info.port_name);

        if let SerialPortType::UsbPort(usb) = info.port_type {
            port.vendor_id = Some(format!("{:04x}", usb.vid));
            port.product_id = Some(format!("{:04x}", usb.pid));
            port.is_known_telemetry = is_known_telemetry_vendor(usb.vid);
            port.friendly_name = usb.product.clone().or_else(|| usb.manufacturer.clone());
            port.manufacturer = usb.manufacturer;
            port.serial_number = usb.serial_number;
        }

        port
    }
}

#[async_trait]
impl Link for SerialLink {
    async fn connect(&self, port: &str, baud_rate: u32) -> Result<LinkResponse> {
        let mut open = self.open.lock().await;

        if let Some(current) = open.as_ref() {
            return Ok(LinkResponse::failure(format!(
                "Already connected to {}",
                current.path
            )));
        }

        debug!("Opening serial port {} at {} baud", port, baud_rate);
        match Self::open_port(port, baud_rate) {
            Ok(stream) => {
                info!("Serial port {} opened at {} baud", port, baud_rate);
                *open = Some(OpenPort {
                    path: port.to_string(),
                    _stream: stream,
                });
                Ok(LinkResponse::ok(format!(
                    "Serial port {} opened, waiting for heartbeat",
                    port
                )))
            }
            Err(e) => {
                warn!("{}", e);
                Ok(LinkResponse::failure(e.to_string()))
            }
        }
    }

    async fn disconnect(&self) -> Result<LinkResponse> {
        match self.open.lock().await.take() {
            Some(port) => {
                info!("Closed serial port {}", port.path);
                Ok(LinkResponse::ok(format!("Disconnected from {}", port.path)))
            }
            None => Ok(LinkResponse::ok("Not connected")),
        }
    }

    async fn arm(&self) -> Result<LinkResponse> {
        Ok(LinkResponse::failure(NO_ENCODER_MESSAGE))
    }

    async fn disarm(&self) -> Result<LinkResponse> {
        Ok(LinkResponse::failure(NO_ENCODER_MESSAGE))
    }

    async fn takeoff(&self, _altitude_m: f64) -> Result<LinkResponse> {
        Ok(LinkResponse::failure(NO_ENCODER_MESSAGE))
    }

    async fn land(&self) -> Result<LinkResponse> {
        Ok(LinkResponse::failure(NO_ENCODER_MESSAGE))
    }

    async fn get_ports(&self) -> Result<Vec<Port>> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| GcsError::Serial(format!("Failed to list serial ports: {}", e)))?;

        let mut ports: Vec<Port> = ports.into_iter().map(Self::describe).collect();
        ports.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(ports)
    }
}
