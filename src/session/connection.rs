//! # Connection Controller
//!
//! Connection lifecycle state machine: `Idle -> Connecting -> Connected`, with
//! `Failed` as a short-lived detour that recovers to `Idle` by itself.
//!
//! ```text
//!            connect()                 status(connected)
//!   Idle ─────────────────► Connecting ─────────────────► Connected
//!    ▲ ▲                     │   │   │                       │
//!    │ └──── cancel() ───────┘   │   │        status(lost) / │
//!    │                           │   │        disconnect()   │
//!    │   link rejects / timeout  │   │                       │
//!    │          ┌────────────────┘   │                       │
//!    │          ▼                    │                       │
//!    └─(3 s)── Failed ◄──────────────┘                       │
//!    └───────────────────────────────────────────────────────┘
//! ```
//!
//! Link calls run as spawned tasks. Their results come back through the
//! session's event queue tagged with the connect attempt they belong to, and
//! every handler re-checks the current state and attempt before acting, so a
//! late reply from a cancelled or timed-out attempt changes nothing.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::timers::{TimerFired, TimerKind, Timers};
use super::{DeferredReply, Responder, SessionEvent};
use crate::config::{CommandConfig, ConnectionConfig};
use crate::error::{GcsError, Result};
use crate::link::{ConnectionStatus, Link, LinkResponse};
use crate::telemetry::TelemetrySnapshot;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }

    /// States from which a new connect attempt may start
    pub fn accepts_connect(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One state change, as broadcast to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub message: Option<String>,
}

/// Opaque flight command forwarded to the link
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlightCommand {
    Arm,
    Disarm,
    Takeoff { altitude_m: f64 },
    Land,
}

impl fmt::Display for FlightCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlightCommand::Arm => f.write_str("ARM"),
            FlightCommand::Disarm => f.write_str("DISARM"),
            FlightCommand::Takeoff { .. } => f.write_str("TAKEOFF"),
            FlightCommand::Land => f.write_str("LAND"),
        }
    }
}

/// Delays driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimings {
    /// Window for the first heartbeat after the link accepted a connect
    pub connect_timeout: Duration,
    /// Time spent in `Failed` before returning to `Idle`
    pub failed_reset: Duration,
    /// Lifetime of success / link-lost progress lines
    pub status_clear: Duration,
    /// Lifetime of the "cancelled" message
    pub cancel_message_clear: Duration,
}

impl Default for ConnectionTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(30_000),
            failed_reset: Duration::from_millis(3_000),
            status_clear: Duration::from_millis(3_000),
            cancel_message_clear: Duration::from_millis(2_000),
        }
    }
}

impl From<&ConnectionConfig> for ConnectionTimings {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            failed_reset: Duration::from_millis(config.failed_reset_ms),
            status_clear: Duration::from_millis(config.status_clear_ms),
            cancel_message_clear: Duration::from_millis(config.cancel_message_clear_ms),
        }
    }
}

/// Lowest altitude at which a land command is accepted, in metres
pub const DEFAULT_LAND_MIN_ALTITUDE_M: f64 = 1.0;

/// Owner of the connection state
pub struct ConnectionController {
    state: ConnectionState,
    /// Bumped on every connect, cancel and timeout; tags link replies
    attempt: u64,
    link: Arc<dyn Link>,
    events: mpsc::UnboundedSender<SessionEvent>,
    timers: Timers,
    timings: ConnectionTimings,
    land_min_altitude_m: f64,
    progress: Option<String>,
    message: Option<String>,
    transitions: broadcast::Sender<StateTransition>,
}

impl fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionController")
            .field("state", &self.state)
            .field("attempt", &self.attempt)
            .field("timers", &self.timers)
            .finish_non_exhaustive()
    }
}

impl ConnectionController {
    /// Create a controller in `Idle`
    ///
    /// # Arguments
    ///
    /// * `link` - Link used for connect, disconnect and commands
    /// * `events` - Session queue receiving link replies and timer expiries
    /// * `transitions` - Broadcast channel for state changes
    /// * `timings` - Timeout and auto-clear delays
    pub fn new(
        link: Arc<dyn Link>,
        events: mpsc::UnboundedSender<SessionEvent>,
        transitions: broadcast::Sender<StateTransition>,
        timings: ConnectionTimings,
    ) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            link,
            timers: Timers::new(events.clone()),
            events,
            timings,
            land_min_altitude_m: DEFAULT_LAND_MIN_ALTITUDE_M,
            progress: None,
            message: None,
            transitions,
        }
    }

    /// Apply the `[commands]` limits
    pub fn with_command_limits(mut self, commands: &CommandConfig) -> Self {
        self.land_min_altitude_m = commands.land_min_altitude_m;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current step of the connect sequence, if any
    pub fn progress(&self) -> Option<&str> {
        self.progress.as_deref()
    }

    /// Last connection message, if not yet cleared
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether the connect timeout is armed
    pub fn timeout_pending(&self) -> bool {
        self.timers.is_active(TimerKind::ConnectTimeout)
    }

    /// Start a connect attempt
    ///
    /// # Errors
    ///
    /// - `InputValidation`: empty port or zero baud rate (no state change)
    /// - `Busy`: an attempt is in flight or the link is connected (no state change)
    pub fn connect(&mut self, port: &str, baud_rate: u32) -> Result<()> {
        let port = port.trim();
        if port.is_empty() {
            warn!("Connect rejected: no port selected");
            return Err(GcsError::InputValidation("no port selected".to_string()));
        }
        if baud_rate == 0 {
            return Err(GcsError::InputValidation("baud rate must be non-zero".to_string()));
        }
        if !self.state.accepts_connect() {
            warn!("Connect to {} rejected while {}", port, self.state);
            return Err(GcsError::Busy(self.state));
        }

        // A new attempt supersedes the Failed -> Idle recovery
        self.timers.cancel(TimerKind::FailedReset);
        self.attempt += 1;
        let attempt = self.attempt;

        self.set_state(
            ConnectionState::Connecting,
            Some(format!("Connecting to {} at {} baud...", port, baud_rate)),
        );
        self.set_progress("Opening serial port...", None);
        self.timers.start(TimerKind::ConnectTimeout, self.timings.connect_timeout);

        let link = Arc::clone(&self.link);
        let port = port.to_string();
        self.post_when_done(
            async move { link.connect(&port, baud_rate).await },
            move |result| SessionEvent::ConnectReply { attempt, result },
        );
        Ok(())
    }

    /// Handle the link's answer to a connect request
    ///
    /// A reply for a cancelled or timed-out attempt changes nothing, except
    /// that a port it managed to open is closed again unless a newer attempt
    /// is using the link.
    pub fn on_connect_reply(&mut self, attempt: u64, result: Result<LinkResponse>) {
        if attempt != self.attempt || self.state != ConnectionState::Connecting {
            debug!(
                "Ignoring connect reply for attempt {} (current {}, state {})",
                attempt, self.attempt, self.state
            );
            let opened = matches!(&result, Ok(response) if response.success);
            let link_in_use = matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            );
            if opened && !link_in_use {
                self.release_link("stale connect");
            }
            return;
        }

        match result {
            Ok(response) if response.success => {
                info!("Link accepted connect: {}", response.message);
                self.set_progress("Waiting for MAVLink heartbeat...", None);
                self.message = Some("Waiting for telemetry data...".to_string());
            }
            Ok(response) => {
                self.timers.cancel(TimerKind::ConnectTimeout);
                let reason = GcsError::Link(response.message);
                self.set_progress(format!("Connection failed: {}", reason), None);
                self.fail(format!("Connection failed: {}", reason));
            }
            Err(e) => {
                self.timers.cancel(TimerKind::ConnectTimeout);
                self.set_progress(format!("Connection error: {}", e), None);
                self.fail(format!("Connection error: {}", e));
            }
        }
    }

    /// Handle a `connectionStatus` event from the link
    pub fn on_connection_status(&mut self, status: ConnectionStatus) {
        match (status.connected, self.state) {
            (true, ConnectionState::Connecting) => {
                self.timers.cancel(TimerKind::ConnectTimeout);
                let message = non_empty(status.message)
                    .unwrap_or_else(|| "MAVLink connection established".to_string());
                self.set_state(ConnectionState::Connected, Some(message));
                self.timers.start(TimerKind::MessageClear, self.timings.status_clear);
                self.set_progress(
                    "MAVLink heartbeat received - Connection established",
                    Some(self.timings.status_clear),
                );
            }
            (false, ConnectionState::Connected) => {
                let message = non_empty(status.message)
                    .unwrap_or_else(|| "MAVLink connection lost".to_string());
                self.set_state(ConnectionState::Idle, Some(message));
                self.timers.start(TimerKind::MessageClear, self.timings.status_clear);
                self.set_progress("MAVLink connection lost", Some(self.timings.status_clear));
            }
            (connected, state) => {
                debug!("Ignoring connection status connected={} while {}", connected, state);
            }
        }
    }

    /// Handle one of the controller's own timers
    pub fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(fired) {
            return;
        }

        match fired.kind {
            TimerKind::ConnectTimeout => {
                if self.state != ConnectionState::Connecting {
                    debug!("Connect timeout fired while {}, ignoring", self.state);
                    return;
                }
                warn!(
                    "No heartbeat within {} ms, giving up",
                    self.timings.connect_timeout.as_millis()
                );
                // Late replies from this attempt must not apply
                self.attempt += 1;
                self.release_link("timeout");
                self.set_progress("Connection timeout - No MAVLink response", None);
                let reason = GcsError::Timeout(self.timings.connect_timeout.as_millis() as u64);
                self.fail(format!("Connection failed: {}", reason));
            }
            TimerKind::FailedReset => {
                if self.state == ConnectionState::Failed {
                    self.set_state(ConnectionState::Idle, None);
                }
            }
            TimerKind::ProgressClear => self.progress = None,
            TimerKind::MessageClear => self.message = None,
            other => debug!("Timer {:?} is not a connection timer", other),
        }
    }

    /// Abort the attempt in flight
    ///
    /// Goes straight to `Idle`; a heartbeat or link reply arriving later for
    /// this attempt is ignored.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` unless the state is `Connecting`.
    pub fn cancel(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connecting {
            return Err(GcsError::NotReady(format!(
                "no connection attempt to cancel (state: {})",
                self.state
            )));
        }

        self.timers.cancel(TimerKind::ConnectTimeout);
        self.attempt += 1;
        self.set_progress("Cancelling connection...", None);
        self.release_link("cancel");

        self.set_state(ConnectionState::Idle, Some("Connection cancelled".to_string()));
        self.progress = None;
        self.timers
            .start(TimerKind::MessageClear, self.timings.cancel_message_clear);
        Ok(())
    }

    /// Ask the link to disconnect; the reply arrives as a session event
    ///
    /// Returns the rejection to send when not connected.
    pub fn disconnect(&mut self, reply: Responder<LinkResponse>) -> Option<DeferredReply> {
        if self.state != ConnectionState::Connected {
            return Some(DeferredReply::new(
                reply,
                Err(GcsError::NotReady(format!(
                    "nothing to disconnect (state: {})",
                    self.state
                ))),
            ));
        }

        let attempt = self.attempt;
        let link = Arc::clone(&self.link);
        self.post_when_done(
            async move { link.disconnect().await },
            move |result| SessionEvent::DisconnectReply {
                attempt,
                result,
                reply,
            },
        );
        None
    }

    /// Apply the link's answer to a disconnect request
    pub fn on_disconnect_reply(
        &mut self,
        attempt: u64,
        result: Result<LinkResponse>,
        reply: Responder<LinkResponse>,
    ) -> DeferredReply {
        let outcome = result.and_then(LinkResponse::into_result);

        match &outcome {
            Ok(response) if attempt == self.attempt && self.state == ConnectionState::Connected => {
                self.set_state(ConnectionState::Idle, Some(response.message.clone()));
            }
            Ok(_) => debug!("Disconnect completed after the session already left Connected"),
            Err(e) => warn!("Disconnect failed: {}", e),
        }

        DeferredReply::new(reply, outcome)
    }

    /// Check whether a flight command may be sent now
    ///
    /// # Errors
    ///
    /// - `NotReady`: not connected, takeoff while disarmed, land below the minimum altitude
    /// - `InputValidation`: takeoff altitude not a positive number
    pub fn check_command(&self, command: FlightCommand, current: &TelemetrySnapshot) -> Result<()> {
        if !self.state.is_connected() {
            return Err(GcsError::NotReady(format!(
                "{} requires an active connection (state: {})",
                command, self.state
            )));
        }

        match command {
            FlightCommand::Takeoff { altitude_m } => {
                if !altitude_m.is_finite() || altitude_m <= 0.0 {
                    return Err(GcsError::InputValidation(format!(
                        "takeoff altitude must be positive, got {}",
                        altitude_m
                    )));
                }
                if !current.armed {
                    return Err(GcsError::NotReady("vehicle must be armed before takeoff".to_string()));
                }
            }
            FlightCommand::Land => {
                if current.altitude < self.land_min_altitude_m {
                    return Err(GcsError::NotReady(format!(
                        "land requires altitude >= {} m (current {:.1} m)",
                        self.land_min_altitude_m, current.altitude
                    )));
                }
            }
            FlightCommand::Arm | FlightCommand::Disarm => {}
        }

        Ok(())
    }

    /// Forward a flight command to the link
    ///
    /// Precondition failures are returned as a reply to send. Otherwise the
    /// link's answer arrives as a `CommandReply` event. Commands never change
    /// the connection state.
    pub fn command(
        &self,
        command: FlightCommand,
        current: &TelemetrySnapshot,
        reply: Responder<LinkResponse>,
    ) -> Option<DeferredReply> {
        if let Err(e) = self.check_command(command, current) {
            warn!("{} rejected: {}", command, e);
            return Some(DeferredReply::new(reply, Err(e)));
        }

        info!("Sending {} command", command);
        let link = Arc::clone(&self.link);
        self.post_when_done(
            async move {
                match command {
                    FlightCommand::Arm => link.arm().await,
                    FlightCommand::Disarm => link.disarm().await,
                    FlightCommand::Takeoff { altitude_m } => link.takeoff(altitude_m).await,
                    FlightCommand::Land => link.land().await,
                }
            },
            move |result| SessionEvent::CommandReply {
                command,
                result,
                reply,
            },
        );
        None
    }

    fn fail(&mut self, message: String) {
        self.set_state(ConnectionState::Failed, Some(message));
        self.timers.start(TimerKind::FailedReset, self.timings.failed_reset);
    }

    fn set_state(&mut self, to: ConnectionState, message: Option<String>) {
        let from = self.state;
        self.state = to;

        if let Some(message) = &message {
            self.timers.cancel(TimerKind::MessageClear);
            self.message = Some(message.clone());
        }

        match &message {
            Some(message) => info!("Connection {} -> {}: {}", from, to, message),
            None => info!("Connection {} -> {}", from, to),
        }

        // No observers is fine
        let _ = self.transitions.send(StateTransition { from, to, message });
    }

    fn set_progress(&mut self, text: impl Into<String>, clear_after: Option<Duration>) {
        self.progress = Some(text.into());
        self.timers.cancel(TimerKind::ProgressClear);
        if let Some(delay) = clear_after {
            self.timers.start(TimerKind::ProgressClear, delay);
        }
    }

    /// Fire-and-forget disconnect used by cancel and timeout
    fn release_link(&self, reason: &'static str) {
        let link = Arc::clone(&self.link);
        tokio::spawn(async move {
            match link.disconnect().await {
                Ok(response) => debug!("Link released after {}: {}", reason, response.message),
                Err(e) => warn!("Link release after {} failed: {}", reason, e),
            }
        });
    }

    fn post_when_done<Fut, E>(&self, call: Fut, into_event: E)
    where
        Fut: Future<Output = Result<LinkResponse>> + Send + 'static,
        E: FnOnce(Result<LinkResponse>) -> SessionEvent + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = call.await;
            // Session gone: nobody left to apply the result
            let _ = events.send(into_event(result));
        });
    }
}

fn non_empty(message: String) -> Option<String> {
    if message.trim().is_empty() {
        None
    } else {
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mocks::ScriptedLink;
    use crate::link::MockLink;
    use tokio::sync::oneshot;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        controller: ConnectionController,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        transitions: broadcast::Receiver<StateTransition>,
    }

    fn harness(link: Arc<dyn Link>) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let (transitions_tx, transitions_rx) = broadcast::channel(32);
        Harness {
            controller: ConnectionController::new(link, tx, transitions_tx, ConnectionTimings::default()),
            events: rx,
            transitions: transitions_rx,
        }
    }

    impl Harness {
        /// Deliver the next queued event to the controller
        async fn step(&mut self) {
            match self.events.recv().await {
                Some(SessionEvent::ConnectReply { attempt, result }) => {
                    self.controller.on_connect_reply(attempt, result)
                }
                Some(SessionEvent::DisconnectReply { attempt, result, reply }) => {
                    self.controller.on_disconnect_reply(attempt, result, reply).send()
                }
                Some(SessionEvent::Timer(fired)) => self.controller.on_timer(fired),
                _ => panic!("Unexpected session event"),
            }
        }

        fn states(&mut self) -> Vec<ConnectionState> {
            let mut states = Vec::new();
            while let Ok(t) = self.transitions.try_recv() {
                states.push(t.to);
            }
            states
        }

        fn heartbeat(&mut self) {
            self.controller.on_connection_status(ConnectionStatus {
                connected: true,
                message: "Heartbeat received".to_string(),
            });
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_port() {
        let mut h = harness(Arc::new(ScriptedLink::new()));
        let result = h.controller.connect("   ", 57600);
        assert!(matches!(result, Err(GcsError::InputValidation(_))));
        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert!(h.states().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_connect_sequence() {
        let link = ScriptedLink::new();
        let mut h = harness(Arc::new(link.clone()));

        assert_ok!(h.controller.connect("COM3", 57600));
        assert_eq!(h.controller.state(), ConnectionState::Connecting);
        assert!(h.controller.timeout_pending());

        h.step().await; // connect reply
        assert_eq!(h.controller.progress(), Some("Waiting for MAVLink heartbeat..."));

        h.heartbeat();
        assert_eq!(h.controller.state(), ConnectionState::Connected);
        assert!(!h.controller.timeout_pending());
        assert_eq!(h.controller.message(), Some("Heartbeat received"));
        assert_eq!(link.get_calls(), vec!["connect COM3 57600"]);

        // Success line and message clear after 3 s
        h.step().await;
        h.step().await;
        assert_eq!(h.controller.progress(), None);
        assert_eq!(h.controller.message(), None);
        assert_eq!(h.states(), vec![ConnectionState::Connecting, ConnectionState::Connected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_while_connecting_keeps_timer() {
        let mut h = harness(Arc::new(ScriptedLink::new()));
        assert_ok!(h.controller.connect("COM3", 57600));
        h.step().await;
        let message = h.controller.message().map(str::to_string);

        let result = h.controller.connect("COM4", 115200);
        assert!(matches!(result, Err(GcsError::Busy(ConnectionState::Connecting))));
        assert!(h.controller.timeout_pending());
        assert_eq!(h.controller.message().map(str::to_string), message);
        assert_eq!(h.states(), vec![ConnectionState::Connecting]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_rejection_fails_then_recovers() {
        let link = ScriptedLink::new();
        link.push_connect_reply(Ok(LinkResponse::failure("Access denied")));
        let mut h = harness(Arc::new(link));

        assert_ok!(h.controller.connect("COM3", 57600));
        h.step().await;
        assert_eq!(h.controller.state(), ConnectionState::Failed);
        assert!(!h.controller.timeout_pending());
        assert!(h.controller.message().unwrap().contains("Access denied"));

        let before = tokio::time::Instant::now();
        h.step().await; // failed reset
        assert!(before.elapsed() >= Duration::from_secs(3));
        assert!(before.elapsed() < Duration::from_secs(4));
        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert_eq!(
            h.states(),
            vec![ConnectionState::Connecting, ConnectionState::Failed, ConnectionState::Idle]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_fails() {
        let link = ScriptedLink::new();
        link.push_connect_reply(Err(GcsError::Serial("device vanished".to_string())));
        let mut h = harness(Arc::new(link));

        assert_ok!(h.controller.connect("COM3", 57600));
        h.step().await;
        assert_eq!(h.controller.state(), ConnectionState::Failed);
        assert!(h.controller.message().unwrap().contains("device vanished"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_with_timeout_message() {
        let link = ScriptedLink::new();
        let mut h = harness(Arc::new(link.clone()));

        assert_ok!(h.controller.connect("COM3", 57600));
        h.step().await; // link accepted, no heartbeat follows

        let started = tokio::time::Instant::now();
        h.step().await; // timeout
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
        assert_eq!(h.controller.state(), ConnectionState::Failed);
        assert!(h.controller.message().unwrap().to_lowercase().contains("timeout"));

        // Heartbeat after the timeout is stale
        h.heartbeat();
        assert_eq!(h.controller.state(), ConnectionState::Failed);

        h.step().await;
        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert!(link.get_calls().contains(&"disconnect".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_timeout() {
        let link = ScriptedLink::new();
        let mut h = harness(Arc::new(link.clone()));

        assert_ok!(h.controller.connect("COM3", 57600));
        h.step().await;
        assert_ok!(h.controller.cancel());
        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert_eq!(h.controller.message(), Some("Connection cancelled"));
        assert!(!h.controller.timeout_pending());

        // Only the message-clear timer remains
        h.step().await;
        assert_eq!(h.controller.message(), None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.events.try_recv().is_err());

        h.heartbeat();
        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert_eq!(h.states(), vec![ConnectionState::Connecting, ConnectionState::Idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_connect_reply_after_cancel_is_ignored() {
        let link = ScriptedLink::new();
        link.set_connect_delay(Duration::from_secs(5));
        link.push_connect_reply(Ok(LinkResponse::failure("too late")));
        let mut h = harness(Arc::new(link));

        assert_ok!(h.controller.connect("COM3", 57600));
        assert_ok!(h.controller.cancel());

        h.step().await; // message clear (2 s)
        h.step().await; // stale connect reply (5 s)
        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert_eq!(h.states(), vec![ConnectionState::Connecting, ConnectionState::Idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_open_after_cancel_closes_port() {
        let link = ScriptedLink::new();
        link.set_connect_delay(Duration::from_secs(5));
        let mut h = harness(Arc::new(link.clone()));

        assert_ok!(h.controller.connect("COM3", 57600));
        assert_ok!(h.controller.cancel());

        h.step().await; // message clear (2 s)
        h.step().await; // stale but successful connect reply (5 s)
        tokio::time::sleep(Duration::from_millis(1)).await;

        let disconnects = link.get_calls().iter().filter(|c| *c == "disconnect").count();
        assert_eq!(disconnects, 2);
        assert_eq!(h.controller.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_open_keeps_newer_attempt() {
        let link = ScriptedLink::new();
        link.set_connect_delay(Duration::from_secs(5));
        let mut h = harness(Arc::new(link.clone()));

        assert_ok!(h.controller.connect("COM3", 57600));
        assert_ok!(h.controller.cancel());
        assert_ok!(h.controller.connect("COM4", 57600));

        h.step().await; // first attempt's reply (5 s), now stale
        tokio::time::sleep(Duration::from_millis(1)).await;

        let disconnects = link.get_calls().iter().filter(|c| *c == "disconnect").count();
        assert_eq!(disconnects, 1);
        assert_eq!(h.controller.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_cancel_outside_connecting_is_rejected() {
        let mut h = harness(Arc::new(ScriptedLink::new()));
        assert!(matches!(h.controller.cancel(), Err(GcsError::NotReady(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_from_failed_cancels_reset() {
        let link = ScriptedLink::new();
        link.push_connect_reply(Ok(LinkResponse::failure("busy")));
        let mut h = harness(Arc::new(link));

        assert_ok!(h.controller.connect("COM3", 57600));
        h.step().await;
        assert_eq!(h.controller.state(), ConnectionState::Failed);

        assert_ok!(h.controller.connect("COM3", 57600));
        h.step().await; // second connect accepted
        h.heartbeat();
        assert_eq!(h.controller.state(), ConnectionState::Connected);

        // The old reset must not knock us back to Idle
        tokio::time::sleep(Duration::from_secs(10)).await;
        while let Ok(event) = h.events.try_recv() {
            if let SessionEvent::Timer(fired) = event {
                h.controller.on_timer(fired);
            }
        }
        assert_eq!(h.controller.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost_returns_to_idle() {
        let mut h = harness(Arc::new(ScriptedLink::new()));
        assert_ok!(h.controller.connect("COM3", 57600));
        h.step().await;
        h.heartbeat();

        h.controller.on_connection_status(ConnectionStatus {
            connected: false,
            message: String::new(),
        });
        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert_eq!(h.controller.message(), Some("MAVLink connection lost"));
        assert_eq!(h.controller.progress(), Some("MAVLink connection lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_status_while_connecting_is_noop() {
        let mut h = harness(Arc::new(ScriptedLink::new()));
        assert_ok!(h.controller.connect("COM3", 57600));
        h.controller.on_connection_status(ConnectionStatus {
            connected: false,
            message: "Port closed".to_string(),
        });
        assert_eq!(h.controller.state(), ConnectionState::Connecting);
        assert!(h.controller.timeout_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_uses_link_message() {
        let mut link = MockLink::new();
        link.expect_connect()
            .times(1)
            .returning(|_, _| Ok(LinkResponse::ok("Serial port opened")));
        link.expect_disconnect()
            .times(1)
            .returning(|| Ok(LinkResponse::ok("Disconnected from COM3")));
        let mut h = harness(Arc::new(link));

        assert_ok!(h.controller.connect("COM3", 57600));
        h.step().await;
        h.heartbeat();

        let (tx, rx) = oneshot::channel();
        assert!(h.controller.disconnect(tx).is_none());
        h.step().await;

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.message, "Disconnected from COM3");
        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert_eq!(h.controller.message(), Some("Disconnected from COM3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_disconnect_keeps_connected() {
        let mut link = MockLink::new();
        link.expect_connect()
            .returning(|_, _| Ok(LinkResponse::ok("opened")));
        link.expect_disconnect()
            .returning(|| Ok(LinkResponse::failure("port busy")));
        let mut h = harness(Arc::new(link));

        assert_ok!(h.controller.connect("COM3", 57600));
        h.step().await;
        h.heartbeat();

        let (tx, rx) = oneshot::channel();
        assert!(h.controller.disconnect(tx).is_none());
        h.step().await;

        assert!(matches!(rx.await.unwrap(), Err(GcsError::Link(_))));
        assert_eq!(h.controller.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_not_ready() {
        let mut h = harness(Arc::new(ScriptedLink::new()));
        let (tx, rx) = oneshot::channel();
        h.controller.disconnect(tx).expect("rejected while idle").send();
        assert!(matches!(rx.await.unwrap(), Err(GcsError::NotReady(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_preconditions() {
        let mut h = harness(Arc::new(ScriptedLink::new()));
        let grounded = TelemetrySnapshot::default();

        assert_err!(h.controller.check_command(FlightCommand::Arm, &grounded));

        assert_ok!(h.controller.connect("COM3", 57600));
        h.step().await;
        h.heartbeat();

        assert_ok!(h.controller.check_command(FlightCommand::Arm, &grounded));
        assert_ok!(h.controller.check_command(FlightCommand::Disarm, &grounded));

        let takeoff = FlightCommand::Takeoff { altitude_m: 10.0 };
        assert!(matches!(
            h.controller.check_command(takeoff, &grounded),
            Err(GcsError::NotReady(_))
        ));
        let armed = TelemetrySnapshot { armed: true, ..Default::default() };
        assert_ok!(h.controller.check_command(takeoff, &armed));
        assert!(matches!(
            h.controller.check_command(FlightCommand::Takeoff { altitude_m: f64::NAN }, &armed),
            Err(GcsError::InputValidation(_))
        ));

        assert!(matches!(
            h.controller.check_command(FlightCommand::Land, &armed),
            Err(GcsError::NotReady(_))
        ));
        let airborne = TelemetrySnapshot { armed: true, altitude: 12.0, ..Default::default() };
        assert_ok!(h.controller.check_command(FlightCommand::Land, &airborne));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_reply_event_does_not_change_state() {
        let link = ScriptedLink::new();
        let mut h = harness(Arc::new(link.clone()));
        assert_ok!(h.controller.connect("COM3", 57600));
        h.step().await;
        h.heartbeat();

        let (tx, _rx) = oneshot::channel();
        assert!(h
            .controller
            .command(FlightCommand::Arm, &TelemetrySnapshot::default(), tx)
            .is_none());

        match h.events.recv().await {
            Some(SessionEvent::CommandReply { command, result, .. }) => {
                assert_eq!(command, FlightCommand::Arm);
                assert!(result.unwrap().success);
            }
            _ => panic!("Expected CommandReply"),
        }
        assert_eq!(h.controller.state(), ConnectionState::Connected);
        assert!(link.get_calls().contains(&"arm".to_string()));
    }
}
