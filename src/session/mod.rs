//! # Session Module
//!
//! The telemetry session: one task that owns the connection state machine, the
//! port watcher, the telemetry hub and the history store.
//!
//! This module handles:
//! - Processing link events, link replies, timer expiries and user requests one
//!   at a time, each to completion
//! - Keeping history recording in step with the connection state
//! - Forwarding radio settings calls to the [`SettingsStore`] untouched
//! - Publishing [`SessionStatus`] on a watch channel and state changes on a
//!   broadcast channel
//! - The cloneable [`SessionHandle`] used by the presentation layer
//!
//! ## Ordering
//!
//! Each loop iteration takes, in priority order, a pending internal event (link
//! replies and timers), then a pending link event, then a request. A link event
//! that was queued before a request is therefore always applied before it.
//!
//! Replies to requests are held until the iteration's status has been
//! published, so a caller that awaited a request never reads an older status.

pub mod connection;
pub mod ports;
pub mod timers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{GcsError, Result};
use crate::link::{Link, LinkEvent, LinkResponse, Port};
use crate::settings::{LocalRadio, MemorySettingsStore, RadioSettings, SettingsStore};
use crate::telemetry::history::{HistoryPoint, HistoryStats, HistoryStore, Metric};
use crate::telemetry::hub::{SubscriberFn, SubscriptionId, TelemetryHub};
use crate::telemetry::{RangePolicy, TelemetrySnapshot};
use self::connection::{
    ConnectionController, ConnectionState, ConnectionTimings, FlightCommand, StateTransition,
};
use self::ports::{PortNotification, PortWatcher};
use self::timers::{TimerFired, TimerKind, Timers};

/// Reply channel for a request that can fail
pub type Responder<T> = oneshot::Sender<Result<T>>;

/// A reply held back until the session has published its status
pub struct DeferredReply(Box<dyn FnOnce() + Send>);

impl DeferredReply {
    pub fn new<T: Send + 'static>(reply: oneshot::Sender<T>, value: T) -> Self {
        Self(Box::new(move || {
            // The caller may have stopped waiting
            let _ = reply.send(value);
        }))
    }

    pub fn send(self) {
        (self.0)()
    }
}

impl std::fmt::Debug for DeferredReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeferredReply")
    }
}

/// Capacity of the state transition broadcast channel
const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Events the session posts to itself
#[derive(Debug)]
pub enum SessionEvent {
    /// Result of `Link::connect` for the given attempt
    ConnectReply {
        attempt: u64,
        result: Result<LinkResponse>,
    },
    /// Result of `Link::disconnect` requested by the user
    DisconnectReply {
        attempt: u64,
        result: Result<LinkResponse>,
        reply: Responder<LinkResponse>,
    },
    /// Result of a flight command
    CommandReply {
        command: FlightCommand,
        result: Result<LinkResponse>,
        reply: Responder<LinkResponse>,
    },
    /// Port list fetched at startup
    InitialPorts(Result<Vec<Port>>),
    Timer(TimerFired),
}

/// Requests sent by [`SessionHandle`]
enum Request {
    Connect {
        port: String,
        baud_rate: u32,
        reply: Responder<()>,
    },
    Cancel {
        reply: Responder<()>,
    },
    Disconnect {
        reply: Responder<LinkResponse>,
    },
    Command {
        command: FlightCommand,
        reply: Responder<LinkResponse>,
    },
    Subscribe {
        callback: SubscriberFn,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Telemetry {
        reply: oneshot::Sender<Arc<TelemetrySnapshot>>,
    },
    History {
        metric: Metric,
        reply: oneshot::Sender<Vec<HistoryPoint>>,
    },
    HistoryStats {
        metric: Metric,
        reply: oneshot::Sender<Option<HistoryStats>>,
    },
    ClearHistory {
        metric: Option<Metric>,
        reply: oneshot::Sender<()>,
    },
    Ports {
        reply: oneshot::Sender<Vec<Port>>,
    },
    AcceptPortNotification {
        reply: oneshot::Sender<Option<PortNotification>>,
    },
    DismissPortNotification {
        reply: oneshot::Sender<Option<PortNotification>>,
    },
    Settings(SettingsRequest),
    Shutdown,
}

/// Radio settings calls passed through to the store
enum SettingsRequest {
    Load {
        reply: Responder<RadioSettings>,
    },
    Save {
        settings: RadioSettings,
        reply: Responder<()>,
    },
    ResetDefaults {
        reply: Responder<RadioSettings>,
    },
    CopyToRemote {
        local: LocalRadio,
        reply: Responder<()>,
    },
    Import {
        path: PathBuf,
        reply: Responder<RadioSettings>,
    },
    Export {
        path: PathBuf,
        settings: RadioSettings,
        reply: Responder<()>,
    },
}

/// Everything a status display needs, republished after every event
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Current step of the connect sequence
    pub progress: Option<String>,
    /// Last connection message (transient)
    pub message: Option<String>,
    /// Result of the last flight command (transient)
    pub command_status: Option<String>,
    /// "New device detected" notification, while showing
    pub port_notification: Option<PortNotification>,
    /// Port last chosen for connecting
    pub selected_port: Option<String>,
}

/// Session-level settings taken from [`Config`]
#[derive(Debug, Clone)]
struct SessionSettings {
    baud_rate: u32,
    auto_connect_known: bool,
    notification_dismiss: Duration,
    command_status_clear: Duration,
    range_policy: RangePolicy,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            baud_rate: config.connection.baud_rate,
            auto_connect_known: config.connection.auto_connect_known,
            notification_dismiss: Duration::from_millis(config.ports.notification_dismiss_ms),
            command_status_clear: Duration::from_millis(config.commands.command_status_clear_ms),
            range_policy: RangePolicy::from_clamp_flag(config.telemetry.clamp_ranges),
        }
    }
}

/// The session task
pub struct Session {
    controller: ConnectionController,
    watcher: PortWatcher,
    hub: TelemetryHub,
    history: HistoryStore,
    /// Notification and command-status timers
    timers: Timers,
    link: Arc<dyn Link>,
    radio_settings: Arc<dyn SettingsStore>,
    internal_tx: mpsc::UnboundedSender<SessionEvent>,
    internal_rx: mpsc::UnboundedReceiver<SessionEvent>,
    link_events: mpsc::Receiver<LinkEvent>,
    link_events_open: bool,
    requests: mpsc::UnboundedReceiver<Request>,
    status: watch::Sender<SessionStatus>,
    /// Replies sent once the current event's status is published
    pending_replies: Vec<DeferredReply>,
    command_status: Option<String>,
    selected_port: Option<String>,
    settings: SessionSettings,
}

impl Session {
    /// Create a session and its first handle
    ///
    /// # Arguments
    ///
    /// * `link` - Link used for connect, disconnect, commands and port listing
    /// * `link_events` - Push events from the same link
    /// * `config` - Validated configuration
    ///
    /// # Returns
    ///
    /// * `(Session, SessionHandle)` - Spawn `session.run()`; use the handle everywhere else
    pub fn new(
        link: Arc<dyn Link>,
        link_events: mpsc::Receiver<LinkEvent>,
        config: &Config,
    ) -> (Self, SessionHandle) {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());

        let controller = ConnectionController::new(
            Arc::clone(&link),
            internal_tx.clone(),
            transitions.clone(),
            ConnectionTimings::from(&config.connection),
        )
        .with_command_limits(&config.commands);

        let session = Self {
            controller,
            watcher: PortWatcher::new(),
            hub: TelemetryHub::new(),
            history: HistoryStore::new(config.history.capacity),
            timers: Timers::new(internal_tx.clone()),
            link,
            radio_settings: Arc::new(MemorySettingsStore::default()),
            internal_tx,
            internal_rx,
            link_events,
            link_events_open: true,
            requests: request_rx,
            status: status_tx,
            pending_replies: Vec::new(),
            command_status: None,
            selected_port: None,
            settings: SessionSettings::from(config),
        };

        let handle = SessionHandle {
            requests: request_tx,
            status: status_rx,
            transitions,
            takeoff_altitude_m: config.commands.takeoff_altitude_m,
        };

        (session, handle)
    }

    /// Use `store` for radio settings instead of the in-memory default
    pub fn with_settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.radio_settings = store;
        self
    }

    /// Run until every handle is dropped or `shutdown` is requested
    pub async fn run(mut self) {
        info!("Telemetry session started");
        self.request_initial_ports();

        loop {
            tokio::select! {
                biased;

                Some(event) = self.internal_rx.recv() => self.handle_event(event),

                event = self.link_events.recv(), if self.link_events_open => match event {
                    Some(event) => self.handle_link_event(event),
                    None => {
                        warn!("Link event stream closed");
                        self.link_events_open = false;
                    }
                },

                request = self.requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
            }

            self.sync_recording();
            self.publish_status();
            for reply in self.pending_replies.drain(..) {
                reply.send();
            }
        }

        info!("Telemetry session stopped");
    }

    fn request_initial_ports(&self) {
        let link = Arc::clone(&self.link);
        let events = self.internal_tx.clone();
        tokio::spawn(async move {
            let ports = link.get_ports().await;
            let _ = events.send(SessionEvent::InitialPorts(ports));
        });
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ConnectReply { attempt, result } => {
                self.controller.on_connect_reply(attempt, result)
            }
            SessionEvent::DisconnectReply {
                attempt,
                result,
                reply,
            } => {
                let reply = self.controller.on_disconnect_reply(attempt, result, reply);
                self.pending_replies.push(reply);
            }
            SessionEvent::CommandReply {
                command,
                result,
                reply,
            } => {
                let outcome = result.and_then(LinkResponse::into_result);
                let status = match &outcome {
                    Ok(response) => response.message.clone(),
                    Err(e) => format!("{} failed: {}", command, e),
                };
                self.set_command_status(status);
                self.reply(reply, outcome);
            }
            SessionEvent::InitialPorts(Ok(ports)) => {
                if self.watcher.seed(ports) {
                    debug!("Port baseline seeded from initial port list");
                }
            }
            SessionEvent::InitialPorts(Err(e)) => warn!("Initial port listing failed: {}", e),
            SessionEvent::Timer(fired) => self.handle_timer(fired),
        }
    }

    fn handle_timer(&mut self, fired: TimerFired) {
        match fired.kind {
            TimerKind::CommandStatusClear => {
                if self.timers.accept(fired) {
                    self.command_status = None;
                }
            }
            TimerKind::PortNotificationDismiss => {
                if self.timers.accept(fired) {
                    self.watcher.dismiss();
                }
            }
            _ => self.controller.on_timer(fired),
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::PortsUpdated(ports) => {
                if self.watcher.update(ports).is_some() {
                    self.timers.start(
                        TimerKind::PortNotificationDismiss,
                        self.settings.notification_dismiss,
                    );
                }
            }
            LinkEvent::ConnectionStatus(status) => {
                self.controller.on_connection_status(status);
                // A lost link must clear history before any further telemetry
                self.sync_recording();
            }
            LinkEvent::TelemetryUpdate(raw) => {
                let snapshot = TelemetrySnapshot::from_raw(raw, self.settings.range_policy);
                self.history.record(&snapshot, Utc::now());

                let failures = self.hub.set_current(snapshot);
                if failures > 0 {
                    debug!("{} telemetry subscribers failed", failures);
                }
            }
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect {
                port,
                baud_rate,
                reply,
            } => {
                let result = self.controller.connect(&port, baud_rate);
                if result.is_ok() {
                    self.selected_port = Some(port.trim().to_string());
                }
                self.reply(reply, result);
            }
            Request::Cancel { reply } => {
                let result = self.controller.cancel();
                self.reply(reply, result);
            }
            Request::Disconnect { reply } => {
                let rejected = self.controller.disconnect(reply);
                self.pending_replies.extend(rejected);
            }
            Request::Command { command, reply } => {
                let current = self.hub.current();
                let rejected = self.controller.command(command, &current, reply);
                self.pending_replies.extend(rejected);
            }
            Request::Subscribe { callback, reply } => {
                let id = self.hub.subscribe_boxed(callback);
                self.reply(reply, id);
            }
            Request::Unsubscribe { id, reply } => {
                let removed = self.hub.unsubscribe(id);
                self.reply(reply, removed);
            }
            Request::Telemetry { reply } => {
                let current = self.hub.current();
                self.reply(reply, current);
            }
            Request::History { metric, reply } => {
                let points = self.history.read(metric);
                self.reply(reply, points);
            }
            Request::HistoryStats { metric, reply } => {
                let stats = self.history.stats(metric);
                self.reply(reply, stats);
            }
            Request::ClearHistory { metric, reply } => {
                self.history.clear(metric);
                self.reply(reply, ());
            }
            Request::Ports { reply } => {
                let ports = self.watcher.previous_ports().to_vec();
                self.reply(reply, ports);
            }
            Request::AcceptPortNotification { reply } => {
                let accepted = self.accept_port_notification();
                self.reply(reply, accepted);
            }
            Request::DismissPortNotification { reply } => {
                self.timers.cancel(TimerKind::PortNotificationDismiss);
                let dismissed = self.watcher.dismiss();
                self.reply(reply, dismissed);
            }
            Request::Settings(request) => self.forward_settings(request),
            // Handled by the run loop
            Request::Shutdown => {}
        }
    }

    fn accept_port_notification(&mut self) -> Option<PortNotification> {
        self.timers.cancel(TimerKind::PortNotificationDismiss);
        let accepted = self.watcher.accept()?;
        self.selected_port = Some(accepted.path.clone());

        if self.settings.auto_connect_known && accepted.is_known_telemetry {
            info!("Auto-connecting to known telemetry radio {}", accepted.path);
            if let Err(e) = self.controller.connect(&accepted.path, self.settings.baud_rate) {
                warn!("Auto-connect to {} skipped: {}", accepted.path, e);
            }
        }

        Some(accepted)
    }

    /// Run a settings call off the session task
    ///
    /// Settings never touch session state, so the reply goes straight back.
    fn forward_settings(&self, request: SettingsRequest) {
        let store = Arc::clone(&self.radio_settings);
        tokio::spawn(async move {
            // Unanswered replies mean the caller stopped waiting
            match request {
                SettingsRequest::Load { reply } => {
                    let _ = reply.send(store.load().await);
                }
                SettingsRequest::Save { settings, reply } => {
                    let _ = reply.send(store.save(settings).await);
                }
                SettingsRequest::ResetDefaults { reply } => {
                    let _ = reply.send(store.reset_defaults().await);
                }
                SettingsRequest::CopyToRemote { local, reply } => {
                    let _ = reply.send(store.copy_to_remote(local).await);
                }
                SettingsRequest::Import { path, reply } => {
                    let _ = reply.send(store.load_file(&path).await);
                }
                SettingsRequest::Export {
                    path,
                    settings,
                    reply,
                } => {
                    let _ = reply.send(store.save_file(&path, &settings).await);
                }
            }
        });
    }

    fn reply<T: Send + 'static>(&mut self, reply: oneshot::Sender<T>, value: T) {
        self.pending_replies.push(DeferredReply::new(reply, value));
    }

    fn set_command_status(&mut self, status: String) {
        info!("Command status: {}", status);
        self.command_status = Some(status);
        self.timers
            .start(TimerKind::CommandStatusClear, self.settings.command_status_clear);
    }

    /// Record history only while connected; leaving Connected clears it
    fn sync_recording(&mut self) {
        let connected = self.controller.state().is_connected();
        if self.history.is_recording() != connected {
            self.history.set_recording(connected);
        }
    }

    fn publish_status(&self) {
        let next = SessionStatus {
            state: self.controller.state(),
            progress: self.controller.progress().map(str::to_string),
            message: self.controller.message().map(str::to_string),
            command_status: self.command_status.clone(),
            port_notification: self.watcher.active().cloned(),
            selected_port: self.selected_port.clone(),
        };

        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Presentation-layer API of a running [`Session`]
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<SessionStatus>,
    transitions: broadcast::Sender<StateTransition>,
    takeoff_altitude_m: f64,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("closed", &self.requests.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .map_err(|_| GcsError::SessionClosed)?;
        rx.await.map_err(|_| GcsError::SessionClosed)
    }

    /// Start connecting to `port`
    ///
    /// Returns once the attempt has started; watch [`SessionHandle::status`] or
    /// the transition stream for the outcome.
    ///
    /// # Errors
    ///
    /// - `InputValidation`: empty port
    /// - `Busy`: already connecting or connected
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn demo(session: skypulse_gcs::session::SessionHandle) -> skypulse_gcs::error::Result<()> {
    /// session.connect("/dev/ttyUSB0", 57600).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(&self, port: &str, baud_rate: u32) -> Result<()> {
        let port = port.to_string();
        self.call(|reply| Request::Connect {
            port,
            baud_rate,
            reply,
        })
        .await?
    }

    /// Abort the connect attempt in flight
    pub async fn cancel(&self) -> Result<()> {
        self.call(|reply| Request::Cancel { reply }).await?
    }

    /// Disconnect an established connection
    pub async fn disconnect(&self) -> Result<LinkResponse> {
        self.call(|reply| Request::Disconnect { reply }).await?
    }

    pub async fn arm(&self) -> Result<LinkResponse> {
        self.command(FlightCommand::Arm).await
    }

    pub async fn disarm(&self) -> Result<LinkResponse> {
        self.command(FlightCommand::Disarm).await
    }

    /// Take off to `altitude_m`, or to the configured default altitude
    pub async fn takeoff(&self, altitude_m: Option<f64>) -> Result<LinkResponse> {
        let altitude_m = altitude_m.unwrap_or(self.takeoff_altitude_m);
        self.command(FlightCommand::Takeoff { altitude_m }).await
    }

    pub async fn land(&self) -> Result<LinkResponse> {
        self.command(FlightCommand::Land).await
    }

    /// Send a flight command
    ///
    /// # Errors
    ///
    /// - `NotReady`: not connected or a flight precondition is unmet
    /// - `Link`: the link rejected the command or the call failed
    pub async fn command(&self, command: FlightCommand) -> Result<LinkResponse> {
        self.call(|reply| Request::Command { command, reply }).await?
    }

    /// Register a telemetry subscriber
    ///
    /// The callback runs on the session task for every update, in arrival
    /// order. Errors and panics are logged and do not affect other subscribers.
    pub async fn subscribe<F>(&self, callback: F) -> Result<SubscriptionId>
    where
        F: FnMut(&Arc<TelemetrySnapshot>) -> anyhow::Result<()> + Send + 'static,
    {
        let callback: SubscriberFn = Box::new(callback);
        self.call(|reply| Request::Subscribe { callback, reply }).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        self.call(|reply| Request::Unsubscribe { id, reply }).await
    }

    /// Current telemetry snapshot (zeroed before the first update)
    pub async fn telemetry(&self) -> Result<Arc<TelemetrySnapshot>> {
        self.call(|reply| Request::Telemetry { reply }).await
    }

    /// Chart points for `metric`, oldest first
    pub async fn history(&self, metric: Metric) -> Result<Vec<HistoryPoint>> {
        self.call(|reply| Request::History { metric, reply }).await
    }

    pub async fn history_stats(&self, metric: Metric) -> Result<Option<HistoryStats>> {
        self.call(|reply| Request::HistoryStats { metric, reply }).await
    }

    /// Clear one metric's history, or all of it with `None`
    pub async fn clear_history(&self, metric: Option<Metric>) -> Result<()> {
        self.call(|reply| Request::ClearHistory { metric, reply }).await
    }

    /// Port list from the last snapshot the session saw
    pub async fn ports(&self) -> Result<Vec<Port>> {
        self.call(|reply| Request::Ports { reply }).await
    }

    /// Accept the showing notification and select its port
    pub async fn accept_port_notification(&self) -> Result<Option<PortNotification>> {
        self.call(|reply| Request::AcceptPortNotification { reply })
            .await
    }

    pub async fn dismiss_port_notification(&self) -> Result<Option<PortNotification>> {
        self.call(|reply| Request::DismissPortNotification { reply })
            .await
    }

    /// Current radio settings from the settings store
    pub async fn radio_settings(&self) -> Result<RadioSettings> {
        self.call(|reply| Request::Settings(SettingsRequest::Load { reply }))
            .await?
    }

    /// Write radio settings; the payload is not validated here
    pub async fn save_radio_settings(&self, settings: RadioSettings) -> Result<()> {
        self.call(|reply| Request::Settings(SettingsRequest::Save { settings, reply }))
            .await?
    }

    pub async fn reset_radio_settings(&self) -> Result<RadioSettings> {
        self.call(|reply| Request::Settings(SettingsRequest::ResetDefaults { reply }))
            .await?
    }

    /// Apply the local radio parameters to the remote radio
    pub async fn copy_radio_settings_to_remote(&self, local: LocalRadio) -> Result<()> {
        self.call(|reply| Request::Settings(SettingsRequest::CopyToRemote { local, reply }))
            .await?
    }

    /// Import radio settings from a JSON file
    pub async fn import_radio_settings(&self, path: impl AsRef<Path>) -> Result<RadioSettings> {
        let path = path.as_ref().to_path_buf();
        self.call(|reply| Request::Settings(SettingsRequest::Import { path, reply }))
            .await?
    }

    /// Export radio settings to a JSON file
    pub async fn export_radio_settings(
        &self,
        path: impl AsRef<Path>,
        settings: RadioSettings,
    ) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        self.call(|reply| {
            Request::Settings(SettingsRequest::Export {
                path,
                settings,
                reply,
            })
        })
        .await?
    }

    /// Latest published status
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Watch receiver that wakes on every status change
    pub fn status_receiver(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Stream of state transitions from now on
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Ask the session task to stop
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }
}
