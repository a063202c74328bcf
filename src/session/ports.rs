//! # Port Watcher
//!
//! Detects newly plugged-in devices by diffing successive port-list snapshots.
//!
//! Ports are compared by path only. The first snapshot ever seen is the
//! baseline and never notifies. After that, a snapshot notifies when it holds a
//! path that was absent from the one before it; the notification names the
//! first such path in the new snapshot's order. Ports that stay plugged in never
//! notify again.
//!
//! The watcher only diffs. The authoritative port list belongs to the link, and
//! the dismiss timer is run by the session.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::link::Port;

/// "New device detected" notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortNotification {
    /// Increases with every notification raised by one watcher
    pub id: u64,
    pub path: String,
    /// Friendly name, or the path when the device has none
    pub display_name: String,
    pub is_known_telemetry: bool,
}

/// Port-list change detector
#[derive(Debug, Default)]
pub struct PortWatcher {
    previous: Option<Vec<Port>>,
    active: Option<PortNotification>,
    next_id: u64,
}

impl PortWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next port-list snapshot
    ///
    /// The snapshot always becomes the new baseline. When it adds a path, the
    /// returned notification also becomes the active one, replacing any
    /// notification still showing.
    ///
    /// # Examples
    ///
    /// ```
    /// use skypulse_gcs::link::Port;
    /// use skypulse_gcs::session::ports::PortWatcher;
    ///
    /// let mut watcher = PortWatcher::new();
    /// assert!(watcher.update(vec![Port::new("COM3")]).is_none()); // baseline
    ///
    /// let notification = watcher
    ///     .update(vec![Port::new("COM3"), Port::new("COM4")])
    ///     .unwrap();
    /// assert_eq!(notification.path, "COM4");
    ///
    /// // Same list again: nothing new
    /// assert!(watcher.update(vec![Port::new("COM3"), Port::new("COM4")]).is_none());
    /// ```
    pub fn update(&mut self, ports: Vec<Port>) -> Option<PortNotification> {
        let added = match self.previous.as_ref() {
            None => {
                debug!("Port baseline established with {} ports", ports.len());
                None
            }
            Some(previous) => {
                let known: HashSet<&str> = previous.iter().map(|p| p.path.as_str()).collect();
                ports
                    .iter()
                    .find(|port| !known.contains(port.path.as_str()))
                    .cloned()
            }
        };

        let notification = added.map(|port| self.raise(&port));
        self.previous = Some(ports);
        notification
    }

    /// Use `ports` as the baseline if no snapshot has been seen yet
    ///
    /// Returns `false` (and changes nothing) once a baseline exists.
    pub fn seed(&mut self, ports: Vec<Port>) -> bool {
        if self.previous.is_some() {
            return false;
        }
        self.update(ports);
        true
    }

    fn raise(&mut self, port: &Port) -> PortNotification {
        self.next_id += 1;
        let notification = PortNotification {
            id: self.next_id,
            path: port.path.clone(),
            display_name: port.display_name().to_string(),
            is_known_telemetry: port.is_known_telemetry,
        };
        info!("New device detected: {} ({})", notification.display_name, notification.path);
        self.active = Some(notification.clone());
        notification
    }

    /// The notification currently showing
    pub fn active(&self) -> Option<&PortNotification> {
        self.active.as_ref()
    }

    /// Take the active notification because the user accepted it
    pub fn accept(&mut self) -> Option<PortNotification> {
        let accepted = self.active.take();
        if let Some(n) = &accepted {
            info!("Accepted new device {}", n.path);
        }
        accepted
    }

    /// Drop the active notification (manual dismiss or auto-dismiss)
    pub fn dismiss(&mut self) -> Option<PortNotification> {
        let dismissed = self.active.take();
        if let Some(n) = &dismissed {
            debug!("Dismissed notification for {}", n.path);
        }
        dismissed
    }

    /// Last snapshot seen (empty before the baseline)
    pub fn previous_ports(&self) -> &[Port] {
        self.previous.as_deref().unwrap_or(&[])
    }
}
