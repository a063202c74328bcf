//! # Telemetry Hub
//!
//! Single source of truth for the current telemetry snapshot, with fan-out to
//! any number of independent subscribers (gauges, map marker, attitude view,
//! chart feeders).
//!
//! Updates run to completion one at a time: the stored value is replaced first,
//! then every subscriber is called in registration order. A subscriber that
//! returns an error or panics is logged and skipped; it never blocks the
//! remaining subscribers and never touches the stored value.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use super::TelemetrySnapshot;

/// Subscriber callback. Receives a shared, read-only snapshot.
pub type SubscriberFn = Box<dyn FnMut(&Arc<TelemetrySnapshot>) -> anyhow::Result<()> + Send>;

/// Handle returned by [`TelemetryHub::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Current-telemetry register with subscriber fan-out
pub struct TelemetryHub {
    current: Arc<TelemetrySnapshot>,
    subscribers: Vec<(SubscriptionId, SubscriberFn)>,
    next_id: u64,
    update_count: u64,
}

impl std::fmt::Debug for TelemetryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryHub")
            .field("subscribers", &self.subscribers.len())
            .field("update_count", &self.update_count)
            .finish_non_exhaustive()
    }
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryHub {
    /// Create a hub holding the zeroed default snapshot
    pub fn new() -> Self {
        Self {
            current: Arc::new(TelemetrySnapshot::default()),
            subscribers: Vec::new(),
            next_id: 0,
            update_count: 0,
        }
    }

    /// Last known snapshot (the default snapshot before the first update)
    pub fn current(&self) -> Arc<TelemetrySnapshot> {
        Arc::clone(&self.current)
    }

    /// Replace the current snapshot and notify every subscriber
    ///
    /// # Returns
    ///
    /// * `usize` - Number of subscribers that failed on this update
    ///
    /// # Examples
    ///
    /// ```
    /// use skypulse_gcs::telemetry::TelemetrySnapshot;
    /// use skypulse_gcs::telemetry::hub::TelemetryHub;
    ///
    /// let mut hub = TelemetryHub::new();
    /// hub.subscribe(|snapshot| {
    ///     println!("altitude: {}", snapshot.altitude);
    ///     Ok(())
    /// });
    ///
    /// let failures = hub.set_current(TelemetrySnapshot { altitude: 12.0, ..Default::default() });
    /// assert_eq!(failures, 0);
    /// assert_eq!(hub.current().altitude, 12.0);
    /// ```
    pub fn set_current(&mut self, snapshot: TelemetrySnapshot) -> usize {
        let snapshot = Arc::new(snapshot);
        self.current = Arc::clone(&snapshot);
        self.update_count += 1;

        let mut failures = 0;
        for (id, callback) in self.subscribers.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| callback(&snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Telemetry subscriber {:?} failed: {:#}", id, e);
                    failures += 1;
                }
                Err(_) => {
                    warn!("Telemetry subscriber {:?} panicked", id);
                    failures += 1;
                }
            }
        }

        failures
    }

    /// Register a subscriber; it sees every update from now on
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&Arc<TelemetrySnapshot>) -> anyhow::Result<()> + Send + 'static,
    {
        self.subscribe_boxed(Box::new(callback))
    }

    /// Register an already boxed subscriber
    pub fn subscribe_boxed(&mut self, callback: SubscriberFn) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, callback));
        debug!("Telemetry subscriber {:?} registered ({} total)", id, self.subscribers.len());
        id
    }

    /// Remove a subscriber
    ///
    /// Returns `false` if the id was not registered (already removed).
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
        let removed = self.subscribers.len() != before;
        if removed {
            debug!("Telemetry subscriber {:?} removed", id);
        }
        removed
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Number of snapshots accepted since creation
    pub fn update_count(&self) -> u64 {
        self.update_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn snapshot_with_altitude(altitude: f64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            altitude,
            ..Default::default()
        }
    }

    fn recorder(
        log: &Arc<Mutex<Vec<(usize, f64)>>>,
        tag: usize,
    ) -> impl FnMut(&Arc<TelemetrySnapshot>) -> anyhow::Result<()> + Send + 'static {
        let log = Arc::clone(log);
        move |snapshot| {
            log.lock().unwrap().push((tag, snapshot.altitude));
            Ok(())
        }
    }

    #[test]
    fn test_current_defaults_before_first_update() {
        let hub = TelemetryHub::new();
        assert_eq!(*hub.current(), TelemetrySnapshot::default());
        assert_eq!(hub.update_count(), 0);
    }

    #[test]
    fn test_delivery_in_registration_and_arrival_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hub = TelemetryHub::new();
        hub.subscribe(recorder(&log, 1));
        hub.subscribe(recorder(&log, 2));

        for altitude in [1.0, 2.0, 3.0] {
            hub.set_current(snapshot_with_altitude(altitude));
        }

        assert_eq!(
            *log.lock().unwrap(),
            vec![(1, 1.0), (2, 1.0), (1, 2.0), (2, 2.0), (1, 3.0), (2, 3.0)]
        );
        assert_eq!(hub.current().altitude, 3.0);
        assert_eq!(hub.update_count(), 3);
    }

    #[test]
    fn test_failing_subscriber_does_not_block_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hub = TelemetryHub::new();
        hub.subscribe(|_| Err(anyhow::anyhow!("gauge exploded")));
        hub.subscribe(recorder(&log, 2));

        let failures = hub.set_current(snapshot_with_altitude(42.0));

        assert_eq!(failures, 1);
        assert_eq!(*log.lock().unwrap(), vec![(2, 42.0)]);
        assert_eq!(hub.current().altitude, 42.0);
    }

    #[test]
    fn test_panicking_subscriber_does_not_corrupt_current() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hub = TelemetryHub::new();
        hub.subscribe(|_| -> anyhow::Result<()> { panic!("renderer crashed") });
        hub.subscribe(recorder(&log, 2));

        let failures = hub.set_current(snapshot_with_altitude(7.0));

        assert_eq!(failures, 1);
        assert_eq!(*log.lock().unwrap(), vec![(2, 7.0)]);
        assert_eq!(hub.current().altitude, 7.0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hub = TelemetryHub::new();
        let first = hub.subscribe(recorder(&log, 1));
        hub.subscribe(recorder(&log, 2));

        assert!(hub.unsubscribe(first));
        assert!(!hub.unsubscribe(first));
        hub.set_current(snapshot_with_altitude(5.0));

        assert_eq!(*log.lock().unwrap(), vec![(2, 5.0)]);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_subscribers_share_the_stored_snapshot() {
        let seen = Arc::new(Mutex::new(None));
        let mut hub = TelemetryHub::new();
        let seen_clone = Arc::clone(&seen);
        hub.subscribe(move |snapshot| {
            *seen_clone.lock().unwrap() = Some(Arc::clone(snapshot));
            Ok(())
        });

        hub.set_current(snapshot_with_altitude(9.0));

        let seen = seen.lock().unwrap().clone().unwrap();
        assert!(Arc::ptr_eq(&seen, &hub.current()));
    }
}
