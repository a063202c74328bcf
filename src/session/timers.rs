//! # Session Timers
//!
//! Individually cancellable one-shot timers that fire back into the session's
//! event queue.
//!
//! At most one timer per [`TimerKind`] is live. Starting a kind again replaces
//! (and aborts) the previous one. Every firing carries the generation it was
//! started with, and [`Timers::accept`] only lets through the firing of the
//! timer that is still live, so an expiry that raced with a cancel is dropped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::SessionEvent;

/// What a timer is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// No heartbeat within the connect window
    ConnectTimeout,
    /// `Failed` recovers to `Idle`
    FailedReset,
    /// Transient progress line clears
    ProgressClear,
    /// Transient connection message clears
    MessageClear,
    /// Flight command status clears
    CommandStatusClear,
    /// New-port notification dismisses itself
    PortNotificationDismiss,
}

/// A timer expiry as delivered to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Set of live timers, keyed by kind
pub struct Timers {
    sender: mpsc::UnboundedSender<SessionEvent>,
    active: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    next_generation: u64,
}

impl std::fmt::Debug for Timers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.active.keys().collect();
        kinds.sort_by_key(|kind| format!("{:?}", kind));
        f.debug_struct("Timers").field("active", &kinds).finish()
    }
}

impl Timers {
    pub fn new(sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            sender,
            active: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Start (or restart) the timer of this kind
    ///
    /// # Returns
    ///
    /// * `u64` - Generation tag the firing will carry
    pub fn start(&mut self, kind: TimerKind, after: Duration) -> u64 {
        self.cancel(kind);

        self.next_generation += 1;
        let generation = self.next_generation;
        let sender = self.sender.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Session gone means nobody is waiting for this
            let _ = sender.send(SessionEvent::Timer(TimerFired { kind, generation }));
        });

        debug!("Timer {:?} started ({} ms, gen {})", kind, after.as_millis(), generation);
        self.active.insert(kind, (generation, handle));
        generation
    }

    /// Cancel the live timer of this kind
    ///
    /// Returns `false` if none was running.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.active.remove(&kind) {
            Some((generation, handle)) => {
                handle.abort();
                debug!("Timer {:?} cancelled (gen {})", kind, generation);
                true
            }
            None => false,
        }
    }

    /// Whether a timer of this kind is live
    pub fn is_active(&self, kind: TimerKind) -> bool {
        self.active.contains_key(&kind)
    }

    /// Consume a firing if it belongs to the live timer of its kind
    ///
    /// Returns `false` for stale firings (cancelled or restarted timers).
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.active.get(&fired.kind) {
            Some((generation, _)) if *generation == fired.generation => {
                self.active.remove(&fired.kind);
                true
            }
            _ => {
                debug!("Ignoring stale timer {:?} (gen {})", fired.kind, fired.generation);
                false
            }
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.active.drain() {
            handle.abort();
        }
    }
}
