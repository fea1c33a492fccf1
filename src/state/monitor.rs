//! Core state monitor implementation.
//!
//! A single task owns the derived state. It polls the assistant services
//! on a fixed cadence, resolves their conditions into one state, and fans
//! out each distinct change to registered listeners exactly once. Handle
//! calls from other tasks are marshalled onto the monitor task, so every
//! transition and every callback runs in one delivery context.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::delta;
use crate::events::StateEvent;
use crate::services::Services;

use super::panda_state::PandaState;
use super::resolver::resolve_state;

/// Default cadence between poll ticks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default window during which a triggered error forces the error state
pub const DEFAULT_ERROR_WINDOW: Duration = Duration::from_millis(5000);

/// Timing knobs for the monitor
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Delay between the end of one poll tick and the start of the next
    pub poll_interval: Duration,
    /// How long a triggered error forces the error state
    pub error_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            error_window: DEFAULT_ERROR_WINDOW,
        }
    }
}

/// Identifies a registered state listener for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type StateListener = Arc<dyn Fn(PandaState) + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    callback: StateListener,
}

/// Registry of state listeners.
///
/// Fan-out iterates a snapshot, never the live list, so callbacks may
/// add or remove listeners while a notification is in flight.
#[derive(Default)]
struct ListenerRegistry {
    entries: Mutex<Vec<ListenerEntry>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    fn add(&self, callback: StateListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ListenerEntry { id, callback });
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<(ListenerId, StateListener)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| (entry.id, Arc::clone(&entry.callback)))
            .collect()
    }
}

enum Command {
    Start { done: oneshot::Sender<()> },
    Stop { done: oneshot::Sender<()> },
    TriggerError { done: oneshot::Sender<()> },
}

/// Cloneable handle to the state monitor
#[derive(Clone)]
pub struct MonitorHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<PandaState>,
    monitoring: Arc<AtomicBool>,
    listeners: Arc<ListenerRegistry>,
}

impl MonitorHandle {
    /// Latest committed state; never blocks
    pub fn current_state(&self) -> PandaState {
        *self.state_rx.borrow()
    }

    /// Whether the poll loop is active
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    /// Current state joined with its presentation attributes
    pub fn visual_state(&self) -> delta::DeltaVisualState {
        delta::visual_state(self.current_state())
    }

    /// Register a listener; it fires once per future transition until removed
    pub fn add_listener(
        &self,
        callback: impl Fn(PandaState) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.add(Arc::new(callback))
    }

    /// Remove a listener; no-op when the id is unknown.
    ///
    /// Safe to call from inside a listener callback.
    pub fn remove_listener(&self, id: ListenerId) {
        if !self.listeners.remove(id) {
            debug!(listener = id.0, "remove_listener: unknown id");
        }
    }

    /// Begin polling; no-op if already running
    pub async fn start_monitoring(&self) {
        self.send(|done| Command::Start { done }).await;
    }

    /// Stop polling and force the idle state.
    ///
    /// When this returns, the forced transition (if any) has been
    /// delivered and no further transitions will fire.
    pub async fn stop_monitoring(&self) {
        self.send(|done| Command::Stop { done }).await;
    }

    /// Surface a failure: forces the error state for the configured
    /// window, re-evaluating immediately instead of waiting for a tick.
    /// Calling again restarts the window.
    pub async fn trigger_error_state(&self) {
        self.send(|done| Command::TriggerError { done }).await;
    }

    async fn send(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(make(done_tx)).await.is_err() {
            warn!("state monitor is gone, command dropped");
            return;
        }
        let _ = done_rx.await;
    }
}

/// The state monitor: sole owner and writer of the derived state
pub struct StateMonitor {
    /// Assistant services sampled on every tick
    services: Services,
    config: MonitorConfig,
    /// Current state
    current: PandaState,
    /// Time-boxed error flag, see `trigger_error`
    has_recent_error: bool,
    /// Whether the poll loop is active
    monitoring: bool,
    /// Mirror of `monitoring`, readable from handles
    monitoring_flag: Arc<AtomicBool>,
    /// Time when the current state was entered
    state_entered_at: Instant,
    /// Deadline of the next poll tick, meaningful while monitoring
    next_tick_at: Instant,
    /// Deadline of the pending error clear, if an error window is open
    error_clear_at: Option<Instant>,
    listeners: Arc<ListenerRegistry>,
    cmd_rx: mpsc::Receiver<Command>,
    /// Latest committed state for non-blocking reads
    state_tx: watch::Sender<PandaState>,
    /// Channel for emitting state events
    event_tx: broadcast::Sender<StateEvent>,
}

impl StateMonitor {
    /// Create a monitor and its first handle
    pub fn new(
        services: Services,
        config: MonitorConfig,
        event_tx: broadcast::Sender<StateEvent>,
    ) -> (Self, MonitorHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(PandaState::Idle);
        let listeners = Arc::new(ListenerRegistry::default());
        let monitoring_flag = Arc::new(AtomicBool::new(false));

        let monitor = Self {
            services,
            config,
            current: PandaState::Idle,
            has_recent_error: false,
            monitoring: false,
            monitoring_flag: Arc::clone(&monitoring_flag),
            state_entered_at: Instant::now(),
            next_tick_at: Instant::now(),
            error_clear_at: None,
            listeners: Arc::clone(&listeners),
            cmd_rx,
            state_tx,
            event_tx,
        };

        let handle = MonitorHandle {
            cmd_tx,
            state_rx,
            monitoring: monitoring_flag,
            listeners,
        };

        (monitor, handle)
    }

    /// Run the monitor until every handle is dropped
    pub async fn run(mut self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            error_window_ms = self.config.error_window.as_millis() as u64,
            "state monitor started in Idle state"
        );

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = sleep_until(self.next_tick_at), if self.monitoring => {
                    self.poll_tick();
                    // Reschedule only after the tick completes, so a slow
                    // tick cannot overlap the next one
                    self.next_tick_at = Instant::now() + self.config.poll_interval;
                }
                _ = sleep_until(self.error_clear_at.unwrap_or_else(Instant::now)),
                    if self.error_clear_at.is_some() =>
                {
                    self.clear_error();
                }
            }
        }

        info!("state monitor stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { done } => {
                self.start_monitoring();
                let _ = done.send(());
            }
            Command::Stop { done } => {
                self.stop_monitoring();
                let _ = done.send(());
            }
            Command::TriggerError { done } => {
                self.trigger_error();
                let _ = done.send(());
            }
        }
    }

    fn start_monitoring(&mut self) {
        if self.monitoring {
            debug!("start_monitoring: already running");
            return;
        }

        self.monitoring = true;
        self.monitoring_flag.store(true, Ordering::SeqCst);
        self.next_tick_at = Instant::now() + self.config.poll_interval;

        info!("state monitoring started");
        let _ = self.event_tx.send(StateEvent::MonitoringStarted);
    }

    fn stop_monitoring(&mut self) {
        if !self.monitoring {
            debug!("stop_monitoring: already stopped");
            return;
        }

        // Cancel the pending tick and the pending error clear, then force
        // idle. The error flag is dropped with its timer so a later start
        // cannot resurrect a stale error.
        self.monitoring = false;
        self.monitoring_flag.store(false, Ordering::SeqCst);
        self.has_recent_error = false;
        self.error_clear_at = None;

        info!("state monitoring stopped, forcing idle");
        self.apply_resolved(PandaState::Idle);
        let _ = self.event_tx.send(StateEvent::MonitoringStopped);
    }

    fn trigger_error(&mut self) {
        self.has_recent_error = true;
        self.error_clear_at = Some(Instant::now() + self.config.error_window);

        warn!(
            window_ms = self.config.error_window.as_millis() as u64,
            "error state triggered"
        );
        let _ = self.event_tx.send(StateEvent::ErrorTriggered);

        // Re-evaluate now instead of waiting for the next tick
        if self.monitoring {
            self.poll_tick();
        }
    }

    fn clear_error(&mut self) {
        self.has_recent_error = false;
        self.error_clear_at = None;

        debug!("error window elapsed, flag cleared");
        let _ = self.event_tx.send(StateEvent::ErrorCleared);

        if self.monitoring {
            self.poll_tick();
        }
    }

    /// One poll tick: sample the services, resolve, apply
    fn poll_tick(&mut self) {
        let conditions = self.services.conditions(self.has_recent_error);
        let resolved = resolve_state(&conditions);
        trace!(?conditions, resolved = %resolved, "poll tick");
        self.apply_resolved(resolved);
    }

    /// Commit a resolved state if it differs from the current one and
    /// notify every registered listener
    fn apply_resolved(&mut self, new_state: PandaState) {
        if new_state == self.current {
            return;
        }

        let old_state = self.current;
        let duration_ms = self.state_entered_at.elapsed().as_millis() as u64;

        self.current = new_state;
        self.state_entered_at = Instant::now();
        let _ = self.state_tx.send(new_state);

        info!(
            from = %old_state,
            to = %new_state,
            duration_ms = duration_ms,
            "state transition"
        );

        self.notify_listeners(new_state);

        let _ = self.event_tx.send(StateEvent::StateChanged {
            from: old_state,
            to: new_state,
            duration_ms,
        });
    }

    /// Fan out to a snapshot of the registry.
    ///
    /// A panicking listener is logged and skipped; it must not starve the
    /// remaining listeners or kill the poll loop.
    fn notify_listeners(&self, state: PandaState) {
        for (id, callback) in self.listeners.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| callback(state))).is_err() {
                error!(listener = id.0, state = %state, "state listener panicked");
            }
        }
    }
}
