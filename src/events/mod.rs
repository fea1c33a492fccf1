//! Events emitted by the state monitor.
//!
//! Provides structured event types for state transitions, monitoring
//! lifecycle changes, and the error window.

use serde::{Deserialize, Serialize};

use crate::state::PandaState;

/// Events broadcast by the state monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// The derived state changed
    StateChanged {
        from: PandaState,
        to: PandaState,
        /// Duration in milliseconds spent in the previous state
        duration_ms: u64,
    },

    /// Polling began
    MonitoringStarted,

    /// Polling stopped and the state was forced back to idle
    MonitoringStopped,

    /// A component surfaced a failure condition
    ErrorTriggered,

    /// The error window elapsed without a re-trigger
    ErrorCleared,
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateEvent::StateChanged {
                from,
                to,
                duration_ms,
            } => {
                write!(f, "STATE_CHANGED ({} -> {}, {}ms)", from, to, duration_ms)
            }
            StateEvent::MonitoringStarted => write!(f, "MONITORING_STARTED"),
            StateEvent::MonitoringStopped => write!(f, "MONITORING_STOPPED"),
            StateEvent::ErrorTriggered => write!(f, "ERROR_TRIGGERED"),
            StateEvent::ErrorCleared => write!(f, "ERROR_CLEARED"),
        }
    }
}
