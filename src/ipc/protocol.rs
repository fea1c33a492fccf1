//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::delta;
use crate::events::StateEvent;
use crate::state::PandaState;

/// Requests from UI clients to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request current daemon status
    GetStatus,

    /// Begin polling the assistant services
    StartMonitoring,

    /// Stop polling and force the idle state
    StopMonitoring,

    /// Surface a failure condition as the error state
    TriggerError,

    /// Ping to check connectivity
    Ping,

    /// Subscribe to state change notifications
    Subscribe,
}

/// Responses from daemon to UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current daemon status
    Status(DaemonStatus),

    /// Monitoring toggled; reports the resulting flag
    Monitoring { active: bool },

    /// Error state acknowledged
    ErrorTriggered,

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Error response
    Error { code: String, message: String },
}

/// Push notification from daemon to UI (for subscribed clients)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// The derived state changed, joined with its presentation attributes
    StateChanged {
        state: PandaState,
        previous: PandaState,
        status_text: String,
        color_hex: String,
    },

    /// The subscriber fell behind and missed events
    Lagged { skipped: u64 },

    /// Any other monitor event
    Event { event: StateEvent },
}

impl Notification {
    /// Wrap a monitor event, expanding state changes with their
    /// presentation attributes so UI clients can render directly
    pub fn from_event(event: StateEvent) -> Self {
        match event {
            StateEvent::StateChanged { from, to, .. } => Notification::StateChanged {
                state: to,
                previous: from,
                status_text: delta::status_text(to).to_string(),
                color_hex: delta::color_hex(to),
            },
            other => Notification::Event { event: other },
        }
    }
}

/// Full daemon status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Current derived state
    pub state: PandaState,

    /// Status line for the current state
    pub status_text: String,

    /// Indicator tint for the current state, `#AARRGGBB`
    pub color_hex: String,

    /// Whether the poll loop is active
    pub monitoring: bool,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl DaemonStatus {
    /// Build a status snapshot for the given state
    pub fn for_state(state: PandaState, monitoring: bool, uptime_secs: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state,
            status_text: delta::status_text(state).to_string(),
            color_hex: delta::color_hex(state),
            monitoring,
            uptime_secs,
        }
    }
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self::for_state(PandaState::Idle, false, 0)
    }
}
