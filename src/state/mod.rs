//! State derivation for the Panda assistant.
//!
//! Provides the five-state model, the pure condition resolver, and the
//! monitor that polls the assistant services on a fixed cadence and fans
//! out transitions:
//! - Idle: nothing in flight
//! - Listening: speech recognition is capturing
//! - Processing: a request is being worked on
//! - Speaking: text-to-speech is producing audio
//! - Error: a recent failure is being surfaced

mod monitor;
mod panda_state;
mod resolver;

pub use monitor::{
    ListenerId, MonitorConfig, MonitorHandle, StateMonitor, DEFAULT_ERROR_WINDOW,
    DEFAULT_POLL_INTERVAL,
};
pub use panda_state::PandaState;
pub use resolver::{resolve_state, ServiceConditions};
