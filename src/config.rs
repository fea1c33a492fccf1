//! Configuration loading and management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::state::{MonitorConfig, DEFAULT_ERROR_WINDOW, DEFAULT_POLL_INTERVAL};

/// Environment variable overriding the poll cadence, in milliseconds
pub const POLL_INTERVAL_VAR: &str = "PANDA_POLL_INTERVAL_MS";

/// Environment variable overriding the error window, in milliseconds
pub const ERROR_WINDOW_VAR: &str = "PANDA_ERROR_WINDOW_MS";

/// Invalid timing override in the environment
#[derive(Debug, Error)]
#[error("invalid value {value:?} for {var}: expected positive whole milliseconds")]
pub struct DurationParseError {
    pub var: &'static str,
    pub value: String,
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Delay between poll ticks
    pub poll_interval: Duration,

    /// How long a triggered error forces the error state
    pub error_window: Duration,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("panda");

        let socket_path = data_dir.join("panda-daemon.sock");

        let poll_interval = duration_override(POLL_INTERVAL_VAR, DEFAULT_POLL_INTERVAL)?;
        let error_window = duration_override(ERROR_WINDOW_VAR, DEFAULT_ERROR_WINDOW)?;

        Ok(Self {
            socket_path,
            data_dir,
            poll_interval,
            error_window,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    /// Timing knobs for the state monitor
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: self.poll_interval,
            error_window: self.error_window,
        }
    }
}

/// Read a millisecond override from the environment, falling back to the
/// default when the variable is unset
fn duration_override(var: &'static str, default: Duration) -> Result<Duration, DurationParseError> {
    match std::env::var(var) {
        Ok(value) => parse_millis(var, &value),
        Err(_) => Ok(default),
    }
}

/// Parse a positive whole-millisecond value for the named variable
fn parse_millis(var: &'static str, value: &str) -> Result<Duration, DurationParseError> {
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(DurationParseError {
            var,
            value: value.to_string(),
        }),
    }
}
