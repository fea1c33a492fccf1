//! panda-daemon: background state monitor for the Panda voice assistant
//!
//! The daemon owns the state-derivation subsystem:
//! - Polls the assistant services on a fixed cadence
//! - Resolves their conditions into one of five states under a fixed
//!   priority order
//! - Fans out each distinct transition to in-process listeners and to
//!   UI clients subscribed over the IPC socket
//!
//! Speech processing, UI rendering, and the assistant runtime itself
//! live elsewhere; this process only observes and reports.

mod config;
mod delta;
mod events;
mod ipc;
mod lifecycle;
mod services;
mod state;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::events::StateEvent;
use crate::ipc::Server;
use crate::lifecycle::ShutdownSignal;
use crate::services::{AgentFlag, FeedbackFlag, Services, SpeechFlags};
use crate::state::StateMonitor;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "panda-daemon starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(
        ?config.socket_path,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        error_window_ms = config.error_window.as_millis() as u64,
        "configuration loaded"
    );

    delta::log_state_mappings();

    // Create shutdown signal handler
    let shutdown = ShutdownSignal::new();

    // Shared condition flags; the assistant runtime toggles them from its
    // own tasks, the monitor only ever reads them
    let services = Services::new()
        .with_speech(Arc::new(SpeechFlags::new()))
        .with_feedback(Arc::new(FeedbackFlag::new()))
        .with_agent(Arc::new(AgentFlag::new()));

    // Monitor -> IPC server (for pushing state events to subscribers)
    let (event_tx, _event_rx) = broadcast::channel::<StateEvent>(64);

    // Create the state monitor and spawn its task
    let (monitor, handle) =
        StateMonitor::new(services, config.monitor_config(), event_tx.clone());
    tokio::spawn(monitor.run());

    // In-process consumer of the listener API; the monitor already logs
    // transitions, this one carries the presentation text
    handle.add_listener(|new_state| {
        debug!(
            state = %new_state,
            status = delta::status_text(new_state),
            "transition observed"
        );
    });

    handle.start_monitoring().await;

    // Create the IPC server over the shared monitor handle
    let server = Server::new(&config.socket_path, handle.clone(), event_tx)?;

    info!("daemon initialized, entering main loop");

    // Main event loop
    tokio::select! {
        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Wait for shutdown signal
        signal = shutdown.wait() => {
            info!(signal, "shutdown signal received");
        }
    }

    // Cleanup: stop monitoring first so the forced idle transition still
    // reaches subscribers before the socket goes away
    info!("shutting down...");

    handle.stop_monitoring().await;
    server.shutdown().await;

    info!("panda-daemon stopped");

    Ok(())
}
