//! Unix domain socket server for IPC
//!
//! Provides request-response communication and push notifications for
//! state change events to subscribed clients. Each connection is split
//! into a reader loop and a writer task so pushed notifications can
//! interleave with responses without corrupting the framing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::events::StateEvent;
use crate::state::MonitorHandle;

use super::protocol::{DaemonStatus, Notification, Request, Response};

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    monitor: MonitorHandle,
    start_time: std::time::Instant,
    shutdown_tx: broadcast::Sender<()>,
    /// Channel subscribed clients receive state events from
    event_tx: broadcast::Sender<StateEvent>,
}

impl Server {
    /// Create a new IPC server serving the given monitor
    pub fn new(
        socket_path: &Path,
        monitor: MonitorHandle,
        event_tx: broadcast::Sender<StateEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            monitor,
            start_time: std::time::Instant::now(),
            shutdown_tx,
            event_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let monitor = self.monitor.clone();
                    let events = self.event_tx.subscribe();
                    let pump_shutdown = self.shutdown_tx.subscribe();
                    let mut shutdown_rx = self.shutdown_tx.subscribe();
                    let start_time = self.start_time;

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(
                                stream, monitor, events, pump_shutdown, start_time
                            ) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection.
    ///
    /// The event pump and the writer task live exactly as long as the
    /// connection: disconnect cancels the pump, and closing the frame
    /// channel ends the writer, so no task outlives its socket.
    async fn handle_client(
        stream: UnixStream,
        monitor: MonitorHandle,
        events: broadcast::Receiver<StateEvent>,
        pump_shutdown: broadcast::Receiver<()>,
        start_time: std::time::Instant,
    ) -> Result<()> {
        let (reader, writer) = stream.into_split();
        let subscribed = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(32);

        let writer_task = tokio::spawn(Self::write_frames(writer, frame_rx));

        let result = tokio::select! {
            result = Self::serve_requests(
                reader,
                monitor,
                frame_tx.clone(),
                Arc::clone(&subscribed),
                start_time,
            ) => result,
            _ = Self::pump_events(events, frame_tx.clone(), subscribed, pump_shutdown) => Ok(()),
        };

        // Close the frame channel so the writer drains and exits
        drop(frame_tx);
        let _ = writer_task.await;

        result
    }

    /// Read length-prefixed requests and queue responses
    async fn serve_requests(
        mut reader: OwnedReadHalf,
        monitor: MonitorHandle,
        frames: mpsc::Sender<Vec<u8>>,
        subscribed: Arc<AtomicBool>,
        start_time: std::time::Instant,
    ) -> Result<()> {
        let mut len_buf = [0u8; 4];

        loop {
            // Read message length (4-byte little-endian)
            match reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > 1024 * 1024 {
                warn!(len, "message too large, disconnecting");
                return Ok(());
            }

            // Read message body
            let mut msg_buf = vec![0u8; len];
            reader.read_exact(&mut msg_buf).await?;

            // Parse and process the request
            let response = match serde_json::from_slice::<Request>(&msg_buf) {
                Ok(request) => {
                    debug!(?request, "received request");
                    Self::process_request(request, &monitor, &subscribed, start_time).await
                }
                Err(e) => Response::Error {
                    code: "bad_request".to_string(),
                    message: e.to_string(),
                },
            };

            let frame = Self::encode_frame(&response)?;
            if frames.send(frame).await.is_err() {
                // Writer is gone, nothing left to respond to
                return Ok(());
            }
        }
    }

    /// Drain queued frames onto the socket
    async fn write_frames(mut writer: OwnedWriteHalf, mut frames: mpsc::Receiver<Vec<u8>>) {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!(?e, "client write failed");
                break;
            }
        }
    }

    /// Forward state events to the client once it subscribes
    async fn pump_events(
        mut events: broadcast::Receiver<StateEvent>,
        frames: mpsc::Sender<Vec<u8>>,
        subscribed: Arc<AtomicBool>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let notification = match event {
                        Ok(event) => {
                            if !subscribed.load(Ordering::SeqCst) {
                                continue;
                            }
                            Notification::from_event(event)
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "event subscriber lagged");
                            if !subscribed.load(Ordering::SeqCst) {
                                continue;
                            }
                            Notification::Lagged { skipped: n }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };

                    match Self::encode_frame(&notification) {
                        Ok(frame) => {
                            if frames.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(?e, "failed to encode notification"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Process a request and return the response
    async fn process_request(
        request: Request,
        monitor: &MonitorHandle,
        subscribed: &AtomicBool,
        start_time: std::time::Instant,
    ) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => Response::Status(DaemonStatus::for_state(
                monitor.current_state(),
                monitor.is_monitoring(),
                start_time.elapsed().as_secs(),
            )),

            Request::StartMonitoring => {
                monitor.start_monitoring().await;
                info!("monitoring started via IPC");
                Response::Monitoring {
                    active: monitor.is_monitoring(),
                }
            }

            Request::StopMonitoring => {
                monitor.stop_monitoring().await;
                info!("monitoring stopped via IPC");
                Response::Monitoring {
                    active: monitor.is_monitoring(),
                }
            }

            Request::TriggerError => {
                monitor.trigger_error_state().await;
                info!("error state triggered via IPC");
                Response::ErrorTriggered
            }

            Request::Subscribe => {
                subscribed.store(true, Ordering::SeqCst);
                debug!("client subscribed to notifications");
                Response::Subscribed
            }
        }
    }

    /// Encode a length-prefixed JSON frame
    fn encode_frame<T: serde::Serialize>(msg: &T) -> Result<Vec<u8>> {
        let msg_bytes = serde_json::to_vec(msg)?;
        let mut frame = Vec::with_capacity(4 + msg_bytes.len());
        frame.extend_from_slice(&(msg_bytes.len() as u32).to_le_bytes());
        frame.extend_from_slice(&msg_bytes);
        Ok(frame)
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde::de::DeserializeOwned;
    use tokio::time::timeout;

    use crate::services::{AgentFlag, FeedbackFlag, Services, SpeechFlags};
    use crate::state::{MonitorConfig, PandaState, StateMonitor};

    struct ServerRig {
        server: Arc<Server>,
        socket_path: PathBuf,
        handle: MonitorHandle,
        agent: AgentFlag,
        speech: SpeechFlags,
    }

    fn test_socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("panda-daemon-test-{}-{}.sock", std::process::id(), tag))
    }

    fn spawn_server(tag: &str) -> ServerRig {
        let speech = SpeechFlags::new();
        let feedback = FeedbackFlag::new();
        let agent = AgentFlag::new();
        let services = Services::new()
            .with_speech(Arc::new(speech.clone()))
            .with_feedback(Arc::new(feedback.clone()))
            .with_agent(Arc::new(agent.clone()));

        let config = MonitorConfig {
            poll_interval: Duration::from_millis(10),
            error_window: Duration::from_millis(250),
        };

        let (event_tx, _) = broadcast::channel(64);
        let (monitor, handle) = StateMonitor::new(services, config, event_tx.clone());
        tokio::spawn(monitor.run());

        let socket_path = test_socket_path(tag);
        let server = Arc::new(Server::new(&socket_path, handle.clone(), event_tx).unwrap());
        let acceptor = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = acceptor.run().await;
        });

        ServerRig {
            server,
            socket_path,
            handle,
            agent,
            speech,
        }
    }

    async fn connect(rig: &ServerRig) -> UnixStream {
        UnixStream::connect(&rig.socket_path).await.unwrap()
    }

    async fn write_frame<T: serde::Serialize>(stream: &mut UnixStream, msg: &T) {
        let frame = Server::encode_frame(msg).unwrap();
        stream.write_all(&frame).await.unwrap();
    }

    async fn read_frame<T: DeserializeOwned>(stream: &mut UnixStream) -> T {
        let mut len_buf = [0u8; 4];
        timeout(Duration::from_secs(2), stream.read_exact(&mut len_buf))
            .await
            .expect("timed out reading frame length")
            .unwrap();
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut msg_buf = vec![0u8; len];
        timeout(Duration::from_secs(2), stream.read_exact(&mut msg_buf))
            .await
            .expect("timed out reading frame body")
            .unwrap();
        serde_json::from_slice(&msg_buf).unwrap()
    }

    async fn roundtrip(stream: &mut UnixStream, request: &Request) -> Response {
        write_frame(stream, request).await;
        read_frame(stream).await
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let rig = spawn_server("ping");
        let mut stream = connect(&rig).await;

        let response = roundtrip(&mut stream, &Request::Ping).await;
        assert!(matches!(response, Response::Pong));

        rig.server.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_follows_monitor() {
        let rig = spawn_server("status");
        let mut stream = connect(&rig).await;

        rig.agent.set_running(true);
        rig.speech.set_listening(true);

        let response = roundtrip(&mut stream, &Request::StartMonitoring).await;
        assert!(matches!(response, Response::Monitoring { active: true }));

        // Poll status until the monitor has ticked
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let response = roundtrip(&mut stream, &Request::GetStatus).await;
            let status = match response {
                Response::Status(status) => status,
                other => panic!("unexpected response {:?}", other),
            };
            if status.state == PandaState::Listening {
                assert_eq!(status.status_text, "Listening...");
                assert_eq!(status.color_hex, "#FFFF9800");
                assert!(status.monitoring);
                assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("status never reached listening, last {:?}", status.state);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        rig.server.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_error_via_ipc() {
        let rig = spawn_server("trigger");
        let mut stream = connect(&rig).await;

        let response = roundtrip(&mut stream, &Request::StartMonitoring).await;
        assert!(matches!(response, Response::Monitoring { active: true }));

        let response = roundtrip(&mut stream, &Request::TriggerError).await;
        assert!(matches!(response, Response::ErrorTriggered));
        assert_eq!(rig.handle.current_state(), PandaState::Error);

        let response = roundtrip(&mut stream, &Request::GetStatus).await;
        match response {
            Response::Status(status) => {
                assert_eq!(status.state, PandaState::Error);
                assert_eq!(status.status_text, "Error");
            }
            other => panic!("unexpected response {:?}", other),
        }

        rig.server.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscriber_receives_state_changes() {
        let rig = spawn_server("subscribe");
        let mut stream = connect(&rig).await;

        let response = roundtrip(&mut stream, &Request::Subscribe).await;
        assert!(matches!(response, Response::Subscribed));

        rig.agent.set_running(true);
        rig.speech.set_listening(true);
        rig.handle.start_monitoring().await;

        // Skip lifecycle events until the state change arrives
        let mut found = None;
        for _ in 0..10 {
            let note: Notification = read_frame(&mut stream).await;
            if let Notification::StateChanged { state, previous, .. } = note {
                found = Some((state, previous));
                break;
            }
        }
        let (state, previous) = found.expect("no state change notification");
        assert_eq!(state, PandaState::Listening);
        assert_eq!(previous, PandaState::Idle);

        rig.server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribed_client_gets_no_pushes() {
        let rig = spawn_server("nopush");
        let mut stream = connect(&rig).await;

        rig.agent.set_running(true);
        rig.speech.set_listening(true);
        rig.handle.start_monitoring().await;

        // Wait out a few transitions worth of time, then check that the
        // only frame on the wire is the response to a fresh request
        tokio::time::sleep(Duration::from_millis(100)).await;
        let response = roundtrip(&mut stream, &Request::Ping).await;
        assert!(matches!(response, Response::Pong));

        rig.server.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_request_returns_error() {
        let rig = spawn_server("malformed");
        let mut stream = connect(&rig).await;

        let junk = b"not json at all";
        let mut frame = Vec::new();
        frame.extend_from_slice(&(junk.len() as u32).to_le_bytes());
        frame.extend_from_slice(junk);
        stream.write_all(&frame).await.unwrap();

        let response: Response = read_frame(&mut stream).await;
        match response {
            Response::Error { code, .. } => assert_eq!(code, "bad_request"),
            other => panic!("unexpected response {:?}", other),
        }

        rig.server.shutdown().await;
    }

    /// Open descriptors for this process, where the platform exposes them
    fn open_fd_count() -> Option<usize> {
        std::fs::read_dir("/proc/self/fd")
            .ok()
            .map(|entries| entries.count())
    }

    #[tokio::test]
    async fn test_disconnected_clients_release_their_resources() {
        let rig = spawn_server("churn");

        // Warm up the accept path before sampling
        {
            let mut stream = connect(&rig).await;
            let response = roundtrip(&mut stream, &Request::Ping).await;
            assert!(matches!(response, Response::Pong));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let before = open_fd_count();

        // The monitor stays quiescent here, so nothing but the
        // connection teardown itself can release the sockets
        for _ in 0..40 {
            let mut stream = connect(&rig).await;
            let response = roundtrip(&mut stream, &Request::Ping).await;
            assert!(matches!(response, Response::Pong));
        }

        // Give the per-connection tasks time to wind down
        tokio::time::sleep(Duration::from_millis(500)).await;

        if let (Some(before), Some(after)) = (before, open_fd_count()) {
            assert!(
                after <= before + 4,
                "fd count grew from {} to {} across disconnected clients",
                before,
                after
            );
        }

        rig.server.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_frame_disconnects() {
        let rig = spawn_server("oversized");
        let mut stream = connect(&rig).await;

        let len = (2 * 1024 * 1024u32).to_le_bytes();
        stream.write_all(&len).await.unwrap();

        // The server drops the connection instead of reading the body
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("timed out waiting for disconnect")
            .unwrap();
        assert_eq!(read, 0);

        rig.server.shutdown().await;
    }
}
