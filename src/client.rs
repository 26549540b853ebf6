//! Voice client handle
//!
//! [`VoiceClient`] is what a UI holds. Every method enqueues a command for
//! the transport loop and returns; outcomes show up in [`ClientStatus`] and
//! in the event log, never as errors.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::Devices;
use crate::config::Config;
use crate::events::EventLog;
use crate::transport::{ConnectionState, Connector, Transport, WsConnector};

/// Commands waiting for the transport loop
const COMMAND_QUEUE_DEPTH: usize = 32;

/// Requests handled by the transport loop, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    SendText(String),
    StartMic,
    StopMic { flush: bool },
    /// Probe microphone access ahead of connecting
    PrefetchPermission,
    /// Disconnect and end the loop
    Shutdown,
}

/// What is known about microphone access
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MicAccess {
    #[default]
    Unknown,
    Granted,
    Denied,
    /// No capture device, or capture disabled
    Unavailable,
}

/// Observable client state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub mic_on: bool,
    pub agent_ready: bool,
    pub mic_access: MicAccess,
    /// Human-readable status line
    pub status: String,
    /// Consecutive failed attempts, capped by the reconnect policy
    pub retries: u32,
    /// Time left before the pending reconnect
    pub reconnect_in: Option<Duration>,
    /// Connections opened so far
    pub connections: u32,
    /// Session token of the open connection
    pub session_id: Option<String>,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connected: false,
            mic_on: false,
            agent_ready: false,
            mic_access: MicAccess::Unknown,
            status: "Not connected".to_string(),
            retries: 0,
            reconnect_in: None,
            connections: 0,
            session_id: None,
        }
    }
}

/// Handle to a running voice client
///
/// Dropping the handle closes the command queue, which makes the loop run
/// the manual-disconnect path and exit.
pub struct VoiceClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ClientStatus>,
    log: EventLog,
    task: Option<JoinHandle<()>>,
}

impl VoiceClient {
    /// Start a client over `connector` with the given devices
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(config: &Config, connector: Arc<dyn Connector>, devices: Devices) -> Self {
        let log = EventLog::new(config.log_capacity);
        let transport = Transport::new(config, connector, devices, Arc::new(log.clone()));
        Self::spawn(transport, log)
    }

    /// Start a client that talks WebSocket and uses the system audio devices
    #[must_use]
    pub fn with_websocket(config: &Config) -> Self {
        Self::new(
            config,
            Arc::new(WsConnector),
            Devices::system(&config.audio),
        )
    }

    /// Run `transport` on a new task
    #[must_use]
    pub fn spawn(transport: Transport, log: EventLog) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let status = transport.subscribe();
        let task = tokio::spawn(transport.run(rx));

        Self {
            commands,
            status,
            log,
            task: Some(task),
        }
    }

    pub async fn connect(&self) {
        self.send(Command::Connect).await;
    }

    pub async fn disconnect(&self) {
        self.send(Command::Disconnect).await;
    }

    pub async fn send_text(&self, text: impl Into<String>) {
        self.send(Command::SendText(text.into())).await;
    }

    /// Start streaming the microphone; ignored unless connected
    pub async fn start_mic(&self) {
        self.send(Command::StartMic).await;
    }

    /// Stop the microphone
    ///
    /// With `flush_final_frame`, buffered audio shorter than a frame is sent
    /// and the agent is told the user's turn has ended.
    pub async fn stop_mic(&self, flush_final_frame: bool) {
        self.send(Command::StopMic {
            flush: flush_final_frame,
        })
        .await;
    }

    /// Probe microphone access now instead of at connect time
    pub async fn prefetch_permission(&self) {
        self.send(Command::PrefetchPermission).await;
    }

    /// Current state
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `predicate`
    ///
    /// Returns `None` if the loop has exited first.
    pub async fn wait_for(&self, predicate: impl FnMut(&ClientStatus) -> bool) -> Option<ClientStatus> {
        let mut rx = self.status.clone();
        rx.wait_for(predicate).await.ok().map(|s| (*s).clone())
    }

    /// Event log lines, newest first
    #[must_use]
    pub fn logs(&self) -> Vec<String> {
        self.log.snapshot()
    }

    /// Event log lines as they are pushed
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<String> {
        self.log.subscribe()
    }

    /// Disconnect and wait for the loop to finish
    pub async fn shutdown(mut self) {
        self.send(Command::Shutdown).await;
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "transport task failed");
        }
    }

    async fn send(&self, cmd: Command) {
        if self.commands.send(cmd).await.is_err() {
            tracing::debug!("transport loop has exited, command dropped");
        }
    }
}
