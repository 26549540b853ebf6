//! Connection state machine and event loop
//!
//! Every connection event, inbound frame, capture chunk and timer is handled
//! on one task, one at a time. Nothing here is shared; the outside world
//! talks to the loop through [`Command`]s and watches [`ClientStatus`].

use std::future::{Future, pending};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::{CLOSE_NORMAL, Connection, ConnectionState, Connector, Frame, ReconnectPolicy};
use crate::{Error, Result};
use crate::audio::{Devices, PlaybackScheduler, TARGET_SAMPLE_RATE, UplinkCapturer};
use crate::client::{ClientStatus, Command, MicAccess};
use crate::config::Config;
use crate::events::EventSink;
use crate::protocol::{ConversationInitiation, InboundMessage, InitiationShape, OutboundMessage};
use crate::session::{CallParams, SessionIdentity};

/// Pings within this window show the agent as listening
const LISTENING_WINDOW: Duration = Duration::from_secs(5);

/// Unrecognized payloads are logged up to this many characters
const PREVIEW_CHARS: usize = 200;

/// Rate of inbound binary audio
const DOWNLINK_RATE: u32 = TARGET_SAMPLE_RATE;

const PERMISSION_DENIED: &str = "Microphone permission denied.";

/// Period of the reconnect countdown shown in the status
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// An in-flight handshake and the identity it was started with
type Handshake =
    Pin<Box<dyn Future<Output = (Result<Box<dyn Connection>>, SessionIdentity)> + Send>>;

/// Why an open or opening connection went away
enum Loss {
    Closed(Option<u16>),
    Failed(Error),
}

/// Owns the agent connection and everything tied to its lifetime
pub struct Transport {
    connector: Arc<dyn Connector>,
    stream_url: String,
    params: CallParams,
    shape: InitiationShape,
    keepalive_period: Duration,
    policy: ReconnectPolicy,
    connect_timeout: Duration,

    state: ConnectionState,
    retries: u32,
    manual_close: bool,
    last_open: Option<Instant>,
    opens: u32,
    conn: Option<Box<dyn Connection>>,
    identity: Option<SessionIdentity>,
    keepalive: Option<Interval>,
    handshake: Option<Handshake>,
    reconnect_at: Option<Instant>,
    countdown: Option<Interval>,

    agent_ready: bool,
    auto_started: bool,
    mic_access: MicAccess,
    notice: Option<String>,
    last_ping: Option<Instant>,
    last_listening_log: Option<Instant>,

    uplink: Option<UplinkCapturer>,
    scheduler: PlaybackScheduler,
    log: Arc<dyn EventSink>,
    status: watch::Sender<ClientStatus>,
}

impl Transport {
    /// Build a transport; nothing connects until a `Connect` command arrives
    #[must_use]
    pub fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        devices: Devices,
        log: Arc<dyn EventSink>,
    ) -> Self {
        let uplink = devices.capture.map(|device| {
            UplinkCapturer::new(
                device,
                config.audio.frame_duration,
                config.audio.target_rate,
            )
        });
        let mic_access = if uplink.is_some() {
            MicAccess::Unknown
        } else {
            MicAccess::Unavailable
        };
        let (status, _) = watch::channel(ClientStatus::default());

        Self {
            connector,
            stream_url: config.agent.stream_url.clone(),
            params: config.call.clone(),
            shape: config.agent.initiation_shape,
            keepalive_period: config.transport.keepalive,
            policy: config.transport.reconnect.clone(),
            connect_timeout: config.transport.connect_timeout,
            state: ConnectionState::Disconnected,
            retries: 0,
            manual_close: false,
            last_open: None,
            opens: 0,
            conn: None,
            identity: None,
            keepalive: None,
            handshake: None,
            reconnect_at: None,
            countdown: None,
            agent_ready: false,
            auto_started: false,
            mic_access,
            notice: None,
            last_ping: None,
            last_listening_log: None,
            uplink,
            scheduler: PlaybackScheduler::new(devices.output),
            log,
            status,
        }
    }

    /// Watch the observable state
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ClientStatus> {
        self.status.subscribe()
    }

    /// Run until `Shutdown` or until every command sender is gone
    ///
    /// Either way the connection is torn down through the manual-disconnect path.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.publish();

        loop {
            tokio::select! {
                biased;

                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => {
                        self.disconnect().await;
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                (result, identity) = next_handshake(&mut self.handshake) => {
                    self.on_handshake(result, identity).await;
                }
                frame = next_frame(&mut self.conn) => self.on_frame(frame),
                chunk = next_chunk(&mut self.uplink) => self.on_capture(chunk).await,
                () = next_tick(&mut self.keepalive) => self.on_keepalive().await,
                () = sleep_until(self.reconnect_at) => self.on_reconnect_timer(),
                // Only republishes, so the countdown text stays current
                () = next_tick(&mut self.countdown) => {}
            }
            self.publish();
        }

        self.publish();
        tracing::debug!("transport loop exited");
    }

    async fn handle_command(&mut self, cmd: Command) {
        tracing::trace!(?cmd, "command");
        match cmd {
            Command::Connect => self.connect(),
            Command::Disconnect | Command::Shutdown => self.disconnect().await,
            Command::SendText(text) => self.send_text(&text).await,
            Command::StartMic => self.start_mic(),
            Command::StopMic { flush } => self.stop_mic(flush).await,
            Command::PrefetchPermission => {
                self.preflight();
            }
        }
    }

    // ---- lifecycle ----

    fn connect(&mut self) {
        self.manual_close = false;
        if self.state.is_busy() {
            tracing::debug!(state = ?self.state, "connect ignored");
            return;
        }
        self.cancel_reconnect();
        self.attempt();
    }

    /// Start a handshake; the loop picks up its outcome
    fn attempt(&mut self) {
        if self.preflight() == MicAccess::Denied {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let identity = SessionIdentity::fresh(&self.params);
        let url = match identity.url(&self.stream_url) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(error = %e, "cannot build connection url");
                self.log.push(&format!("connect error: {e}"));
                return;
            }
        };

        self.set_state(ConnectionState::Connecting);
        self.log.push(&format!("Connecting → {url}"));

        let connector = Arc::clone(&self.connector);
        let limit = self.connect_timeout;
        self.handshake = Some(Box::pin(async move {
            let result = match tokio::time::timeout(limit, connector.connect(url.as_str())).await {
                Ok(result) => result,
                Err(_) => Err(Error::Transport(format!(
                    "handshake timed out after {}s",
                    limit.as_secs()
                ))),
            };
            (result, identity)
        }));
    }

    async fn on_handshake(
        &mut self,
        result: Result<Box<dyn Connection>>,
        identity: SessionIdentity,
    ) {
        self.handshake = None;
        match result {
            Ok(conn) => self.on_open(conn, identity).await,
            Err(e) => {
                tracing::warn!(error = %e, "connect failed");
                self.log.push(&format!("connect error: {e}"));
                self.set_state(ConnectionState::Disconnected);
                if e.is_retryable() && !self.manual_close {
                    self.schedule_reconnect();
                }
            }
        }
    }

    async fn on_open(&mut self, conn: Box<dyn Connection>, identity: SessionIdentity) {
        self.conn = Some(conn);
        self.set_state(ConnectionState::Open);
        self.retries = 0;
        self.last_open = Some(Instant::now());
        self.opens += 1;
        self.agent_ready = false;
        self.auto_started = false;
        self.notice = None;
        self.start_keepalive();

        tracing::info!(sid = identity.token(), "connected to agent");
        self.log.push("WS OPEN");

        let init = OutboundMessage::ConversationInitiationClientData(ConversationInitiation::new(
            self.shape,
            identity.dynamic_variables(),
        ));
        self.identity = Some(identity);
        if self.send_message(&init).await {
            tracing::debug!(shape = ?self.shape, "initiation sent");
        }
    }

    fn on_lost(&mut self, loss: Loss) {
        self.set_state(ConnectionState::Closing);
        match &loss {
            Loss::Closed(code) => {
                let code = code.map_or_else(|| "none".to_string(), |c| c.to_string());
                tracing::info!(code = %code, "connection closed");
                self.log.push(&format!("WS CLOSE ({code})"));
            }
            Loss::Failed(e) => {
                tracing::warn!(error = %e, "connection error");
                self.log.push(&format!("WS ERROR: {e}"));
            }
        }

        if let Some(opened) = self.last_open {
            tracing::debug!(uptime_secs = opened.elapsed().as_secs_f64(), "connection lifetime");
        }

        self.conn = None;
        self.keepalive = None;
        self.stop_capture();
        self.reset_connection_flags();
        self.set_state(ConnectionState::Disconnected);

        if !self.manual_close {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() {
            return;
        }
        let delay = self.policy.delay(self.retries);
        self.retries = self.policy.next_retry(self.retries);
        let now = Instant::now();
        self.reconnect_at = Some(now + delay);
        self.countdown = Some(tokio::time::interval_at(now + COUNTDOWN_TICK, COUNTDOWN_TICK));

        tracing::info!(
            delay_secs = delay.as_secs_f64(),
            retries = self.retries,
            "reconnect scheduled"
        );
        self.log.push(&format!("reconnect in {} s", delay.as_secs()));
    }

    fn on_reconnect_timer(&mut self) {
        self.cancel_reconnect();
        if self.manual_close || self.state.is_busy() {
            tracing::debug!("reconnect skipped");
            return;
        }
        self.attempt();
    }

    /// Drop any pending reconnect; true if one was pending
    fn cancel_reconnect(&mut self) -> bool {
        self.countdown = None;
        self.reconnect_at.take().is_some()
    }

    async fn disconnect(&mut self) {
        self.manual_close = true;
        let had_timer = self.cancel_reconnect();
        self.keepalive = None;
        self.stop_capture();

        if self.handshake.take().is_some() {
            tracing::info!("handshake abandoned by user");
            self.log.push("connect cancelled");
        }

        if let Some(mut conn) = self.conn.take() {
            self.set_state(ConnectionState::Closing);
            if let Err(e) = conn.close(CLOSE_NORMAL, "manual").await {
                tracing::debug!(error = %e, "close frame not delivered");
            }
            tracing::info!("disconnected by user");
            self.log.push("manually closed");
        } else if had_timer {
            self.log.push("pending reconnect cancelled");
        }

        self.reset_connection_flags();
        self.set_state(ConnectionState::Disconnected);
    }

    fn reset_connection_flags(&mut self) {
        self.agent_ready = false;
        self.auto_started = false;
        self.identity = None;
    }

    fn start_keepalive(&mut self) {
        let period = self.keepalive_period;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.keepalive = Some(interval);
    }

    async fn on_keepalive(&mut self) {
        if self.send_message(&OutboundMessage::keepalive_now()).await {
            tracing::trace!("keepalive sent");
        }
    }

    // ---- outbound ----

    async fn send_message(&mut self, msg: &OutboundMessage) -> bool {
        match msg.to_json() {
            Ok(json) => self.send_frame(Frame::Text(json)).await,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode control message");
                false
            }
        }
    }

    async fn send_frame(&mut self, frame: Frame) -> bool {
        if self.state != ConnectionState::Open {
            let e = Error::ProtocolViolation("send while not connected".into());
            tracing::debug!(error = %e, "frame dropped");
            return false;
        }
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };

        match conn.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                self.on_lost(Loss::Failed(e));
                false
            }
        }
    }

    async fn send_text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if self.send_message(&OutboundMessage::user_text(text)).await {
            self.log.push(&format!("sent: \"{text}\""));
        }
    }

    // ---- microphone ----

    /// Probe the microphone unless access is already granted
    fn preflight(&mut self) -> MicAccess {
        if self.mic_access == MicAccess::Granted {
            return self.mic_access;
        }
        let Some(uplink) = self.uplink.as_mut() else {
            self.mic_access = MicAccess::Unavailable;
            return self.mic_access;
        };

        match uplink.probe() {
            Ok(()) => {
                self.mic_access = MicAccess::Granted;
                self.notice = None;
                self.log.push("Mic permission granted");
            }
            Err(Error::Permission(msg)) => {
                tracing::warn!(error = %msg, "microphone permission denied");
                self.mic_access = MicAccess::Denied;
                self.notice = Some(PERMISSION_DENIED.to_string());
                self.log.push(&format!("Mic permission denied: {msg}"));
            }
            Err(e) => {
                tracing::warn!(error = %e, "no usable microphone, continuing text-only");
                self.mic_access = MicAccess::Unavailable;
                self.log.push(&format!("no microphone: {e}"));
            }
        }
        self.mic_access
    }

    fn start_mic(&mut self) {
        if self.state != ConnectionState::Open {
            let e = Error::ProtocolViolation("mic start requires an open connection".into());
            tracing::debug!(error = %e, "mic start refused");
            return;
        }
        let Some(uplink) = self.uplink.as_mut() else {
            self.log.push("no microphone available");
            return;
        };
        if uplink.is_active() {
            return;
        }

        match uplink.start() {
            Ok(rate) => {
                self.mic_access = MicAccess::Granted;
                tracing::info!(in_rate = rate, "mic streaming");
                self.log.push(&format!("Mic ON (inRate={rate})"));
            }
            Err(Error::Permission(msg)) => {
                uplink.stop();
                self.mic_access = MicAccess::Denied;
                self.notice = Some(PERMISSION_DENIED.to_string());
                self.log.push(&format!("mic error: permission denied: {msg}"));
            }
            Err(e) => {
                uplink.stop();
                tracing::warn!(error = %e, "mic failed to start");
                self.log.push(&format!("mic error: {e}"));
            }
        }
    }

    async fn stop_mic(&mut self, flush: bool) {
        if flush && let Some(uplink) = self.uplink.as_mut() {
            let mut frames = uplink.drain();
            frames.extend(uplink.flush());
            for pcm in frames {
                if !self.send_frame(Frame::Binary(pcm)).await {
                    break;
                }
            }
        }

        self.stop_capture();

        if flush
            && self.state == ConnectionState::Open
            && self.send_message(&OutboundMessage::UserAudioEnd).await
        {
            self.log.push("sent user_audio_end");
        }
    }

    fn stop_capture(&mut self) {
        if let Some(uplink) = self.uplink.as_mut() {
            let was_on = uplink.is_active();
            uplink.stop();
            if was_on {
                self.log.push("Mic OFF");
            }
        }
    }

    fn mic_on(&self) -> bool {
        self.uplink.as_ref().is_some_and(UplinkCapturer::is_active)
    }

    async fn on_capture(&mut self, chunk: Option<Vec<f32>>) {
        let Some(raw) = chunk else {
            self.log.push("mic stream ended");
            self.stop_capture();
            return;
        };
        let frames = match self.uplink.as_mut() {
            Some(uplink) => uplink.push(&raw),
            None => return,
        };
        for pcm in frames {
            if !self.send_frame(Frame::Binary(pcm)).await {
                break;
            }
        }
    }

    // ---- inbound ----

    fn on_frame(&mut self, frame: Option<Result<Frame>>) {
        match frame {
            Some(Ok(Frame::Text(text))) => self.on_text(&text),
            Some(Ok(Frame::Binary(bytes))) => self.on_binary(&bytes),
            Some(Ok(Frame::Close(code))) => self.on_lost(Loss::Closed(code)),
            Some(Err(e)) => self.on_lost(Loss::Failed(e)),
            None => self.on_lost(Loss::Closed(None)),
        }
    }

    fn on_binary(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        match self.scheduler.schedule_pcm16(bytes, DOWNLINK_RATE) {
            Ok(_) => self.log.push(&format!("raw chunk {} bytes", bytes.len())),
            Err(e) => {
                tracing::warn!(error = %e, "dropping audio frame");
                self.log.push(&format!("dropped audio: {e}"));
            }
        }
    }

    fn on_text(&mut self, text: &str) {
        match InboundMessage::parse(text) {
            Ok(msg) => self.on_message(msg),
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable frame");
                self.log.push(&format!("RAW: {}", preview(text)));
            }
        }
    }

    fn on_message(&mut self, msg: InboundMessage) {
        match msg {
            InboundMessage::AgentReady { conversation_id } => {
                self.agent_ready = true;
                tracing::info!(?conversation_id, "agent ready");
                self.log.push("agent initialized");

                if self.mic_access == MicAccess::Granted && !self.mic_on() && !self.auto_started {
                    self.auto_started = true;
                    self.start_mic();
                }
            }
            InboundMessage::Ping { event_id } => {
                let now = Instant::now();
                self.last_ping = Some(now);
                tracing::trace!(?event_id, "ping");
                if self
                    .last_listening_log
                    .is_none_or(|at| now.duration_since(at) > LISTENING_WINDOW)
                {
                    self.last_listening_log = Some(now);
                    self.log.push("listening…");
                }
            }
            InboundMessage::AgentResponse { text } => {
                tracing::info!(text = %text, "agent said");
                self.log.push(&format!("agent: {text}"));
            }
            InboundMessage::UserTranscript { text } => {
                tracing::info!(text = %text, "user said");
                self.log.push(&format!("user: {text}"));
            }
            InboundMessage::Audio { pcm } => {
                if pcm.is_empty() {
                    return;
                }
                match self.scheduler.schedule_pcm16(&pcm, DOWNLINK_RATE) {
                    Ok(_) => self.log.push(&format!("chunk {} bytes (scheduled)", pcm.len())),
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping inline audio");
                        self.log.push(&format!("dropped audio: {e}"));
                    }
                }
            }
            InboundMessage::Unknown { kind, raw } => {
                tracing::debug!(?kind, "unrecognized message");
                self.log.push(&format!("message: {}", preview(&raw)));
            }
        }
    }

    // ---- status ----

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "connection state");
            self.state = state;
        }
    }

    fn status_text(&self) -> String {
        match self.state {
            ConnectionState::Open if self.mic_on() => "Streaming mic".to_string(),
            ConnectionState::Open
                if self
                    .last_ping
                    .is_some_and(|at| at.elapsed() < LISTENING_WINDOW) =>
            {
                "Listening…".to_string()
            }
            ConnectionState::Open => "Connected".to_string(),
            ConnectionState::Connecting => "Connecting…".to_string(),
            ConnectionState::Closing => "Closing…".to_string(),
            ConnectionState::Disconnected => {
                if let Some(at) = self.reconnect_at {
                    let left = at.saturating_duration_since(Instant::now());
                    let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
                    format!("Reconnecting in {secs}s")
                } else if let Some(notice) = &self.notice {
                    notice.clone()
                } else {
                    "Not connected".to_string()
                }
            }
        }
    }

    fn publish(&self) {
        let next = ClientStatus {
            state: self.state,
            connected: self.state == ConnectionState::Open,
            mic_on: self.mic_on(),
            agent_ready: self.agent_ready,
            mic_access: self.mic_access,
            status: self.status_text(),
            retries: self.retries,
            reconnect_in: self
                .reconnect_at
                .map(|at| at.saturating_duration_since(Instant::now())),
            connections: self.opens,
            session_id: self.identity.as_ref().map(|i| i.token().to_string()),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}

async fn next_handshake(
    handshake: &mut Option<Handshake>,
) -> (Result<Box<dyn Connection>>, SessionIdentity) {
    match handshake {
        Some(fut) => fut.as_mut().await,
        None => pending().await,
    }
}

async fn next_frame(conn: &mut Option<Box<dyn Connection>>) -> Option<Result<Frame>> {
    match conn {
        Some(conn) => conn.recv().await,
        None => pending().await,
    }
}

async fn next_chunk(uplink: &mut Option<UplinkCapturer>) -> Option<Vec<f32>> {
    match uplink {
        Some(uplink) => uplink.next_chunk().await,
        None => pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}
