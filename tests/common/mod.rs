//! Shared test utilities
//!
//! In-memory stand-ins for the network and the audio hardware, so the
//! transport loop can be driven deterministically under paused time.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_call::config::Config;
use beacon_call::{CaptureDevice, Connection, Connector, Error, Frame, OutputDevice, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Base URL used by every in-memory test
pub const TEST_URL: &str = "ws://agent.test/ws/app";

/// Config pointing at the in-memory agent with default timings
#[must_use]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.agent.stream_url = TEST_URL.to_string();
    config
}

/// Mono sine wave
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sine(frequency: f32, sample_rate: u32, samples: usize, amplitude: f32) -> Vec<f32> {
    (0..samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

// ---- network ----

/// One connection attempt seen by [`MemoryConnector`]
#[derive(Debug, Clone)]
pub struct Attempt {
    pub url: String,
    pub at: Instant,
    pub refused: bool,
}

/// Connector that hands out in-memory connections
///
/// Each accepted connection's far end is delivered as a [`Peer`] on the
/// receiver returned by [`MemoryConnector::new`].
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<Peer>,
    refuse_next: AtomicUsize,
    stall_next: AtomicUsize,
    attempts: Mutex<Vec<Attempt>>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers,
            refuse_next: AtomicUsize::new(0),
            stall_next: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
        });
        (connector, rx)
    }

    /// Refuse the next `n` handshakes
    pub fn refuse(&self, n: usize) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }

    /// Leave the next `n` handshakes hanging forever
    pub fn stall(&self, n: usize) {
        self.stall_next.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>> {
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.attempts.lock().unwrap().push(Attempt {
            url: url.to_string(),
            at: Instant::now(),
            refused,
        });
        if refused {
            return Err(Error::Transport("connection refused".to_string()));
        }
        if self
            .stall_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            std::future::pending::<()>().await;
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(Mutex::new(None));

        let peer = Peer {
            url: url.to_string(),
            sent: out_rx,
            inbound: Some(in_tx),
            closed: Arc::clone(&closed),
        };
        self.peers
            .send(peer)
            .map_err(|_| Error::Transport("test dropped the peer receiver".to_string()))?;

        Ok(Box::new(MemoryConnection {
            outbound: out_tx,
            inbound: in_rx,
            closed,
        }))
    }
}

struct MemoryConnection {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Result<Frame>>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| Error::Transport("peer went away".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        self.inbound.recv().await
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        *self.closed.lock().unwrap() = Some((code, reason.to_string()));
        Ok(())
    }
}

/// The agent's end of one in-memory connection
pub struct Peer {
    pub url: String,
    sent: mpsc::UnboundedReceiver<Frame>,
    inbound: Option<mpsc::UnboundedSender<Result<Frame>>>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
}

impl Peer {
    /// Deliver a text frame to the client
    pub fn send_text(&self, text: &str) {
        self.push(Ok(Frame::Text(text.to_string())));
    }

    /// Deliver a JSON control message to the client
    pub fn send_json(&self, value: &serde_json::Value) {
        self.send_text(&value.to_string());
    }

    /// Deliver a binary frame to the client
    pub fn send_binary(&self, bytes: Vec<u8>) {
        self.push(Ok(Frame::Binary(bytes)));
    }

    /// Close from the agent side with `code`
    pub fn close(&self, code: u16) {
        self.push(Ok(Frame::Close(Some(code))));
    }

    /// End the stream without a close frame
    pub fn drop_connection(&mut self) {
        self.inbound = None;
    }

    fn push(&self, frame: Result<Frame>) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(frame);
        }
    }

    /// Next frame the client sent
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.sent.recv().await
    }

    /// Next JSON text frame the client sent, skipping audio
    pub async fn next_json(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.sent.recv().await? {
                Frame::Text(text) => return serde_json::from_str(&text).ok(),
                Frame::Binary(_) | Frame::Close(_) => {}
            }
        }
    }

    /// Next JSON message of the given `type`, skipping everything else
    pub async fn next_of_type(&mut self, kind: &str) -> Option<serde_json::Value> {
        loop {
            let msg = self.next_json().await?;
            if msg["type"] == kind {
                return Some(msg);
            }
        }
    }

    /// Next binary frame the client sent, skipping control messages
    pub async fn next_binary(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.sent.recv().await? {
                Frame::Binary(bytes) => return Some(bytes),
                Frame::Text(_) | Frame::Close(_) => {}
            }
        }
    }

    /// Frames already sent, without waiting
    pub fn sent_so_far(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Close code and reason, if the client closed this connection
    #[must_use]
    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.closed.lock().unwrap().clone()
    }
}

// ---- audio ----

/// How a [`FakeCapture`] responds to probing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicBehavior {
    Works,
    Denied,
    Missing,
}

/// Test side of a [`FakeCapture`]
#[derive(Clone, Default)]
pub struct MicHandle {
    sink: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
    starts: Arc<AtomicUsize>,
    probes: Arc<AtomicUsize>,
}

impl MicHandle {
    /// Feed one raw chunk as if the audio callback produced it
    ///
    /// Returns `false` if the microphone is not running.
    pub fn feed(&self, samples: Vec<f32>) -> bool {
        self.sink
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.try_send(samples).is_ok())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    #[must_use]
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

/// Capture device fed by the test through a [`MicHandle`]
pub struct FakeCapture {
    rate: u32,
    behavior: MicBehavior,
    handle: MicHandle,
}

impl FakeCapture {
    #[must_use]
    pub fn new(rate: u32, behavior: MicBehavior) -> (Self, MicHandle) {
        let handle = MicHandle::default();
        let capture = Self {
            rate,
            behavior,
            handle: handle.clone(),
        };
        (capture, handle)
    }

    fn check(&self) -> Result<()> {
        match self.behavior {
            MicBehavior::Works => Ok(()),
            MicBehavior::Denied => Err(Error::Permission("NotAllowedError".to_string())),
            MicBehavior::Missing => Err(Error::Device("no input device available".to_string())),
        }
    }
}

impl CaptureDevice for FakeCapture {
    fn probe(&mut self) -> Result<()> {
        self.handle.probes.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    fn start(&mut self, sink: mpsc::Sender<Vec<f32>>) -> Result<u32> {
        self.check()?;
        self.handle.starts.fetch_add(1, Ordering::SeqCst);
        *self.handle.sink.lock().unwrap() = Some(sink);
        Ok(self.rate)
    }

    fn stop(&mut self) {
        self.handle.sink.lock().unwrap().take();
    }

    fn is_active(&self) -> bool {
        self.handle.is_running()
    }
}

/// What a [`FakeOutput`] was asked to play
#[derive(Debug, Clone, PartialEq)]
pub struct Queued {
    pub start: f64,
    pub samples: usize,
    pub rate: u32,
}

/// Test side of a [`FakeOutput`]
#[derive(Clone, Default)]
pub struct SpeakerHandle {
    now: Arc<Mutex<f64>>,
    queued: Arc<Mutex<VecDeque<Queued>>>,
    broken: Arc<AtomicBool>,
}

impl SpeakerHandle {
    /// Move the device clock to `secs`
    pub fn set_time(&self, secs: f64) {
        *self.now.lock().unwrap() = secs;
    }

    /// Make every further enqueue fail
    pub fn break_device(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn queued(&self) -> Vec<Queued> {
        self.queued.lock().unwrap().iter().cloned().collect()
    }
}

/// Output device with a manually driven clock
pub struct FakeOutput {
    handle: SpeakerHandle,
}

impl FakeOutput {
    #[must_use]
    pub fn new() -> (Self, SpeakerHandle) {
        let handle = SpeakerHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl OutputDevice for FakeOutput {
    fn current_time(&self) -> f64 {
        *self.handle.now.lock().unwrap()
    }

    fn enqueue(&mut self, start_at: f64, samples: &[f32], sample_rate: u32) -> Result<()> {
        if self.handle.broken.load(Ordering::SeqCst) {
            return Err(Error::Device("output device lost".to_string()));
        }
        self.handle.queued.lock().unwrap().push_back(Queued {
            start: start_at,
            samples: samples.len(),
            rate: sample_rate,
        });
        Ok(())
    }
}

/// Yield until `cond` holds, without letting paused time move
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if cond() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    cond()
}

/// Sleep in paused time
pub async fn advance(secs: f64) {
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}
