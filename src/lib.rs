//! Beacon Call - Real-time streaming voice-agent client
//!
//! This library provides the client side of a spoken conversation with a
//! remote agent:
//! - Microphone uplink (framing, resampling, PCM16LE encoding)
//! - Gap-free playback of agent audio against the output clock
//! - Connection lifecycle with keep-alive and backoff reconnects
//! - Control protocol with readiness-gated mic start
//! - A turn-based HTTP fallback mode
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              UI / CLI  (VoiceClient)                 │
//! │   connect │ disconnect │ send_text │ mic │ status   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ commands / status
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Transport loop                      │
//! │   state machine │ keep-alive │ backoff │ protocol   │
//! └───────┬──────────────────────────────────┬──────────┘
//!         │                                  │
//! ┌───────▼─────────┐                ┌───────▼─────────┐
//! │ Uplink capturer │                │ Playback sched. │
//! │ mic → 16k PCM   │                │ PCM → speakers  │
//! └─────────────────┘                └─────────────────┘
//! ```

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod turns;

pub use audio::{CaptureDevice, Devices, OutputDevice, PlaybackScheduler, UplinkCapturer};
pub use client::{ClientStatus, Command, MicAccess, VoiceClient};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{EventLog, EventSink};
pub use protocol::{InboundMessage, InitiationShape, OutboundMessage};
pub use session::{CallParams, SessionIdentity};
pub use transport::{
    Connection, ConnectionState, Connector, Frame, ReconnectPolicy, Transport, WsConnector,
};
pub use turns::{TurnClient, TurnReply, TurnSession};
