//! Duplex connection to the conversational agent
//!
//! [`Transport`] owns the connection and drives its lifecycle: handshake,
//! initiation, keep-alive, inbound dispatch and backoff reconnects. The
//! network itself sits behind [`Connector`] / [`Connection`] so the state
//! machine can run against an in-memory peer.

mod backoff;
mod machine;
mod ws;

use async_trait::async_trait;

pub use backoff::ReconnectPolicy;
pub use machine::Transport;
pub use ws::{WsConnection, WsConnector};

use crate::Result;

/// Normal closure code
pub const CLOSE_NORMAL: u16 = 1000;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl ConnectionState {
    /// Whether a connect request should be ignored in this state
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

/// One message on the duplex connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Peer closed, with its close code if it sent one
    Close(Option<u16>),
}

/// Opens connections to the agent
#[async_trait]
pub trait Connector: Send + Sync {
    /// Complete the handshake with `url`
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` or `Error::WebSocket` if the handshake fails
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>>;
}

/// An open duplex connection
#[async_trait]
pub trait Connection: Send {
    /// Send one frame
    ///
    /// # Errors
    ///
    /// Returns a transport error if the connection is broken
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Next inbound frame; `None` once the stream has ended
    async fn recv(&mut self) -> Option<Result<Frame>>;

    /// Close with `code` and `reason`
    ///
    /// # Errors
    ///
    /// Returns a transport error if the close frame cannot be sent
    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}
