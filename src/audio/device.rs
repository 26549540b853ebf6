//! Audio device capabilities
//!
//! The transport never talks to cpal directly. It drives these traits, which
//! lets tests swap in synthetic devices that feed deterministic buffers.

use tokio::sync::mpsc;

use super::{CpalCapture, CpalOutput};
use crate::Result;
use crate::config::AudioConfig;

/// Microphone capture capability
///
/// Implementations deliver mono `f32` chunks to the sink handed to `start`.
/// Chunk size and cadence are decided by the audio subsystem.
pub trait CaptureDevice: Send {
    /// Check that a capture device exists and may be opened
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if access is denied, `Error::Device` if
    /// there is no usable input device
    fn probe(&mut self) -> Result<()>;

    /// Acquire the device and start streaming chunks into `sink`
    ///
    /// Returns the device's input sample rate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` or `Error::Device` if the stream cannot start
    fn start(&mut self, sink: mpsc::Sender<Vec<f32>>) -> Result<u32>;

    /// Release the device; safe to call when already stopped
    fn stop(&mut self);

    /// Whether a capture stream is currently open
    fn is_active(&self) -> bool;
}

/// Audio output capability with a monotonic clock
pub trait OutputDevice: Send {
    /// Current device time in seconds
    ///
    /// Monotonic; zero when the device was opened.
    fn current_time(&self) -> f64;

    /// Queue mono samples to start playing at `start_at` seconds on the device clock
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the device has gone away
    fn enqueue(&mut self, start_at: f64, samples: &[f32], sample_rate: u32) -> Result<()>;
}

/// The pair of devices a call runs with
///
/// Either side may be missing; the call then runs without a microphone or
/// without playback.
#[derive(Default)]
pub struct Devices {
    pub capture: Option<Box<dyn CaptureDevice>>,
    pub output: Option<Box<dyn OutputDevice>>,
}

impl Devices {
    /// No audio at all
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Default system devices, as enabled in `audio`
    ///
    /// A missing output device is logged and leaves playback disabled.
    #[must_use]
    pub fn system(audio: &AudioConfig) -> Self {
        let capture = audio
            .capture
            .then(|| Box::new(CpalCapture::new()) as Box<dyn CaptureDevice>);

        let output = if audio.playback {
            match CpalOutput::open() {
                Ok(out) => Some(Box::new(out) as Box<dyn OutputDevice>),
                Err(e) => {
                    tracing::warn!(error = %e, "playback disabled");
                    None
                }
            }
        } else {
            None
        };

        Self { capture, output }
    }
}
