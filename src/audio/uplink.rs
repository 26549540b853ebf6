//! Microphone uplink: fixed-duration framing, resampling and encoding

use std::time::Duration;

use tokio::sync::mpsc;

use super::device::CaptureDevice;
use super::pcm::encode_pcm16le;
use super::resample::LinearResampler;
use crate::Result;

/// Raw chunks buffered between the audio callback and the event loop
const CAPTURE_QUEUE_DEPTH: usize = 64;

/// Owns the capture device and turns raw callback audio into wire frames
///
/// Raw chunks arrive at the device rate in whatever size the audio
/// subsystem picks. They are accumulated until one frame (100 ms by default)
/// is available, then resampled to the target rate and quantized to PCM16LE.
pub struct UplinkCapturer {
    device: Box<dyn CaptureDevice>,
    frame_duration: Duration,
    target_rate: u32,
    resampler: Option<LinearResampler>,
    frame_len: usize,
    accumulator: Vec<f32>,
    chunks: Option<mpsc::Receiver<Vec<f32>>>,
}

impl UplinkCapturer {
    /// Create an uplink over `device`
    #[must_use]
    pub fn new(device: Box<dyn CaptureDevice>, frame_duration: Duration, target_rate: u32) -> Self {
        Self {
            device,
            frame_duration,
            target_rate,
            resampler: None,
            frame_len: 0,
            accumulator: Vec::new(),
            chunks: None,
        }
    }

    /// Check the capture device without opening a stream
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` or `Error::Device` from the device
    pub fn probe(&mut self) -> Result<()> {
        self.device.probe()
    }

    /// Acquire the device and start accumulating
    ///
    /// Returns the input sample rate. Calling this while active is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` or `Error::Device` if the device cannot start
    pub fn start(&mut self) -> Result<u32> {
        if let Some(r) = self.resampler
            && self.device.is_active()
        {
            return Ok(r.in_rate());
        }

        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE_DEPTH);
        let in_rate = self.device.start(tx)?;
        self.begin(in_rate);
        self.chunks = Some(rx);

        tracing::debug!(
            in_rate,
            frame_len = self.frame_len,
            target_rate = self.target_rate,
            "uplink started"
        );
        Ok(in_rate)
    }

    /// Release the device and drop any partial frame; idempotent
    pub fn stop(&mut self) {
        self.device.stop();
        self.chunks = None;
        self.accumulator.clear();
        if self.resampler.take().is_some() {
            tracing::debug!("uplink stopped");
        }
    }

    /// Whether a capture stream is running
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.resampler.is_some() && self.device.is_active()
    }

    /// Input rate of the running stream
    #[must_use]
    pub fn input_rate(&self) -> Option<u32> {
        self.resampler.map(|r| r.in_rate())
    }

    /// Samples per frame at the input rate
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Samples waiting for a full frame
    #[must_use]
    pub fn pending(&self) -> usize {
        self.accumulator.len()
    }

    /// Wait for the next raw chunk from the device
    ///
    /// Pends forever while stopped, so it can sit in a `select!` unconditionally.
    pub async fn next_chunk(&mut self) -> Option<Vec<f32>> {
        match self.chunks.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Append raw samples and return every complete frame, encoded, in capture order
    pub fn push(&mut self, raw: &[f32]) -> Vec<Vec<u8>> {
        let Some(resampler) = self.resampler else {
            return Vec::new();
        };

        self.accumulator.extend_from_slice(raw);

        let mut frames = Vec::new();
        while self.frame_len > 0 && self.accumulator.len() >= self.frame_len {
            let pcm = encode_pcm16le(&resampler.process(&self.accumulator[..self.frame_len]));
            self.accumulator.drain(..self.frame_len);
            frames.push(pcm);
        }
        frames
    }

    /// Push every chunk the device has already queued, without waiting
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut raw = Vec::new();
        if let Some(rx) = self.chunks.as_mut() {
            while let Ok(chunk) = rx.try_recv() {
                raw.extend(chunk);
            }
        }
        self.push(&raw)
    }

    /// Encode whatever partial frame is buffered
    ///
    /// Returns `None` when nothing is buffered or the partial frame is too
    /// short to produce a single output sample.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        let resampler = self.resampler?;
        if self.accumulator.is_empty() {
            return None;
        }

        let pcm = {
            let resampled = resampler.process(&self.accumulator);
            (!resampled.is_empty()).then(|| encode_pcm16le(&resampled))
        };
        self.accumulator.clear();
        pcm
    }

    fn begin(&mut self, in_rate: u32) {
        let samples = f64::from(in_rate) * self.frame_duration.as_secs_f64();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let frame_len = samples.round().max(1.0) as usize;

        self.frame_len = frame_len;
        self.resampler = Some(LinearResampler::new(in_rate, self.target_rate));
        self.accumulator.clear();
        self.accumulator.reserve(frame_len * 2);
    }
}

impl Drop for UplinkCapturer {
    fn drop(&mut self) {
        self.device.stop();
    }
}
