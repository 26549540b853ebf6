//! Gap-free playback scheduling against the output clock

use super::device::OutputDevice;
use super::pcm::decode_pcm16le;
use crate::Result;

/// Placement of one buffer on the output timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    /// Start time in seconds on the output clock
    pub start: f64,
    /// Duration in seconds
    pub duration: f64,
}

impl ScheduledChunk {
    /// Time at which this chunk finishes playing
    #[must_use]
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Schedules decoded buffers back-to-back on the output device
///
/// Keeps a cursor marking the end of already-queued audio. Each new buffer
/// starts at the cursor, or at the current device time if the cursor has
/// fallen behind (underrun). The cursor never moves backward.
pub struct PlaybackScheduler {
    output: Option<Box<dyn OutputDevice>>,
    cursor: f64,
}

impl PlaybackScheduler {
    /// Create a scheduler for `output`; `None` makes every call a no-op
    #[must_use]
    pub fn new(output: Option<Box<dyn OutputDevice>>) -> Self {
        Self {
            output,
            cursor: 0.0,
        }
    }

    /// Scheduler with no output device
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Replace the output device and reset the cursor
    pub fn attach(&mut self, output: Box<dyn OutputDevice>) {
        self.output = Some(output);
        self.cursor = 0.0;
    }

    /// Whether an output device is attached
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.output.is_some()
    }

    /// End of already-scheduled audio, in seconds
    #[must_use]
    pub const fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Seconds until already-scheduled audio finishes playing
    #[must_use]
    pub fn remaining(&self) -> f64 {
        self.output
            .as_ref()
            .map_or(0.0, |out| (self.cursor - out.current_time()).max(0.0))
    }

    /// Schedule a float buffer right after previously scheduled audio
    ///
    /// Returns `None` without touching the cursor if no device is attached,
    /// the buffer is empty, or the device rejects it. Rejected audio is dropped.
    pub fn schedule(&mut self, samples: &[f32], sample_rate: u32) -> Option<ScheduledChunk> {
        if samples.is_empty() || sample_rate == 0 {
            return None;
        }
        let output = self.output.as_mut()?;

        let now = output.current_time();
        let start = if self.cursor < now { now } else { self.cursor };

        #[allow(clippy::cast_precision_loss)]
        let duration = samples.len() as f64 / f64::from(sample_rate);

        if let Err(e) = output.enqueue(start, samples, sample_rate) {
            tracing::warn!(error = %e, "output device rejected audio, dropping chunk");
            return None;
        }

        self.cursor = start + duration;
        tracing::trace!(start, duration, cursor = self.cursor, "scheduled playback");

        Some(ScheduledChunk { start, duration })
    }

    /// Decode a PCM16LE chunk and schedule it
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if the chunk has an odd byte count
    pub fn schedule_pcm16(&mut self, pcm: &[u8], sample_rate: u32) -> Result<Option<ScheduledChunk>> {
        let samples = decode_pcm16le(pcm)?;
        Ok(self.schedule(&samples, sample_rate))
    }
}
