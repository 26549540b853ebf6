//! Audio playback to speakers

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};

use super::device::OutputDevice;
use super::resample::resample_linear;
use crate::{Error, Result};

/// Audio queued at an absolute frame position on the device timeline
struct Segment {
    start_frame: u64,
    samples: Vec<f32>,
}

impl Segment {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Shared between the output callback and the scheduler side
#[derive(Default)]
struct Timeline {
    frames_played: u64,
    segments: VecDeque<Segment>,
}

impl Timeline {
    /// Render the next `out.len() / channels` frames into `out`
    fn render(&mut self, out: &mut [f32], channels: usize) {
        out.fill(0.0);
        let frames = (out.len() / channels) as u64;
        let window_start = self.frames_played;
        let window_end = window_start + frames;

        for seg in &self.segments {
            if seg.start_frame >= window_end {
                break;
            }
            let from = seg.start_frame.max(window_start);
            let to = seg.end_frame().min(window_end);
            for frame in from..to {
                #[allow(clippy::cast_possible_truncation)]
                let sample = seg.samples[(frame - seg.start_frame) as usize];
                #[allow(clippy::cast_possible_truncation)]
                let base = (frame - window_start) as usize * channels;
                for slot in &mut out[base..base + channels] {
                    *slot += sample;
                }
            }
        }

        self.frames_played = window_end;
        while self
            .segments
            .front()
            .is_some_and(|s| s.end_frame() <= self.frames_played)
        {
            self.segments.pop_front();
        }
    }

    fn insert(&mut self, segment: Segment) {
        let pos = self
            .segments
            .iter()
            .position(|s| s.start_frame > segment.start_frame)
            .unwrap_or(self.segments.len());
        self.segments.insert(pos, segment);
    }
}

/// Plays scheduled audio on the default output device
///
/// The device clock is the number of frames the output callback has
/// rendered. Scheduled buffers are resampled to the device rate and placed
/// at absolute frame positions, so consecutive buffers join without gaps.
pub struct CpalOutput {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
    stop_tx: std_mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device and start its clock
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if no usable output device exists
    pub fn open() -> Result<Self> {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let shared = Arc::clone(&timeline);
        let handle = std::thread::Builder::new()
            .name("beacon-playback".to_string())
            .spawn(move || match open_output_stream(shared) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let sample_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => return Err(Error::Device("playback thread exited early".to_string())),
        };

        Ok(Self {
            timeline,
            sample_rate,
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Device output rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seconds of audio still queued ahead of the clock
    #[must_use]
    pub fn queued_secs(&self) -> f64 {
        let Ok(timeline) = self.timeline.lock() else {
            return 0.0;
        };
        let end = timeline
            .segments
            .back()
            .map_or(timeline.frames_played, Segment::end_frame);
        #[allow(clippy::cast_precision_loss)]
        let frames = end.saturating_sub(timeline.frames_played) as f64;
        frames / f64::from(self.sample_rate)
    }
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        let frames = self.timeline.lock().map_or(0, |t| t.frames_played);
        #[allow(clippy::cast_precision_loss)]
        let frames = frames as f64;
        frames / f64::from(self.sample_rate)
    }

    fn enqueue(&mut self, start_at: f64, samples: &[f32], sample_rate: u32) -> Result<()> {
        if sample_rate == 0 {
            return Err(Error::Device("zero sample rate".to_string()));
        }
        let (start_frame, end_frame) =
            frame_span(start_at, samples.len(), sample_rate, self.sample_rate);

        // Both ends are rounded from the scheduler's clock, so the next chunk
        // starts exactly where this one ends
        let mut resampled = resample_linear(samples, sample_rate, self.sample_rate).into_owned();
        #[allow(clippy::cast_possible_truncation)]
        let len = (end_frame - start_frame) as usize;
        let pad = resampled.last().copied().unwrap_or(0.0);
        resampled.resize(len, pad);

        let mut timeline = self
            .timeline
            .lock()
            .map_err(|_| Error::Device("playback timeline poisoned".to_string()))?;
        timeline.insert(Segment {
            start_frame,
            samples: resampled,
        });
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Device frames `[start, end)` covered by `len` samples starting at `start_at`
fn frame_span(start_at: f64, len: usize, sample_rate: u32, device_rate: u32) -> (u64, u64) {
    #[allow(clippy::cast_precision_loss)]
    let end_at = start_at + len as f64 / f64::from(sample_rate);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let to_frame = |secs: f64| (secs * f64::from(device_rate)).round().max(0.0) as u64;
    let start = to_frame(start_at);
    (start, to_frame(end_at).max(start))
}

fn open_output_stream(timeline: Arc<Mutex<Timeline>>) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Device("no output device available".to_string()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| Error::Device(e.to_string()))?;
    if supported.sample_format() != SampleFormat::F32 {
        return Err(Error::Device(format!(
            "unsupported output sample format {:?}",
            supported.sample_format()
        )));
    }

    let sample_rate = supported.sample_rate().0;
    let channels = usize::from(supported.channels().max(1));
    let config: StreamConfig = supported.config();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if let Ok(mut timeline) = timeline.lock() {
                    timeline.render(data, channels);
                } else {
                    data.fill(0.0);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))?;

    stream.play().map_err(|e| Error::Device(e.to_string()))?;

    tracing::debug!(
        device = %device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio playback initialized"
    );

    Ok((stream, sample_rate))
}
