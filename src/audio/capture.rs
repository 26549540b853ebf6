//! Audio capture from microphone

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::device::CaptureDevice;
use crate::{Error, Result};

/// Captures mono audio from the default input device
///
/// cpal streams are not `Send`, so each open stream lives on its own thread
/// and is dropped there when `stop` is called.
#[derive(Default)]
pub struct CpalCapture {
    worker: Option<Worker>,
}

struct Worker {
    stop_tx: std_mpsc::Sender<()>,
    handle: JoinHandle<()>,
    sample_rate: u32,
}

impl CpalCapture {
    /// Create a capture device handle; nothing is opened until `start`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureDevice for CpalCapture {
    fn probe(&mut self) -> Result<()> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Device("no input device available".to_string()))?;
        let config = device
            .default_input_config()
            .map_err(|e| classify(&e.to_string()))?;

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            sample_rate = config.sample_rate().0,
            channels = config.channels(),
            "input device available"
        );
        Ok(())
    }

    fn start(&mut self, sink: mpsc::Sender<Vec<f32>>) -> Result<u32> {
        if let Some(worker) = &self.worker {
            return Ok(worker.sample_rate);
        }

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("beacon-capture".to_string())
            .spawn(move || match open_input_stream(sink) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    // Park until stop() or the handle is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(sample_rate)) => {
                self.worker = Some(Worker {
                    stop_tx,
                    handle,
                    sample_rate,
                });
                tracing::debug!(sample_rate, "audio capture started");
                Ok(sample_rate)
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(Error::Device("capture thread exited early".to_string())),
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            let _ = worker.handle.join();
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input_stream(sink: mpsc::Sender<Vec<f32>>) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Device("no input device available".to_string()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| classify(&e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let channels = usize::from(supported.channels().max(1));
    let config: StreamConfig = supported.config();

    let err_fn = |err: cpal::StreamError| {
        tracing::error!(error = %err, "audio capture error");
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| forward(&sink, data, channels, |s| s),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                forward(&sink, data, channels, |s| f32::from(s) / 32768.0);
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                forward(&sink, data, channels, |s| (f32::from(s) - 32768.0) / 32768.0);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(Error::Device(format!(
                "unsupported input sample format {other:?}"
            )));
        }
    }
    .map_err(|e| classify(&e.to_string()))?;

    stream.play().map_err(|e| classify(&e.to_string()))?;

    tracing::debug!(
        device = %device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio capture initialized"
    );

    Ok((stream, sample_rate))
}

/// Downmix one callback buffer to mono and hand it to the event loop
fn forward<T: Copy>(
    sink: &mpsc::Sender<Vec<f32>>,
    data: &[T],
    channels: usize,
    convert: impl Fn(T) -> f32,
) {
    #[allow(clippy::cast_precision_loss)]
    let div = channels as f32;
    let mono: Vec<f32> = data
        .chunks(channels)
        .map(|frame| frame.iter().map(|&s| convert(s)).sum::<f32>() / div)
        .collect();

    if sink.try_send(mono).is_err() {
        tracing::trace!("capture queue full or closed, dropping chunk");
    }
}

/// Map a backend error message to the permission/device split
fn classify(message: &str) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        Error::Permission(message.to_string())
    } else {
        Error::Device(message.to_string())
    }
}
