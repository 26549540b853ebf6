//! Audio signal path
//!
//! Uplink: microphone → accumulator → resampler → PCM16LE frames.
//! Downlink: PCM16LE chunks → decoder → playback scheduler → output device.

mod capture;
pub mod device;
pub mod pcm;
mod playback;
pub mod resample;
pub mod scheduler;
pub mod uplink;

pub use capture::CpalCapture;
pub use device::{CaptureDevice, Devices, OutputDevice};
pub use pcm::{decode_pcm16le, encode_pcm16le, samples_to_wav, wav_to_samples};
pub use playback::CpalOutput;
pub use resample::{LinearResampler, TARGET_SAMPLE_RATE, resample_linear};
pub use scheduler::{PlaybackScheduler, ScheduledChunk};
pub use uplink::UplinkCapturer;
