//! PCM16LE quantization and WAV containers

use std::io::Cursor;

use crate::{Error, Result};

/// Bytes per PCM16 sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Quantize float samples to 16-bit little-endian PCM
///
/// Samples outside `[-1.0, 1.0]` are clamped before scaling by 32767.
#[must_use]
pub fn encode_pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &s in samples {
        out.extend_from_slice(&quantize(s).to_le_bytes());
    }
    out
}

/// Dequantize 16-bit little-endian PCM to floats in `[-1.0, 1.0)`
///
/// # Errors
///
/// Returns `Error::Format` if `bytes` has an odd length
pub fn decode_pcm16le(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        return Err(Error::Format(format!(
            "PCM16 buffer has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect())
}

#[allow(clippy::cast_possible_truncation)]
fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Encode mono samples as a 16-bit WAV file
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(quantize(sample))?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// Decode a WAV file into mono float samples and its sample rate
///
/// Multi-channel files are averaged down to mono.
///
/// # Errors
///
/// Returns error if the bytes are not a readable WAV file
pub fn wav_to_samples(wav: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(wav))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    let mono = if channels == 1 {
        interleaved
    } else {
        #[allow(clippy::cast_precision_loss)]
        let div = channels as f32;
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / div)
            .collect()
    };

    Ok((mono, spec.sample_rate))
}
