//! Linear-interpolation sample-rate conversion
//!
//! Mono only. There is no anti-aliasing filter, so downsampling folds content
//! above the new Nyquist frequency back into the band. Speech survives this
//! well enough for the agent's recognizer; music does not.

use std::borrow::Cow;

/// Sample rate of every frame sent to and received from the agent
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Number of output samples produced for `len` input samples
///
/// Always `floor(len * out_rate / in_rate)`, computed in integer arithmetic.
#[must_use]
pub fn output_len(len: usize, in_rate: u32, out_rate: u32) -> usize {
    if in_rate == 0 {
        return 0;
    }
    let scaled = (len as u128) * u128::from(out_rate) / u128::from(in_rate);
    usize::try_from(scaled).unwrap_or(usize::MAX)
}

/// Resample `input` from `in_rate` to `out_rate`
///
/// Returns the input untouched when the rates already match.
#[must_use]
pub fn resample_linear(input: &[f32], in_rate: u32, out_rate: u32) -> Cow<'_, [f32]> {
    if in_rate == out_rate {
        return Cow::Borrowed(input);
    }

    let n = output_len(input.len(), in_rate, out_rate);
    if n == 0 || input.is_empty() {
        return Cow::Owned(Vec::new());
    }

    let ratio = f64::from(in_rate) / f64::from(out_rate);
    let last = input.len() - 1;
    let mut out = Vec::with_capacity(n);

    for i in 0..n {
        // Position is recomputed from `i` each step so error does not accumulate
        let pos = i as f64 * ratio;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let idx = (pos.floor() as usize).min(last);
        #[allow(clippy::cast_possible_truncation)]
        let frac = (pos - idx as f64) as f32;

        let s0 = input[idx];
        let s1 = if idx < last { input[idx + 1] } else { s0 };
        out.push((s1 - s0).mul_add(frac, s0));
    }

    Cow::Owned(out)
}

/// Fixed-rate resampler bound to one input rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearResampler {
    in_rate: u32,
    out_rate: u32,
}

impl LinearResampler {
    /// Create a resampler converting `in_rate` into `out_rate`
    #[must_use]
    pub const fn new(in_rate: u32, out_rate: u32) -> Self {
        Self { in_rate, out_rate }
    }

    /// Resampler targeting the agent's 16 kHz wire rate
    #[must_use]
    pub const fn to_target(in_rate: u32) -> Self {
        Self::new(in_rate, TARGET_SAMPLE_RATE)
    }

    /// Input rate in Hz
    #[must_use]
    pub const fn in_rate(&self) -> u32 {
        self.in_rate
    }

    /// Output rate in Hz
    #[must_use]
    pub const fn out_rate(&self) -> u32 {
        self.out_rate
    }

    /// Whether this resampler passes audio through unchanged
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        self.in_rate == self.out_rate
    }

    /// Convert one buffer
    #[must_use]
    pub fn process<'a>(&self, input: &'a [f32]) -> Cow<'a, [f32]> {
        resample_linear(input, self.in_rate, self.out_rate)
    }
}
