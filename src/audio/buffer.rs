//! Decoded, immutable audio samples.

use std::sync::Arc;

/// Interleaved f32 PCM produced by the decode pipeline.
///
/// Cloning is cheap: the samples live behind an `Arc<[f32]>` and are never
/// written after construction, so every playback node reads the same data.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: Arc<[f32]>,
    channels: u16,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Wrap interleaved samples. Returns `None` for a zero channel count or
    /// sample rate, which no output device can play.
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Option<Self> {
        if channels == 0 || sample_rate == 0 {
            return None;
        }
        Some(Self {
            samples: samples.into(),
            channels,
            sample_rate,
        })
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Total duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Interleaved tail starting at the frame nearest `offset_secs`.
    ///
    /// Always starts on a frame boundary so channels stay aligned. Offsets
    /// past the end yield an empty slice.
    pub fn samples_from(&self, offset_secs: f64) -> &[f32] {
        let offset = if offset_secs.is_finite() {
            offset_secs.max(0.0)
        } else {
            0.0
        };
        let frame = ((offset * self.sample_rate as f64).round() as usize).min(self.frames());
        &self.samples[frame * self.channels as usize..]
    }
}
