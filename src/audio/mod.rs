//! Audio capture, decode, resampling and local playback.

pub mod capture;
pub mod decode;
pub mod playback;
pub mod resample;

use std::time::Instant;

/// A chunk of raw audio samples from the microphone.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// f32 samples, mono, at the configured capture sample rate.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Timestamp when this chunk was captured.
    pub captured_at: Instant,
}
