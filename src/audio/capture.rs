//! Microphone capture and the live amplitude signal.
//!
//! The capture stream is a single shared resource owned for the session
//! lifetime. Recording taps subscribe and unsubscribe freely; nothing but
//! session teardown closes the underlying device stream.

use crate::audio::AudioChunk;
use crate::audio::resample::resample_linear;
use crate::config::AudioConfig;
use crate::error::{Result, SessionError};
use crate::snapshot::FrameSource;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Capacity of the capture fan-out channel.
const CHUNK_CHANNEL_SIZE: usize = 64;

/// Handle onto the live capture stream.
///
/// Cheap to clone; each consumer subscribes independently. A UI layer (or a
/// test) may also construct one directly around its own channels.
#[derive(Clone)]
pub struct CaptureHandle {
    chunks: broadcast::Sender<AudioChunk>,
    amplitude: watch::Receiver<f32>,
    frames: Option<Arc<dyn FrameSource>>,
}

impl CaptureHandle {
    /// Build a handle from pre-existing channels and an optional camera
    /// preview source.
    pub fn new(
        chunks: broadcast::Sender<AudioChunk>,
        amplitude: watch::Receiver<f32>,
        frames: Option<Arc<dyn FrameSource>>,
    ) -> Self {
        Self {
            chunks,
            amplitude,
            frames,
        }
    }

    /// Subscribe to live audio chunks. Receivers that fall behind drop
    /// chunks rather than stalling the capture thread.
    pub fn subscribe(&self) -> broadcast::Receiver<AudioChunk> {
        self.chunks.subscribe()
    }

    /// The live amplitude signal for waveform visualization.
    ///
    /// Updated once per analysis frame for the whole session, independent of
    /// recording state; with nobody speaking it simply hovers near zero.
    pub fn amplitude(&self) -> watch::Receiver<f32> {
        self.amplitude.clone()
    }

    /// Camera preview frame source, when a camera is available.
    pub fn frames(&self) -> Option<Arc<dyn FrameSource>> {
        self.frames.clone()
    }
}

/// Microphone capture via cpal.
///
/// Captures at the device's native sample rate and downsamples to the
/// configured capture rate in software.
pub struct MicCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
    analysis_window: usize,
    chunks: broadcast::Sender<AudioChunk>,
    amplitude_rx: watch::Receiver<f32>,
    amplitude_tx: watch::Sender<f32>,
    frames: Option<Arc<dyn FrameSource>>,
}

impl MicCapture {
    /// Acquire the input device.
    ///
    /// Failure here is terminal for starting an interview: the caller must
    /// surface it before enabling any recording controls.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Device`] if no usable input device exists.
    pub fn acquire(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            host.input_devices()
                .map_err(|e| SessionError::Device(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| SessionError::Device(format!("input device '{name}' not found")))?
        } else {
            host.default_input_device()
                .ok_or_else(|| SessionError::Device("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| SessionError::Device(format!("no default input config: {e}")))?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();

        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "native input config: {}Hz, {} channels",
            native_rate, native_channels
        );

        let (chunks, _) = broadcast::channel(CHUNK_CHANNEL_SIZE);
        let (amplitude_tx, amplitude_rx) = watch::channel(0.0f32);

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: config.capture_sample_rate,
            analysis_window: config.analysis_window,
            chunks,
            amplitude_rx,
            amplitude_tx,
            frames: None,
        })
    }

    /// Attach a camera preview source for snapshot capture.
    pub fn with_frames(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Handle for consumers (recorder taps, waveform UI, snapshots).
    pub fn handle(&self) -> CaptureHandle {
        CaptureHandle {
            chunks: self.chunks.clone(),
            amplitude: self.amplitude_rx.clone(),
            frames: self.frames.clone(),
        }
    }

    /// Run the capture stream and the amplitude analyser until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio stream cannot be created or started.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let chunk_tx = self.chunks.clone();

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };

                    let samples = if native_rate != target_rate {
                        resample_linear(&mono, native_rate, target_rate)
                    } else {
                        mono
                    };

                    // Send never blocks the audio thread; with no receivers
                    // the chunk is simply dropped.
                    let _ = chunk_tx.send(AudioChunk {
                        samples,
                        sample_rate: target_rate,
                        captured_at: Instant::now(),
                    });
                },
                move |err| {
                    tracing::error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| SessionError::Device(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| SessionError::Device(format!("failed to start input stream: {e}")))?;

        info!(
            "audio capture started: native {}Hz -> target {}Hz",
            native_rate, target_rate
        );

        let analyser = tokio::spawn(run_amplitude_analyser(
            self.chunks.subscribe(),
            self.amplitude_tx.clone(),
            self.analysis_window,
            cancel.clone(),
        ));

        cancel.cancelled().await;

        drop(stream);
        let _ = analyser.await;
        info!("audio capture stopped");
        Ok(())
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Amplitude analysis loop: one value per incoming chunk for the lifetime
/// of the capture stream.
pub async fn run_amplitude_analyser(
    mut rx: broadcast::Receiver<AudioChunk>,
    tx: watch::Sender<f32>,
    window: usize,
    cancel: CancellationToken,
) {
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(window);
    let mut ring: Vec<f32> = Vec::with_capacity(window * 2);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            chunk = rx.recv() => {
                match chunk {
                    Ok(chunk) => {
                        ring.extend_from_slice(&chunk.samples);
                        let excess = ring.len().saturating_sub(window);
                        if excess > 0 {
                            ring.drain(..excess);
                        }
                        if ring.len() < window {
                            continue;
                        }
                        let level = spectral_amplitude(&ring, fft.as_ref(), window);
                        let _ = tx.send(level);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("amplitude analyser lagged, skipped {skipped} chunks");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Mean FFT bin magnitude of a Hann-windowed frame, normalized to roughly
/// 0..1 for UI meters.
fn spectral_amplitude(samples: &[f32], fft: &dyn rustfft::Fft<f32>, window: usize) -> f32 {
    let mut buf: Vec<Complex<f32>> = samples[..window]
        .iter()
        .enumerate()
        .map(|(n, &s)| {
            let w = 0.5
                * (1.0 - (2.0 * std::f32::consts::PI * n as f32 / (window - 1) as f32).cos());
            Complex::new(s * w, 0.0)
        })
        .collect();

    fft.process(&mut buf);

    let bins = window / 2;
    let sum: f32 = buf[..bins].iter().map(|c| c.norm()).sum();
    // A full-scale Hann-windowed sine concentrates ~window/4 of magnitude in
    // one bin; dividing by that puts speech in a sensible 0..1 band.
    (sum / bins as f32) / (window as f32 / 4.0)
}
