//! Local fallback playback path for question audio.
//!
//! When the avatar renderer is not ready in time, question speech plays
//! through the system output device instead. The speaking indicator is
//! derived from this path's own lifecycle signals, mirroring how a media
//! element reports play/ended/error.

use crate::audio::decode::decode_to_mono_f32;
use crate::config::AudioConfig;
use crate::error::{Result, SessionError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Lifecycle signals emitted by a fallback playback attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackSignal {
    /// Rendering began.
    Started,
    /// Rendering ran to completion.
    Ended,
    /// Rendering failed (decode or device error).
    Error(String),
}

/// A local playback path for encoded question audio.
///
/// `play` must not block the caller: implementations render in the
/// background and report through `signals`. Cancelling the token stops
/// output immediately; a cancelled attempt emits no further signals.
pub trait FallbackPlayer: Send + Sync {
    fn play(
        &self,
        audio: Vec<u8>,
        extension_hint: Option<String>,
        signals: mpsc::UnboundedSender<FallbackSignal>,
        cancel: CancellationToken,
    );
}

/// Fallback playback through the system output device via cpal.
pub struct CpalFallback {
    config: AudioConfig,
}

impl CpalFallback {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

impl FallbackPlayer for CpalFallback {
    fn play(
        &self,
        audio: Vec<u8>,
        extension_hint: Option<String>,
        signals: mpsc::UnboundedSender<FallbackSignal>,
        cancel: CancellationToken,
    ) {
        let output_device = self.config.output_device.clone();
        // cpal streams are not Send; the whole render lives on one thread.
        std::thread::spawn(move || {
            let (samples, sample_rate) =
                match decode_to_mono_f32(audio, extension_hint.as_deref()) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        let _ = signals.send(FallbackSignal::Error(e.to_string()));
                        return;
                    }
                };

            if cancel.is_cancelled() {
                return;
            }

            let _ = signals.send(FallbackSignal::Started);
            match play_blocking(&samples, sample_rate, output_device.as_deref(), &cancel) {
                Ok(()) => {
                    if !cancel.is_cancelled() {
                        let _ = signals.send(FallbackSignal::Ended);
                    }
                }
                Err(e) => {
                    let _ = signals.send(FallbackSignal::Error(e.to_string()));
                }
            }
        });
    }
}

/// Play mono samples through the output device, polling for completion or
/// cancellation.
fn play_blocking(
    samples: &[f32],
    sample_rate: u32,
    output_device: Option<&str>,
    cancel: &CancellationToken,
) -> Result<()> {
    let host = cpal::default_host();

    let device = if let Some(name) = output_device {
        host.output_devices()
            .map_err(|e| SessionError::Device(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| SessionError::Device(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| SessionError::Device("no default output device".into()))?
    };

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples: samples.to_vec(),
        position: 0,
        finished: false,
    }));
    let buffer_clone = Arc::clone(&buffer);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut buf = match buffer_clone.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };

                for sample in data.iter_mut() {
                    if buf.position < buf.samples.len() {
                        *sample = buf.samples[buf.position];
                        buf.position += 1;
                    } else {
                        *sample = 0.0;
                        buf.finished = true;
                    }
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| SessionError::Device(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| SessionError::Device(format!("failed to start output stream: {e}")))?;

    info!(
        "fallback playback started: {} samples at {sample_rate}Hz",
        samples.len()
    );

    loop {
        if cancel.is_cancelled() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
        let buf = buffer
            .lock()
            .map_err(|e| SessionError::Device(format!("playback buffer lock poisoned: {e}")))?;
        if buf.finished {
            break;
        }
    }

    drop(stream);
    Ok(())
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}
