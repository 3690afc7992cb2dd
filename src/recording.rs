//! Recording lifecycle: state machine, countdown bookkeeping and the
//! recorder task that buffers the candidate's answer.
//!
//! The machine validates every transition; the async recorder task only
//! ever buffers and finalizes. Stop and send are deliberately funnelled
//! through one finalize path so that a user send, the countdown ceiling and
//! a plain stop can never race each other into submitting a partial buffer.

use crate::audio::AudioChunk;
use crate::error::{Result, SessionError};
use std::io::Cursor;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Recording lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
    Recorded,
    /// Submission in flight. The only state in which controls are disabled.
    Sending,
}

/// Format tag for an answer buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferFormat {
    /// WAV container produced by the recorder (16-bit mono PCM).
    Wav,
    /// A pre-recorded file supplied by the user, passed through as-is.
    External { file_name: String },
}

/// Raw answer bytes plus their format tag.
#[derive(Debug, Clone)]
pub struct RecordingBuffer {
    pub bytes: Vec<u8>,
    pub format: BufferFormat,
}

impl RecordingBuffer {
    /// File name used when uploading this buffer.
    pub fn file_name(&self) -> &str {
        match &self.format {
            BufferFormat::Wav => "answer.wav",
            BufferFormat::External { file_name } => file_name,
        }
    }
}

/// What a `send` request should do, given the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDisposition {
    /// Still recording: stop first, then submit once the buffer finalizes.
    StopThenSend,
    /// A finalized buffer (recorded or uploaded) can be submitted now.
    SubmitNow,
}

/// Result of one countdown tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Seconds remaining after the tick.
    Continue(u32),
    /// The ceiling was reached; the caller must perform an automatic stop.
    Expired,
}

/// Owns the recording lifecycle and the in-memory answer buffer.
#[derive(Debug)]
pub struct RecordingMachine {
    state: RecordingState,
    buffer: Option<RecordingBuffer>,
    uploaded: Option<RecordingBuffer>,
    /// Intent-to-send flag: a send arrived while recording, submission
    /// starts as soon as the buffer finalizes.
    send_on_finalize: bool,
    /// A stop has been requested and the recorder is finalizing.
    stopping: bool,
    time_left: u32,
    ceiling: u32,
}

impl RecordingMachine {
    pub fn new(ceiling_secs: u32) -> Self {
        Self {
            state: RecordingState::Idle,
            buffer: None,
            uploaded: None,
            send_on_finalize: false,
            stopping: false,
            time_left: ceiling_secs,
            ceiling: ceiling_secs,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// Seconds remaining on the countdown.
    pub fn time_left(&self) -> u32 {
        self.time_left
    }

    /// Whether the UI should accept operations other than none.
    pub fn controls_enabled(&self) -> bool {
        self.state != RecordingState::Sending
    }

    /// Start (or re-start) recording. Discards any previous answer buffer
    /// and resets the countdown to the ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Validation`] unless the machine is `Idle` or
    /// `Recorded`.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            RecordingState::Idle | RecordingState::Recorded => {
                self.buffer = None;
                self.uploaded = None;
                self.send_on_finalize = false;
                self.stopping = false;
                self.time_left = self.ceiling;
                self.state = RecordingState::Recording;
                Ok(())
            }
            other => Err(SessionError::Validation(format!(
                "cannot start recording from {other:?}"
            ))),
        }
    }

    /// # Errors
    ///
    /// Returns [`SessionError::Validation`] unless currently `Recording`.
    pub fn pause(&mut self) -> Result<()> {
        if self.state != RecordingState::Recording {
            return Err(SessionError::Validation(format!(
                "cannot pause from {:?}",
                self.state
            )));
        }
        self.state = RecordingState::Paused;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`SessionError::Validation`] unless currently `Paused`.
    pub fn resume(&mut self) -> Result<()> {
        if self.state != RecordingState::Paused {
            return Err(SessionError::Validation(format!(
                "cannot resume from {:?}",
                self.state
            )));
        }
        self.state = RecordingState::Recording;
        Ok(())
    }

    /// Request that the recorder stop and finalize the buffer.
    ///
    /// The state moves to `Recorded` only when [`Self::finalize`] delivers
    /// the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Validation`] unless `Recording` or `Paused`.
    pub fn request_stop(&mut self) -> Result<()> {
        match self.state {
            RecordingState::Recording | RecordingState::Paused => {
                self.stopping = true;
                Ok(())
            }
            other => Err(SessionError::Validation(format!(
                "cannot stop from {other:?}"
            ))),
        }
    }

    /// Classify a send request.
    ///
    /// While `Recording`/`Paused` this marks the intent-to-send flag and
    /// requests the stop; submission must wait for [`Self::finalize`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Validation`] when there is nothing to send
    /// (no buffer, no uploaded file) or a submission is already in flight.
    pub fn request_send(&mut self) -> Result<SendDisposition> {
        match self.state {
            RecordingState::Recording | RecordingState::Paused => {
                self.send_on_finalize = true;
                self.stopping = true;
                Ok(SendDisposition::StopThenSend)
            }
            RecordingState::Recorded if self.buffer.is_some() => Ok(SendDisposition::SubmitNow),
            RecordingState::Idle if self.uploaded.is_some() => Ok(SendDisposition::SubmitNow),
            RecordingState::Sending => Err(SessionError::Validation(
                "submission already in flight".into(),
            )),
            _ => Err(SessionError::Validation(
                "nothing to send: record an answer or upload a file first".into(),
            )),
        }
    }

    /// Deliver the finalized buffer from the recorder.
    ///
    /// Returns `true` when a send was pending and submission should begin
    /// immediately (the intent flag is consumed).
    pub fn finalize(&mut self, buffer: RecordingBuffer) -> bool {
        if !matches!(
            self.state,
            RecordingState::Recording | RecordingState::Paused
        ) {
            // A stale recorder (superseded by navigation) finalized late.
            debug!("discarding finalized buffer in state {:?}", self.state);
            return false;
        }
        self.buffer = Some(buffer);
        self.stopping = false;
        self.state = RecordingState::Recorded;
        std::mem::take(&mut self.send_on_finalize)
    }

    /// One countdown tick. Only meaningful while `Recording`; never goes
    /// below zero.
    pub fn tick(&mut self) -> TickOutcome {
        if self.state != RecordingState::Recording || self.stopping {
            return TickOutcome::Continue(self.time_left);
        }
        self.time_left = self.time_left.saturating_sub(1);
        if self.time_left == 0 {
            TickOutcome::Expired
        } else {
            TickOutcome::Continue(self.time_left)
        }
    }

    /// Accept a pre-recorded file as the answer, bypassing `Recording`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Validation`] unless the machine is `Idle`.
    pub fn accept_upload(&mut self, bytes: Vec<u8>, file_name: String) -> Result<()> {
        if self.state != RecordingState::Idle {
            return Err(SessionError::Validation(format!(
                "cannot accept a file upload from {:?}",
                self.state
            )));
        }
        if bytes.is_empty() {
            return Err(SessionError::Validation("uploaded file is empty".into()));
        }
        self.uploaded = Some(RecordingBuffer {
            bytes,
            format: BufferFormat::External { file_name },
        });
        Ok(())
    }

    /// Discard a previously uploaded file.
    pub fn clear_upload(&mut self) {
        self.uploaded = None;
    }

    /// Move to `Sending`, returning a copy of the buffer to submit.
    ///
    /// The machine keeps its own copy so a failed submission can retry
    /// without re-recording.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Validation`] when no answer exists.
    pub fn begin_sending(&mut self) -> Result<RecordingBuffer> {
        let buffer = self
            .buffer
            .as_ref()
            .or(self.uploaded.as_ref())
            .cloned()
            .ok_or_else(|| SessionError::Validation("no answer buffer to send".into()))?;
        self.state = RecordingState::Sending;
        Ok(buffer)
    }

    /// Submission failed: back to `Recorded`, buffer preserved for retry.
    pub fn submit_failed(&mut self) {
        if self.state == RecordingState::Sending {
            self.state = RecordingState::Recorded;
            // Promote an uploaded file to the retained buffer so a retry
            // goes through the same Recorded -> send path.
            if self.buffer.is_none() {
                self.buffer = self.uploaded.take();
            }
        }
    }

    /// Submission succeeded: next question loads, machine returns to `Idle`.
    pub fn submit_succeeded(&mut self) {
        self.reset();
    }

    /// Hard reset (navigation, next question): `Idle`, buffers discarded,
    /// countdown back at the ceiling.
    pub fn reset(&mut self) {
        self.state = RecordingState::Idle;
        self.buffer = None;
        self.uploaded = None;
        self.send_on_finalize = false;
        self.stopping = false;
        self.time_left = self.ceiling;
    }
}

/// Control values for a running recorder task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderCommand {
    Run,
    Pause,
    Stop,
}

/// Buffer audio chunks from the capture tap until told to stop, then
/// finalize a WAV answer buffer.
///
/// The recorder never touches the capture stream itself; it only consumes
/// its own broadcast subscription. Dropping the control sender also stops
/// the recorder (navigation teardown).
pub async fn run_recorder(
    mut chunks: broadcast::Receiver<AudioChunk>,
    mut control: watch::Receiver<RecorderCommand>,
    sample_rate: u32,
) -> Result<RecordingBuffer> {
    let mut samples: Vec<f32> = Vec::new();
    let mut paused = false;

    loop {
        tokio::select! {
            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
                match *control.borrow_and_update() {
                    RecorderCommand::Run => paused = false,
                    RecorderCommand::Pause => paused = true,
                    RecorderCommand::Stop => break,
                }
            }
            chunk = chunks.recv() => {
                match chunk {
                    Ok(chunk) => {
                        if !paused {
                            samples.extend_from_slice(&chunk.samples);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("recorder lagged, dropped {skipped} chunks");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    let bytes = encode_wav_pcm16(&samples, sample_rate)?;
    info!(
        "recorder finalized: {:.1}s of audio",
        samples.len() as f32 / sample_rate as f32
    );
    Ok(RecordingBuffer {
        bytes,
        format: BufferFormat::Wav,
    })
}

/// Encode mono f32 samples as an in-memory 16-bit PCM WAV.
fn encode_wav_pcm16(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)
            .map_err(|e| SessionError::Device(format!("WAV writer: {e}")))?;
        for &sample in samples {
            let s = sample.clamp(-1.0, 1.0);
            let v = if s < 0.0 {
                (s * 32_768.0) as i16
            } else {
                (s * 32_767.0) as i16
            };
            writer
                .write_sample(v)
                .map_err(|e| SessionError::Device(format!("WAV write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| SessionError::Device(format!("WAV finalize: {e}")))?;
    }
    Ok(bytes)
}
