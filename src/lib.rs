//! Viva: session media controller for simulated spoken interviews.
//!
//! A remote avatar speaks generated questions, the candidate records a
//! spoken answer, and the answer is uploaded for scoring. This crate owns
//! the client-side orchestration in between:
//!
//! - **Capture**: the live microphone stream and amplitude signal (`cpal`)
//! - **Recording**: a strict lifecycle with a hard answer-time ceiling
//! - **Playback**: at-most-once question speech, avatar-first with a timed
//!   local fallback (`symphonia` decode, 16kHz PCM16 resampling)
//! - **Submission**: answer upload, snapshot capture, question progression
//!
//! # Architecture
//!
//! Everything session-scoped funnels through [`SessionController`]'s single
//! event loop. Timers, device callbacks and network completions arrive as
//! messages tagged with a question generation counter; stale completions
//! are discarded rather than applied, which is what keeps mid-playback and
//! mid-recording interactions race-free.

pub mod audio;
pub mod avatar;
pub mod backend;
pub mod config;
pub mod error;
pub mod recording;
pub mod session;
pub mod snapshot;
pub mod speech;
pub mod submission;

pub use audio::capture::{CaptureHandle, MicCapture};
pub use avatar::{AvatarClient, AvatarEvent, AvatarSink};
pub use backend::{BackendClient, InterviewSetup, Question, SubmitOutcome};
pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use recording::{RecordingBuffer, RecordingState};
pub use session::{SessionCommand, SessionController, SessionEvent, SessionHandle};
pub use snapshot::{FrameSource, PreviewFrame};
