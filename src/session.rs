//! Session controller: the composition root of an interview.
//!
//! All session-scoped mutable state (current question, recording state,
//! avatar readiness, playback token, generation counter) lives here and is
//! mutated only by the single event loop in [`SessionController::run`].
//! Device callbacks, timers and network completions are serialized onto
//! that loop as messages; anything that arrives for a superseded question
//! generation is discarded, never applied.

use crate::audio::capture::CaptureHandle;
use crate::audio::playback::FallbackPlayer;
use crate::avatar::{AvatarEvent, AvatarSink};
use crate::backend::{BackendClient, Question, SubmitOutcome};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::recording::{
    RecorderCommand, RecordingBuffer, RecordingMachine, RecordingState, SendDisposition,
    TickOutcome, run_recorder,
};
use crate::speech::{PlaybackPath, SpeechCoordinator, SpeechSignal};
use crate::submission::SubmissionPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the UI event broadcast.
const EVENT_CHANNEL_SIZE: usize = 64;

/// Operations the UI layer may invoke.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    StartRecording,
    PauseRecording,
    ResumeRecording,
    StopRecording,
    SendAnswer,
    /// Replay the current question through the avatar (ready avatar only).
    ReplayQuestion,
    /// Developer-mode navigation to an arbitrary question number.
    JumpToQuestion(u32),
    /// Supply a pre-recorded answer file instead of live capture.
    UploadFile { bytes: Vec<u8>, file_name: String },
    ClearUpload,
    Shutdown,
}

/// State changes broadcast to the UI layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A question was installed (initial load, advance, or jump).
    QuestionChanged { question: Question },
    /// The current question began rendering (or has no audio) and should be
    /// revealed to the candidate.
    QuestionStarted,
    /// Recording lifecycle update.
    Recording {
        state: RecordingState,
        time_left: u32,
    },
    /// Countdown tick while recording.
    TimeRemaining(u32),
    /// Question speech is (not) being rendered on some path.
    Speaking(bool),
    /// Avatar renderer readiness flipped.
    AvatarReady(bool),
    /// Submission failed; the answer is retained and send may be retried.
    SubmissionFailed { message: String },
    /// The interview is complete; a report view takes over from here.
    Completed,
    /// Non-fatal error surfaced for display/diagnostics.
    Error { message: String },
}

/// Internal completions reported by background tasks.
enum Internal {
    Countdown { generation: u64 },
    RecorderDone {
        generation: u64,
        result: Result<RecordingBuffer>,
    },
    Fetched {
        generation: u64,
        result: Result<Question>,
    },
    Submit {
        generation: u64,
        result: Result<SubmitOutcome>,
    },
    AvatarReady(bool),
}

/// Cloneable handle the UI layer drives the session with.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    amplitude: watch::Receiver<f32>,
}

impl SessionHandle {
    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Live microphone amplitude for waveform rendering.
    pub fn amplitude(&self) -> watch::Receiver<f32> {
        self.amplitude.clone()
    }

    /// Send an operation to the session loop.
    pub fn send(&self, command: SessionCommand) {
        let _ = self.cmd_tx.send(command);
    }

    pub fn start_recording(&self) {
        self.send(SessionCommand::StartRecording);
    }

    pub fn pause_recording(&self) {
        self.send(SessionCommand::PauseRecording);
    }

    pub fn resume_recording(&self) {
        self.send(SessionCommand::ResumeRecording);
    }

    pub fn stop_recording(&self) {
        self.send(SessionCommand::StopRecording);
    }

    pub fn send_answer(&self) {
        self.send(SessionCommand::SendAnswer);
    }

    pub fn replay_question(&self) {
        self.send(SessionCommand::ReplayQuestion);
    }

    pub fn jump_to_question(&self, number: u32) {
        self.send(SessionCommand::JumpToQuestion(number));
    }

    pub fn upload_file(&self, bytes: Vec<u8>, file_name: impl Into<String>) {
        self.send(SessionCommand::UploadFile {
            bytes,
            file_name: file_name.into(),
        });
    }

    pub fn shutdown(&self) {
        self.send(SessionCommand::Shutdown);
    }
}

/// Orchestrates one interview session.
pub struct SessionController {
    config: SessionConfig,
    session_id: String,
    backend: BackendClient,
    capture: CaptureHandle,
    pipeline: SubmissionPipeline,
    machine: RecordingMachine,
    speech: SpeechCoordinator,

    question: Option<Question>,
    question_started: bool,
    speaking: bool,
    active_path: Option<PlaybackPath>,

    /// Generation counter: bumped on every question install/jump. Timers
    /// and network completions tagged with an older value are stale.
    generation: u64,
    root_cancel: CancellationToken,
    gen_cancel: CancellationToken,

    recorder_ctl: Option<watch::Sender<RecorderCommand>>,
    countdown_cancel: Option<CancellationToken>,

    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    cmd_rx: Option<mpsc::UnboundedReceiver<SessionCommand>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
    speech_rx: Option<mpsc::UnboundedReceiver<SpeechSignal>>,
    avatar_events: Option<mpsc::UnboundedReceiver<AvatarEvent>>,
    avatar_ready_rx: Option<watch::Receiver<bool>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Build a controller for an already started interview session.
    ///
    /// The capture handle must come from a successfully acquired device;
    /// acquisition failure is terminal and must be surfaced before this
    /// point. Without [`Self::with_avatar`], every question renders through
    /// the fallback path once its wait window elapses.
    pub fn new(
        config: SessionConfig,
        session_id: impl Into<String>,
        backend: BackendClient,
        capture: CaptureHandle,
        fallback: Arc<dyn FallbackPlayer>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (speech_tx, speech_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let pipeline = SubmissionPipeline::new(backend.clone(), capture.frames());
        let machine = RecordingMachine::new(config.recording.answer_time_limit_secs);
        let speech = SpeechCoordinator::new(
            backend.clone(),
            fallback,
            config.playback.clone(),
            speech_tx,
        );

        let root_cancel = CancellationToken::new();
        let gen_cancel = root_cancel.child_token();

        Self {
            config,
            session_id: session_id.into(),
            backend,
            capture,
            pipeline,
            machine,
            speech,
            question: None,
            question_started: false,
            speaking: false,
            active_path: None,
            generation: 0,
            root_cancel,
            gen_cancel,
            recorder_ctl: None,
            countdown_cancel: None,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            internal_tx,
            internal_rx: Some(internal_rx),
            speech_rx: Some(speech_rx),
            avatar_events: None,
            avatar_ready_rx: None,
            events,
        }
    }

    /// Attach a connected avatar renderer.
    pub fn with_avatar(
        mut self,
        sink: Arc<dyn AvatarSink>,
        ready: watch::Receiver<bool>,
        events: mpsc::UnboundedReceiver<AvatarEvent>,
    ) -> Self {
        self.speech = self.speech.with_avatar(sink, ready.clone());
        self.avatar_ready_rx = Some(ready);
        self.avatar_events = Some(events);
        self
    }

    /// Handle for the UI layer. May be cloned freely.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            cmd_tx: self.cmd_tx.clone(),
            events: self.events.clone(),
            amplitude: self.capture.amplitude(),
        }
    }

    /// Cancellation token covering every task the session spawns.
    pub fn cancel_token(&self) -> CancellationToken {
        self.root_cancel.clone()
    }

    /// Run the session loop until shutdown.
    ///
    /// Fetches the current question immediately, then serializes UI
    /// commands, timer fires, playback signals and network completions.
    pub async fn run(mut self) -> Result<()> {
        info!("interview session {} starting", self.session_id);

        let (Some(mut cmd_rx), Some(mut internal_rx), Some(mut speech_rx)) = (
            self.cmd_rx.take(),
            self.internal_rx.take(),
            self.speech_rx.take(),
        ) else {
            return Err(SessionError::Channel(
                "session loop already consumed".into(),
            ));
        };
        let mut avatar_events = self.avatar_events.take();
        let root_cancel = self.root_cancel.clone();

        self.spawn_fetch(None);
        self.spawn_ready_forwarder();

        loop {
            tokio::select! {
                () = root_cancel.cancelled() => break,
                command = cmd_rx.recv() => {
                    let Some(command) = command else { break };
                    if matches!(command, SessionCommand::Shutdown) {
                        self.root_cancel.cancel();
                        break;
                    }
                    self.handle_command(command);
                }
                signal = speech_rx.recv() => {
                    let Some(signal) = signal else { break };
                    self.handle_speech_signal(signal);
                }
                internal = internal_rx.recv() => {
                    let Some(internal) = internal else { break };
                    self.handle_internal(internal);
                }
                event = recv_avatar(&mut avatar_events) => {
                    self.handle_avatar_event(event);
                }
            }
        }

        info!("interview session {} shut down", self.session_id);
        Ok(())
    }

    // -- Command handling --

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::StartRecording => self.start_recording(),
            SessionCommand::PauseRecording => {
                match self.machine.pause() {
                    Ok(()) => {
                        self.send_recorder(RecorderCommand::Pause);
                        // Leaving `Recording` always cancels the countdown.
                        self.cancel_countdown();
                        self.emit_recording();
                    }
                    Err(e) => self.emit_error(e),
                }
            }
            SessionCommand::ResumeRecording => match self.machine.resume() {
                Ok(()) => {
                    self.send_recorder(RecorderCommand::Run);
                    self.spawn_countdown();
                    self.emit_recording();
                }
                Err(e) => self.emit_error(e),
            },
            SessionCommand::StopRecording => match self.machine.request_stop() {
                Ok(()) => {
                    self.send_recorder(RecorderCommand::Stop);
                    self.cancel_countdown();
                }
                Err(e) => self.emit_error(e),
            },
            SessionCommand::SendAnswer => self.send_answer(),
            SessionCommand::ReplayQuestion => {
                if let Some(question) = self.question.clone() {
                    self.speech.replay(&question, self.generation);
                }
            }
            SessionCommand::JumpToQuestion(number) => {
                info!("jumping to question {number}");
                self.navigate(Some(number));
            }
            SessionCommand::UploadFile { bytes, file_name } => {
                match self.machine.accept_upload(bytes, file_name) {
                    Ok(()) => self.emit_recording(),
                    Err(e) => self.emit_error(e),
                }
            }
            SessionCommand::ClearUpload => self.machine.clear_upload(),
            SessionCommand::Shutdown => unreachable!("handled in run()"),
        }
    }

    fn start_recording(&mut self) {
        if let Err(e) = self.machine.start() {
            self.emit_error(e);
            return;
        }

        // Fresh recorder tap against the shared capture stream. The stream
        // itself is never touched.
        let (ctl_tx, ctl_rx) = watch::channel(RecorderCommand::Run);
        self.recorder_ctl = Some(ctl_tx);
        let chunks = self.capture.subscribe();
        let sample_rate = self.config.audio.capture_sample_rate;
        let generation = self.generation;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = run_recorder(chunks, ctl_rx, sample_rate).await;
            let _ = internal.send(Internal::RecorderDone { generation, result });
        });

        self.spawn_countdown();
        self.emit_recording();
    }

    fn send_answer(&mut self) {
        // Sending always interrupts question speech, whichever path is
        // rendering it.
        self.interrupt_playback();

        match self.machine.request_send() {
            Ok(SendDisposition::StopThenSend) => {
                self.send_recorder(RecorderCommand::Stop);
                self.cancel_countdown();
                // Submission starts when the recorder finalizes.
            }
            Ok(SendDisposition::SubmitNow) => self.begin_submission(),
            Err(e) => {
                let _ = self.events.send(SessionEvent::SubmissionFailed {
                    message: e.to_string(),
                });
            }
        }
    }

    fn begin_submission(&mut self) {
        let Some(question) = self.question.as_ref() else {
            let _ = self.events.send(SessionEvent::SubmissionFailed {
                message: "no active question".into(),
            });
            return;
        };
        let question_id = question.id.clone();

        let buffer = match self.machine.begin_sending() {
            Ok(buffer) => buffer,
            Err(e) => {
                let _ = self.events.send(SessionEvent::SubmissionFailed {
                    message: e.to_string(),
                });
                return;
            }
        };
        self.emit_recording();

        let pipeline = self.pipeline.clone();
        let session_id = self.session_id.clone();
        let generation = self.generation;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = pipeline.submit(buffer, &question_id, &session_id).await;
            let _ = internal.send(Internal::Submit { generation, result });
        });
    }

    /// Interruption & navigation: stop both playback channels, clear the
    /// speaking indicator, clear the playback token, reset recording, and
    /// re-fetch the target question as a fresh one.
    fn navigate(&mut self, target: Option<u32>) {
        self.speech.interrupt();
        self.speech.clear_token();
        self.set_speaking(false);
        self.active_path = None;
        self.question_started = false;

        self.send_recorder(RecorderCommand::Stop);
        self.recorder_ctl = None;
        self.cancel_countdown();
        self.machine.reset();
        self.emit_recording();

        self.bump_generation();
        self.spawn_fetch(target);
    }

    // -- Internal completions --

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Countdown { generation } => {
                if generation != self.generation {
                    return;
                }
                match self.machine.tick() {
                    TickOutcome::Continue(left) => {
                        let _ = self.events.send(SessionEvent::TimeRemaining(left));
                    }
                    TickOutcome::Expired => {
                        info!("answer time limit reached, stopping recording");
                        let _ = self.events.send(SessionEvent::TimeRemaining(0));
                        // Hard ceiling: exactly what a user stop would do.
                        if self.machine.request_stop().is_ok() {
                            self.send_recorder(RecorderCommand::Stop);
                        }
                        self.cancel_countdown();
                    }
                }
            }
            Internal::RecorderDone { generation, result } => {
                if generation != self.generation {
                    debug!("discarding recorder result from a superseded question");
                    return;
                }
                match result {
                    Ok(buffer) => {
                        let send_now = self.machine.finalize(buffer);
                        self.emit_recording();
                        if send_now {
                            self.begin_submission();
                        }
                    }
                    Err(e) => {
                        error!("recorder failed: {e}");
                        self.machine.reset();
                        self.emit_recording();
                        self.emit_error(e);
                    }
                }
            }
            Internal::Fetched { generation, result } => {
                if generation != self.generation {
                    debug!("discarding fetched question from a superseded navigation");
                    return;
                }
                match result {
                    Ok(question) => self.install_question(question),
                    Err(e) => {
                        error!("failed to fetch question: {e}");
                        self.emit_error(e);
                    }
                }
            }
            Internal::Submit { generation, result } => {
                if generation != self.generation {
                    debug!("discarding submit result from a superseded question");
                    return;
                }
                self.finish_submission(result);
            }
            Internal::AvatarReady(ready) => {
                let _ = self.events.send(SessionEvent::AvatarReady(ready));
            }
        }
    }

    fn finish_submission(&mut self, result: Result<SubmitOutcome>) {
        match result {
            Ok(outcome) => {
                self.machine.submit_succeeded();
                self.emit_recording();
                if outcome.completed {
                    info!("interview completed");
                    let _ = self.events.send(SessionEvent::Completed);
                } else if let Some(next) = outcome.next_question {
                    self.bump_generation();
                    self.install_question(next);
                } else {
                    // The backend must advance or complete, never neither.
                    warn!("submit response had neither completion nor a next question");
                    self.emit_error(SessionError::Network(
                        "submit response missing next question".into(),
                    ));
                }
            }
            Err(e) => {
                warn!("submission failed: {e}");
                let _ = self.events.send(SessionEvent::SubmissionFailed {
                    message: e.to_string(),
                });
                self.machine.submit_failed();
                self.emit_recording();
            }
        }
    }

    fn install_question(&mut self, question: Question) {
        info!(
            "question {} installed ({})",
            question.display_number, question.id
        );
        self.question_started = false;
        self.question = Some(question.clone());
        let _ = self.events.send(SessionEvent::QuestionChanged {
            question: question.clone(),
        });

        if question.audio_url.is_none() {
            // Nothing to speak: the question is immediately ready for input.
            self.mark_question_started();
        } else {
            self.speech.evaluate(&question, self.generation);
        }
    }

    // -- Playback signals --

    fn handle_speech_signal(&mut self, signal: SpeechSignal) {
        match signal {
            SpeechSignal::Started { generation, path } => {
                if generation != self.generation {
                    return;
                }
                self.active_path = Some(path);
                self.set_speaking(true);
                self.mark_question_started();
            }
            SpeechSignal::Ended { generation } => {
                if generation != self.generation {
                    return;
                }
                self.active_path = None;
                self.set_speaking(false);
            }
            SpeechSignal::Failed {
                generation,
                message,
            } => {
                if generation != self.generation {
                    return;
                }
                error!("question speech failed: {message}");
                self.active_path = None;
                self.set_speaking(false);
                // The interview is not blocked: reveal the text.
                self.mark_question_started();
                let _ = self.events.send(SessionEvent::Error { message });
            }
            SpeechSignal::WindowElapsed { generation } => {
                if generation != self.generation {
                    return;
                }
                if let Some(question) = self.question.clone() {
                    self.speech.on_window_elapsed(&question, generation);
                }
            }
            SpeechSignal::ReadinessArrived { generation } => {
                if generation != self.generation {
                    return;
                }
                if let Some(question) = self.question.clone() {
                    self.speech.on_readiness_arrived(&question, generation);
                }
            }
        }
    }

    fn handle_avatar_event(&mut self, event: AvatarEvent) {
        match event {
            AvatarEvent::Ready => debug!("avatar renderer reported ready"),
            AvatarEvent::PlaybackFinished => {
                if self.active_path == Some(PlaybackPath::Avatar) {
                    self.active_path = None;
                    self.set_speaking(false);
                }
            }
            AvatarEvent::Error(message) => {
                warn!("avatar channel error: {message}");
                if self.active_path == Some(PlaybackPath::Avatar) {
                    self.active_path = None;
                    self.set_speaking(false);
                }
                let _ = self.events.send(SessionEvent::Error { message });
            }
        }
    }

    // -- Task helpers --

    fn spawn_fetch(&mut self, target: Option<u32>) {
        let backend = self.backend.clone();
        let session_id = self.session_id.clone();
        let generation = self.generation;
        let internal = self.internal_tx.clone();
        let cancel = self.gen_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                result = backend.current_question(&session_id, target) => {
                    let _ = internal.send(Internal::Fetched { generation, result });
                }
            }
        });
    }

    fn spawn_countdown(&mut self) {
        self.cancel_countdown();
        let cancel = self.gen_cancel.child_token();
        self.countdown_cancel = Some(cancel.clone());
        let tick = Duration::from_millis(self.config.recording.countdown_tick_ms);
        let generation = self.generation;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(tick) => {
                        if internal.send(Internal::Countdown { generation }).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_ready_forwarder(&mut self) {
        let Some(mut ready) = self.avatar_ready_rx.clone() else {
            return;
        };
        let internal = self.internal_tx.clone();
        let cancel = self.root_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = ready.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let value = *ready.borrow_and_update();
                        if internal.send(Internal::AvatarReady(value)).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn cancel_countdown(&mut self) {
        if let Some(cancel) = self.countdown_cancel.take() {
            cancel.cancel();
        }
    }

    fn send_recorder(&mut self, command: RecorderCommand) {
        if let Some(ctl) = &self.recorder_ctl {
            let _ = ctl.send(command);
        }
    }

    fn interrupt_playback(&mut self) {
        self.speech.interrupt();
        self.active_path = None;
        self.set_speaking(false);
    }

    fn bump_generation(&mut self) {
        self.generation += 1;
        self.gen_cancel.cancel();
        self.gen_cancel = self.root_cancel.child_token();
    }

    fn mark_question_started(&mut self) {
        if !self.question_started {
            self.question_started = true;
            let _ = self.events.send(SessionEvent::QuestionStarted);
        }
    }

    fn set_speaking(&mut self, speaking: bool) {
        if self.speaking != speaking {
            self.speaking = speaking;
            let _ = self.events.send(SessionEvent::Speaking(speaking));
        }
    }

    fn emit_recording(&mut self) {
        let _ = self.events.send(SessionEvent::Recording {
            state: self.machine.state(),
            time_left: self.machine.time_left(),
        });
    }

    fn emit_error(&mut self, error: SessionError) {
        let _ = self.events.send(SessionEvent::Error {
            message: error.to_string(),
        });
    }
}

/// Await the next avatar event, or park forever when no avatar is attached
/// (or its channel closed).
async fn recv_avatar(rx: &mut Option<mpsc::UnboundedReceiver<AvatarEvent>>) -> AvatarEvent {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}
