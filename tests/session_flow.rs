//! End-to-end session controller scenarios.
//!
//! These drive the full controller loop against a mock backend, a fake
//! avatar sink and a fake fallback player, with synthetic capture chunks
//! standing in for the microphone.

use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use viva::audio::AudioChunk;
use viva::audio::capture::CaptureHandle;
use viva::audio::playback::{FallbackPlayer, FallbackSignal};
use viva::avatar::{AvatarEvent, AvatarSink};
use viva::backend::BackendClient;
use viva::config::{BackendConfig, SessionConfig};
use viva::recording::RecordingState;
use viva::session::{SessionController, SessionEvent, SessionHandle};
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

// -- Fakes --

#[derive(Default)]
struct FakeSink {
    sent: Mutex<Vec<Vec<u8>>>,
    interrupts: AtomicU32,
}

#[async_trait::async_trait]
impl AvatarSink for FakeSink {
    async fn send_audio(&self, pcm: Vec<u8>) -> viva::Result<()> {
        self.sent.lock().unwrap().push(pcm);
        Ok(())
    }

    async fn interrupt(&self) -> viva::Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeFallback {
    plays: AtomicU32,
}

impl FallbackPlayer for FakeFallback {
    fn play(
        &self,
        _audio: Vec<u8>,
        _extension_hint: Option<String>,
        signals: mpsc::UnboundedSender<FallbackSignal>,
        _cancel: CancellationToken,
    ) {
        self.plays.fetch_add(1, Ordering::SeqCst);
        let _ = signals.send(FallbackSignal::Started);
        let _ = signals.send(FallbackSignal::Ended);
    }
}

// -- Harness --

struct TestSession {
    handle: SessionHandle,
    events: broadcast::Receiver<SessionEvent>,
    chunk_tx: broadcast::Sender<AudioChunk>,
    _amplitude_tx: watch::Sender<f32>,
    cancel: CancellationToken,
}

fn test_config(server: &MockServer) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.backend = BackendConfig {
        base_url: server.uri(),
        auth_token: None,
    };
    config.playback.first_question_wait_ms = 300;
    config.playback.subsequent_wait_ms = 150;
    config
}

fn spawn_session(
    config: SessionConfig,
    fallback: Arc<FakeFallback>,
    avatar: Option<(
        Arc<FakeSink>,
        watch::Receiver<bool>,
        mpsc::UnboundedReceiver<AvatarEvent>,
    )>,
) -> TestSession {
    let backend = BackendClient::new(&config.backend);
    let (chunk_tx, _) = broadcast::channel(64);
    let (amplitude_tx, amplitude_rx) = watch::channel(0.0f32);
    let capture = CaptureHandle::new(chunk_tx.clone(), amplitude_rx, None);

    let mut controller =
        SessionController::new(config, "sess-1", backend, capture, fallback);
    if let Some((sink, ready, events)) = avatar {
        controller = controller.with_avatar(sink, ready, events);
    }

    let handle = controller.handle();
    let events = handle.subscribe();
    let cancel = controller.cancel_token();
    tokio::spawn(controller.run());

    TestSession {
        handle,
        events,
        chunk_tx,
        _amplitude_tx: amplitude_tx,
        cancel,
    }
}

/// Continuously feed capture chunks so a recorder tap always has audio.
fn feed_chunks(session: &TestSession) -> tokio::task::JoinHandle<()> {
    let tx = session.chunk_tx.clone();
    let cancel = session.cancel.clone();
    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let _ = tx.send(AudioChunk {
                samples: vec![0.2; 160],
                sample_rate: 16_000,
                captured_at: Instant::now(),
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
}

async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    what: &str,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if pred(&event) {
                        return event;
                    }
                }
                Err(e) => panic!("event stream ended waiting for {what}: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn question_body(id: &str, number: &str, audio: Option<&str>) -> serde_json::Value {
    json!({
        "id": id,
        "displayNumber": number,
        "questionText": format!("Question {number}"),
        "audioUrl": audio,
        "totalQuestions": 8
    })
}

async fn mount_current_question(server: &MockServer, body: serde_json::Value) {
    // Jump navigation carries a `target` query; keep this mock off it so a
    // target-specific mock can coexist.
    Mock::given(method("GET"))
        .and(path("/api/interview/sess-1/current-question"))
        .and(query_param_is_missing("target"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_upload(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/interview/upload-audio"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"path": "uploads/a.wav"})))
        .mount(server)
        .await;
}

async fn mount_submit_next(server: &MockServer, next: serde_json::Value) {
    // The submit response nests the next question with a `text` field.
    let mut next = next;
    if let Some(obj) = next.as_object_mut() {
        if let Some(text) = obj.remove("questionText") {
            obj.insert("text".into(), text);
        }
    }
    Mock::given(method("POST"))
        .and(path("/api/interview/submit-answer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "isCompleted": false,
            "nextQuestion": next
        })))
        .mount(server)
        .await;
}

fn wav_fixture(num_samples: usize) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec).unwrap();
        for i in 0..num_samples {
            writer
                .write_sample(((i as f32 * 0.05).sin() * 8_000.0) as i16)
                .unwrap();
        }
        writer.finalize().unwrap();
    }
    bytes
}

// -- Scenarios --

#[tokio::test]
async fn uploaded_file_submit_advances_exactly_one_question() {
    let server = MockServer::start().await;
    mount_current_question(&server, question_body("q1", "1", None)).await;
    mount_upload(&server).await;
    mount_submit_next(&server, question_body("q2", "2", None)).await;

    let mut s = spawn_session(test_config(&server), Arc::new(FakeFallback::default()), None);

    wait_for(&mut s.events, "question 1", |e| {
        matches!(e, SessionEvent::QuestionChanged { question } if question.id == "q1")
    })
    .await;
    // No audio reference: the question is immediately ready for input.
    wait_for(&mut s.events, "question started", |e| {
        matches!(e, SessionEvent::QuestionStarted)
    })
    .await;

    s.handle.upload_file(vec![9u8; 256], "answer.mp3");
    s.handle.send_answer();

    wait_for(&mut s.events, "sending state", |e| {
        matches!(e, SessionEvent::Recording { state: RecordingState::Sending, .. })
    })
    .await;
    wait_for(&mut s.events, "question 2", |e| {
        matches!(e, SessionEvent::QuestionChanged { question } if question.id == "q2")
    })
    .await;

    // Exactly one advance: no further question change, no completion.
    tokio::time::sleep(Duration::from_millis(300)).await;
    for event in drain(&mut s.events) {
        assert!(
            !matches!(
                event,
                SessionEvent::QuestionChanged { .. } | SessionEvent::Completed
            ),
            "unexpected extra advance: {event:?}"
        );
    }
    s.cancel.cancel();
}

#[tokio::test]
async fn completed_interview_emits_completed_not_a_question() {
    let server = MockServer::start().await;
    mount_current_question(&server, question_body("q8", "8", None)).await;
    mount_upload(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/interview/submit-answer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"isCompleted": true})))
        .mount(&server)
        .await;

    let mut s = spawn_session(test_config(&server), Arc::new(FakeFallback::default()), None);
    wait_for(&mut s.events, "question 8", |e| {
        matches!(e, SessionEvent::QuestionChanged { .. })
    })
    .await;

    s.handle.upload_file(vec![1u8; 64], "answer.wav");
    s.handle.send_answer();

    wait_for(&mut s.events, "sending state", |e| {
        matches!(e, SessionEvent::Recording { state: RecordingState::Sending, .. })
    })
    .await;
    // Controls re-enable (Idle) before the completion signal hands off.
    wait_for(&mut s.events, "idle after completion", |e| {
        matches!(e, SessionEvent::Recording { state: RecordingState::Idle, .. })
    })
    .await;
    wait_for(&mut s.events, "completion", |e| {
        matches!(e, SessionEvent::Completed)
    })
    .await;
    s.cancel.cancel();
}

#[tokio::test]
async fn send_while_recording_stops_and_submits_a_nonempty_buffer() {
    let server = MockServer::start().await;
    mount_current_question(&server, question_body("q1", "1", None)).await;
    mount_upload(&server).await;
    mount_submit_next(&server, question_body("q2", "2", None)).await;

    let mut s = spawn_session(test_config(&server), Arc::new(FakeFallback::default()), None);
    let feeder = feed_chunks(&s);

    wait_for(&mut s.events, "question 1", |e| {
        matches!(e, SessionEvent::QuestionChanged { .. })
    })
    .await;

    s.handle.start_recording();
    wait_for(&mut s.events, "recording state", |e| {
        matches!(e, SessionEvent::Recording { state: RecordingState::Recording, .. })
    })
    .await;

    // Let some audio accumulate, then send mid-recording.
    tokio::time::sleep(Duration::from_millis(150)).await;
    s.handle.send_answer();

    // The recorder stops, the buffer finalizes, and submission follows
    // from the single finalize event.
    wait_for(&mut s.events, "sending state", |e| {
        matches!(e, SessionEvent::Recording { state: RecordingState::Sending, .. })
    })
    .await;
    wait_for(&mut s.events, "question 2", |e| {
        matches!(e, SessionEvent::QuestionChanged { question } if question.id == "q2")
    })
    .await;

    // The uploaded WAV was non-empty (more than a bare 44-byte header).
    let requests = server.received_requests().await.unwrap();
    let upload = requests
        .iter()
        .find(|r| r.url.path().ends_with("/upload-audio"))
        .expect("upload request");
    assert!(
        upload.body.len() > 500,
        "uploaded buffer suspiciously small: {} bytes",
        upload.body.len()
    );

    feeder.abort();
    s.cancel.cancel();
}

#[tokio::test]
async fn submit_failure_returns_to_recorded_and_retry_reuses_the_buffer() {
    let server = MockServer::start().await;
    mount_current_question(&server, question_body("q1", "1", None)).await;
    // First upload attempt fails, the retry succeeds.
    Mock::given(method("POST"))
        .and(path("/api/interview/upload-audio"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_upload(&server).await;
    mount_submit_next(&server, question_body("q2", "2", None)).await;

    let mut s = spawn_session(test_config(&server), Arc::new(FakeFallback::default()), None);
    let feeder = feed_chunks(&s);

    wait_for(&mut s.events, "question 1", |e| {
        matches!(e, SessionEvent::QuestionChanged { .. })
    })
    .await;

    s.handle.start_recording();
    tokio::time::sleep(Duration::from_millis(120)).await;
    s.handle.send_answer();

    wait_for(&mut s.events, "submission failure", |e| {
        matches!(e, SessionEvent::SubmissionFailed { .. })
    })
    .await;
    // Never silently back to Idle: the buffer is preserved for retry.
    wait_for(&mut s.events, "recorded after failure", |e| {
        matches!(e, SessionEvent::Recording { state: RecordingState::Recorded, .. })
    })
    .await;

    s.handle.send_answer();
    wait_for(&mut s.events, "question 2 after retry", |e| {
        matches!(e, SessionEvent::QuestionChanged { question } if question.id == "q2")
    })
    .await;

    // Both attempts uploaded the same finalized buffer.
    let requests = server.received_requests().await.unwrap();
    let uploads: Vec<_> = requests
        .iter()
        .filter(|r| r.url.path().ends_with("/upload-audio"))
        .collect();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].body, uploads[1].body);

    feeder.abort();
    s.cancel.cancel();
}

#[tokio::test]
async fn countdown_ceiling_forces_an_automatic_stop() {
    let server = MockServer::start().await;
    mount_current_question(&server, question_body("q1", "1", None)).await;

    let mut config = test_config(&server);
    config.recording.answer_time_limit_secs = 2;
    config.recording.countdown_tick_ms = 40;

    let mut s = spawn_session(config, Arc::new(FakeFallback::default()), None);
    let feeder = feed_chunks(&s);

    wait_for(&mut s.events, "question 1", |e| {
        matches!(e, SessionEvent::QuestionChanged { .. })
    })
    .await;

    s.handle.start_recording();
    wait_for(&mut s.events, "time reaches zero", |e| {
        matches!(e, SessionEvent::TimeRemaining(0))
    })
    .await;
    // The forced stop finalizes into Recorded, exactly like a user stop.
    let event = wait_for(&mut s.events, "recorded after ceiling", |e| {
        matches!(e, SessionEvent::Recording { state: RecordingState::Recorded, .. })
    })
    .await;
    if let SessionEvent::Recording { time_left, .. } = event {
        assert_eq!(time_left, 0, "countdown must never go negative");
    }

    feeder.abort();
    s.cancel.cancel();
}

#[tokio::test]
async fn jump_resets_state_and_reissues_the_playback_token() {
    let server = MockServer::start().await;
    // Question 1 and question 3 share the same audio reference; after a
    // jump the token must be fresh enough to dispatch it again.
    mount_current_question(&server, question_body("q1", "1", Some("/media/shared.bin"))).await;
    Mock::given(method("GET"))
        .and(path("/api/interview/sess-1/current-question"))
        .and(query_param("target", "3"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(question_body("q3", "3", Some("/media/shared.bin"))),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/shared.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 64]))
        .mount(&server)
        .await;

    let fallback = Arc::new(FakeFallback::default());
    let mut s = spawn_session(test_config(&server), Arc::clone(&fallback), None);
    let feeder = feed_chunks(&s);

    wait_for(&mut s.events, "question 1", |e| {
        matches!(e, SessionEvent::QuestionChanged { question } if question.id == "q1")
    })
    .await;
    // No avatar: the first-question window (300ms) elapses, fallback plays.
    wait_for(&mut s.events, "fallback speech", |e| {
        matches!(e, SessionEvent::Speaking(true))
    })
    .await;
    assert_eq!(fallback.plays.load(Ordering::SeqCst), 1);

    // Record a little, then jump mid-everything.
    s.handle.start_recording();
    tokio::time::sleep(Duration::from_millis(80)).await;
    s.handle.jump_to_question(3);

    wait_for(&mut s.events, "idle after jump", |e| {
        matches!(
            e,
            SessionEvent::Recording {
                state: RecordingState::Idle,
                time_left: 120
            }
        )
    })
    .await;
    wait_for(&mut s.events, "question 3", |e| {
        matches!(e, SessionEvent::QuestionChanged { question } if question.id == "q3")
    })
    .await;

    // Same URL, fresh token: the subsequent window (150ms) elapses and the
    // fallback renders it again.
    wait_for(&mut s.events, "question 3 speech", |e| {
        matches!(e, SessionEvent::Speaking(true))
    })
    .await;
    assert_eq!(fallback.plays.load(Ordering::SeqCst), 2);

    feeder.abort();
    s.cancel.cancel();
}

#[tokio::test]
async fn early_avatar_readiness_beats_the_fallback_window() {
    let server = MockServer::start().await;
    mount_current_question(&server, question_body("q1", "1", Some("/media/q1.wav"))).await;
    Mock::given(method("GET"))
        .and(path("/media/q1.wav"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(wav_fixture(1_600)))
        .mount(&server)
        .await;

    let sink = Arc::new(FakeSink::default());
    let (ready_tx, ready_rx) = watch::channel(false);
    let (avatar_tx, avatar_rx) = mpsc::unbounded_channel();
    let fallback = Arc::new(FakeFallback::default());

    let mut s = spawn_session(
        test_config(&server),
        Arc::clone(&fallback),
        Some((Arc::clone(&sink), ready_rx, avatar_rx)),
    );

    wait_for(&mut s.events, "question 1", |e| {
        matches!(e, SessionEvent::QuestionChanged { .. })
    })
    .await;

    // Readiness arrives 2 units into the 12-unit window (50ms into 300ms).
    tokio::time::sleep(Duration::from_millis(50)).await;
    ready_tx.send(true).unwrap();

    // The ready flag and the speech start race through separate channels;
    // wait for both in whatever order they land.
    let mut saw_ready = false;
    let mut saw_speaking = false;
    tokio::time::timeout(Duration::from_secs(3), async {
        while !(saw_ready && saw_speaking) {
            match s.events.recv().await.expect("event stream ended") {
                SessionEvent::AvatarReady(true) => saw_ready = true,
                SessionEvent::Speaking(true) => saw_speaking = true,
                _ => {}
            }
        }
    })
    .await
    .expect("timed out waiting for avatar readiness and speech");

    // Give the fallback window time to (wrongly) fire, then check it never
    // did and the sink received the exact avatar format.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(fallback.plays.load(Ordering::SeqCst), 0, "fallback must not fire");
    let sent = sink.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1, "exactly one automatic dispatch");
    // 1600 samples at 16kHz stay 1600 samples -> 3200 bytes of PCM16.
    assert_eq!(sent[0].len(), 3_200);

    // The renderer reports the end of playback; the indicator clears.
    avatar_tx.send(AvatarEvent::PlaybackFinished).unwrap();
    wait_for(&mut s.events, "speech ended", |e| {
        matches!(e, SessionEvent::Speaking(false))
    })
    .await;

    // Send always interrupts the avatar channel, even when there is
    // nothing to submit (which is rejected before any network call).
    s.handle.send_answer();
    wait_for(&mut s.events, "validation rejection", |e| {
        matches!(e, SessionEvent::SubmissionFailed { .. })
    })
    .await;
    assert!(sink.interrupts.load(Ordering::SeqCst) >= 1);
    s.cancel.cancel();
}

#[tokio::test]
async fn fallback_fires_exactly_once_when_avatar_never_readies() {
    let server = MockServer::start().await;
    mount_current_question(&server, question_body("q2", "2", Some("/media/q2.bin"))).await;
    Mock::given(method("GET"))
        .and(path("/media/q2.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![3u8; 48]))
        .mount(&server)
        .await;

    let sink = Arc::new(FakeSink::default());
    let (_ready_tx, ready_rx) = watch::channel(false);
    let (_avatar_tx, avatar_rx) = mpsc::unbounded_channel();
    let fallback = Arc::new(FakeFallback::default());

    let mut s = spawn_session(
        test_config(&server),
        Arc::clone(&fallback),
        Some((Arc::clone(&sink), ready_rx, avatar_rx)),
    );

    wait_for(&mut s.events, "question 2", |e| {
        matches!(e, SessionEvent::QuestionChanged { .. })
    })
    .await;
    wait_for(&mut s.events, "fallback speech", |e| {
        matches!(e, SessionEvent::Speaking(true))
    })
    .await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fallback.plays.load(Ordering::SeqCst), 1, "exactly one fallback");
    assert!(sink.sent.lock().unwrap().is_empty(), "avatar got nothing");
    s.cancel.cancel();
}

#[tokio::test]
async fn jump_during_submission_discards_the_stale_result() {
    let server = MockServer::start().await;
    mount_current_question(&server, question_body("q1", "1", None)).await;
    Mock::given(method("GET"))
        .and(path("/api/interview/sess-1/current-question"))
        .and(query_param("target", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(question_body("q3", "3", None)))
        .mount(&server)
        .await;
    // A slow upload keeps the submission in flight across the jump.
    Mock::given(method("POST"))
        .and(path("/api/interview/upload-audio"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"path": "uploads/a.wav"}))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;
    mount_submit_next(&server, question_body("q2", "2", None)).await;

    let mut s = spawn_session(test_config(&server), Arc::new(FakeFallback::default()), None);

    wait_for(&mut s.events, "question 1", |e| {
        matches!(e, SessionEvent::QuestionChanged { question } if question.id == "q1")
    })
    .await;

    s.handle.upload_file(vec![7u8; 128], "answer.wav");
    s.handle.send_answer();
    wait_for(&mut s.events, "sending state", |e| {
        matches!(e, SessionEvent::Recording { state: RecordingState::Sending, .. })
    })
    .await;

    // Navigate away while the upload is still in flight.
    s.handle.jump_to_question(3);
    wait_for(&mut s.events, "question 3", |e| {
        matches!(e, SessionEvent::QuestionChanged { question } if question.id == "q3")
    })
    .await;

    // The stale submit completion must neither advance to q2 nor disturb
    // the freshly reset state.
    tokio::time::sleep(Duration::from_millis(700)).await;
    for event in drain(&mut s.events) {
        match event {
            SessionEvent::QuestionChanged { question } => {
                assert_ne!(question.id, "q2", "stale submission advanced the question");
            }
            SessionEvent::Recording { state, .. } => {
                assert_eq!(state, RecordingState::Idle);
            }
            _ => {}
        }
    }
    s.cancel.cancel();
}
