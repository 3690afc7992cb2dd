//! Question speech playback: avatar-vs-fallback dispatch.
//!
//! Each question's audio reference is rendered exactly once. The avatar
//! renderer is preferred because it lip-syncs; when it is not ready yet a
//! cancellable wait window runs, and only if the window elapses first does
//! the local fallback path take over. Once either path has rendered a
//! reference, no automatic re-dispatch happens for that question — only the
//! user's explicit replay can repeat it.

use crate::audio::decode::{decode_to_mono_f32, extension_hint};
use crate::audio::playback::{FallbackPlayer, FallbackSignal};
use crate::audio::resample::to_avatar_pcm;
use crate::avatar::AvatarSink;
use crate::backend::{BackendClient, Question};
use crate::config::PlaybackConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which path is rendering the current question's speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPath {
    Avatar,
    Fallback,
}

/// Signals the coordinator's background tasks report to the session loop.
///
/// Every signal carries the generation it was issued under; the session
/// loop discards signals whose generation has been superseded.
#[derive(Debug, Clone)]
pub enum SpeechSignal {
    /// A playback path began rendering.
    Started { generation: u64, path: PlaybackPath },
    /// The fallback path ran to completion.
    Ended { generation: u64 },
    /// Fetch, decode or render failed. The interview continues on text.
    Failed { generation: u64, message: String },
    /// The readiness wait window elapsed without the avatar coming up.
    WindowElapsed { generation: u64 },
    /// Avatar readiness arrived inside the wait window.
    ReadinessArrived { generation: u64 },
}

struct ActiveDispatch {
    path: PlaybackPath,
    cancel: CancellationToken,
}

/// Decides which playback path renders a question's audio and enforces the
/// fallback timing. All methods are called from the session loop only; the
/// coordinator never mutates state from its background tasks.
pub struct SpeechCoordinator {
    backend: BackendClient,
    avatar: Option<Arc<dyn AvatarSink>>,
    ready: watch::Receiver<bool>,
    fallback: Arc<dyn FallbackPlayer>,
    config: PlaybackConfig,
    signal_tx: mpsc::UnboundedSender<SpeechSignal>,
    /// PlaybackToken: the audio reference last dispatched automatically.
    last_dispatched: Option<String>,
    pending_wait: Option<CancellationToken>,
    active: Option<ActiveDispatch>,
}

impl SpeechCoordinator {
    pub fn new(
        backend: BackendClient,
        fallback: Arc<dyn FallbackPlayer>,
        config: PlaybackConfig,
        signal_tx: mpsc::UnboundedSender<SpeechSignal>,
    ) -> Self {
        // With no avatar attached, readiness never arrives and every
        // question falls back at the window boundary. The sender is dropped
        // on purpose: the receiver keeps reporting `false` and the wait
        // task treats the closed channel as never-ready.
        let (_, never_ready_rx) = watch::channel(false);
        Self {
            backend,
            avatar: None,
            ready: never_ready_rx,
            fallback,
            config,
            signal_tx,
            last_dispatched: None,
            pending_wait: None,
            active: None,
        }
    }

    /// Attach the avatar channel and its readiness signal.
    pub fn with_avatar(
        mut self,
        sink: Arc<dyn AvatarSink>,
        ready: watch::Receiver<bool>,
    ) -> Self {
        self.avatar = Some(sink);
        self.ready = ready;
        self
    }

    pub fn avatar_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Evaluate a freshly installed question.
    ///
    /// Dispatches immediately when the avatar is ready, otherwise starts
    /// the wait-window race. A reference equal to the playback token is
    /// ignored — state updates re-firing must not replay audio.
    pub fn evaluate(&mut self, question: &Question, generation: u64) {
        let Some(url) = question.audio_url.clone() else {
            return;
        };
        if self.last_dispatched.as_deref() == Some(url.as_str()) {
            debug!("audio reference already dispatched, ignoring");
            return;
        }

        // A previous question's wait race is superseded.
        self.cancel_pending_wait();

        if self.avatar.is_some() && self.avatar_ready() {
            self.dispatch_avatar(&url, generation);
            return;
        }

        // Question 1 tolerates a slower cold-start connection.
        let window = if question.primary_number() == 1 {
            Duration::from_millis(self.config.first_question_wait_ms)
        } else {
            Duration::from_millis(self.config.subsequent_wait_ms)
        };

        let cancel = CancellationToken::new();
        self.pending_wait = Some(cancel.clone());
        let mut ready = self.ready.clone();
        let tx = self.signal_tx.clone();
        info!(
            "avatar not ready, racing a {}ms wait window",
            window.as_millis()
        );
        tokio::spawn(async move {
            let wait_ready = async {
                loop {
                    if *ready.borrow_and_update() {
                        break;
                    }
                    if ready.changed().await.is_err() {
                        // No avatar: readiness can never arrive.
                        std::future::pending::<()>().await;
                    }
                }
            };
            tokio::select! {
                () = cancel.cancelled() => {}
                () = wait_ready => {
                    let _ = tx.send(SpeechSignal::ReadinessArrived { generation });
                }
                () = tokio::time::sleep(window) => {
                    let _ = tx.send(SpeechSignal::WindowElapsed { generation });
                }
            }
        });
    }

    /// Readiness arrived inside the window: dispatch to the avatar unless
    /// the reference was already rendered.
    pub fn on_readiness_arrived(&mut self, question: &Question, generation: u64) {
        self.pending_wait = None;
        let Some(url) = question.audio_url.clone() else {
            return;
        };
        if self.last_dispatched.as_deref() == Some(url.as_str()) {
            return;
        }
        self.dispatch_avatar(&url, generation);
    }

    /// The window elapsed first: dispatch the fallback path, terminally for
    /// this question — the avatar is not revisited even if it comes up a
    /// moment later.
    pub fn on_window_elapsed(&mut self, question: &Question, generation: u64) {
        self.pending_wait = None;
        let Some(url) = question.audio_url.clone() else {
            return;
        };
        if self.last_dispatched.as_deref() == Some(url.as_str()) {
            return;
        }
        warn!("avatar not ready within the wait window, using fallback audio");
        self.dispatch_fallback(&url, generation);
    }

    /// Manual replay. Only available when the avatar channel is ready;
    /// deliberately skips the playback-token check because repeating is the
    /// user's explicit request.
    pub fn replay(&mut self, question: &Question, generation: u64) {
        if !self.avatar_ready() {
            return;
        }
        let Some(url) = question.audio_url.clone() else {
            return;
        };
        self.stop_active();
        self.dispatch_avatar(&url, generation);
    }

    /// Stop both channels' output and cancel any pending wait window or
    /// in-flight fetch/decode. The avatar sink is flushed regardless of
    /// which path is currently active.
    pub fn interrupt(&mut self) {
        self.cancel_pending_wait();
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
        self.flush_avatar();
    }

    /// Forget the playback token so the next question's audio (or the same
    /// URL re-fetched after navigation) is eligible for dispatch again.
    pub fn clear_token(&mut self) {
        self.last_dispatched = None;
    }

    fn cancel_pending_wait(&mut self) {
        if let Some(pending) = self.pending_wait.take() {
            pending.cancel();
        }
    }

    fn stop_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            if active.path == PlaybackPath::Avatar {
                self.flush_avatar();
            }
        }
    }

    fn flush_avatar(&self) {
        if let Some(sink) = self.avatar.clone() {
            tokio::spawn(async move {
                if let Err(e) = sink.interrupt().await {
                    warn!("avatar interrupt failed: {e}");
                }
            });
        }
    }

    fn dispatch_avatar(&mut self, url: &str, generation: u64) {
        let Some(sink) = self.avatar.clone() else {
            return;
        };
        self.last_dispatched = Some(url.to_owned());

        let cancel = CancellationToken::new();
        self.active = Some(ActiveDispatch {
            path: PlaybackPath::Avatar,
            cancel: cancel.clone(),
        });

        let backend = self.backend.clone();
        let tx = self.signal_tx.clone();
        let url = url.to_owned();
        info!("dispatching question audio to avatar channel");
        let _ = tx.send(SpeechSignal::Started {
            generation,
            path: PlaybackPath::Avatar,
        });

        tokio::spawn(async move {
            let work = async {
                let bytes = backend.fetch_audio(&url).await?;
                let hint = extension_hint(&url).map(str::to_owned);
                // Decode off the async threads; a cancelled dispatch just
                // drops the result.
                let decoded = tokio::task::spawn_blocking(move || {
                    decode_to_mono_f32(bytes, hint.as_deref())
                })
                .await
                .map_err(|e| crate::error::SessionError::Decode(format!("decode task: {e}")))??;
                let (samples, sample_rate) = decoded;
                let pcm = to_avatar_pcm(&samples, sample_rate);
                sink.send_audio(pcm).await
            };

            tokio::select! {
                () = cancel.cancelled() => {}
                result = work => {
                    if let Err(e) = result {
                        let _ = tx.send(SpeechSignal::Failed {
                            generation,
                            message: e.to_string(),
                        });
                    }
                }
            }
        });
    }

    fn dispatch_fallback(&mut self, url: &str, generation: u64) {
        self.last_dispatched = Some(url.to_owned());

        let cancel = CancellationToken::new();
        self.active = Some(ActiveDispatch {
            path: PlaybackPath::Fallback,
            cancel: cancel.clone(),
        });

        let backend = self.backend.clone();
        let player = Arc::clone(&self.fallback);
        let tx = self.signal_tx.clone();
        let url = url.to_owned();

        tokio::spawn(async move {
            let bytes = tokio::select! {
                () = cancel.cancelled() => return,
                fetched = backend.fetch_audio(&url) => match fetched {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(SpeechSignal::Failed {
                            generation,
                            message: e.to_string(),
                        });
                        return;
                    }
                },
            };

            // The player reports its own lifecycle; forward it tagged with
            // our generation.
            let (fb_tx, mut fb_rx) = mpsc::unbounded_channel::<FallbackSignal>();
            player.play(
                bytes,
                extension_hint(&url).map(str::to_owned),
                fb_tx,
                cancel.clone(),
            );

            while let Some(signal) = fb_rx.recv().await {
                let mapped = match signal {
                    FallbackSignal::Started => SpeechSignal::Started {
                        generation,
                        path: PlaybackPath::Fallback,
                    },
                    FallbackSignal::Ended => SpeechSignal::Ended { generation },
                    FallbackSignal::Error(message) => SpeechSignal::Failed {
                        generation,
                        message,
                    },
                };
                let done = !matches!(mapped, SpeechSignal::Started { .. });
                let _ = tx.send(mapped);
                if done {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::BackendConfig;
    use std::sync::Mutex;

    struct NullPlayer {
        plays: Mutex<u32>,
    }

    impl FallbackPlayer for NullPlayer {
        fn play(
            &self,
            _audio: Vec<u8>,
            _extension_hint: Option<String>,
            signals: mpsc::UnboundedSender<FallbackSignal>,
            _cancel: CancellationToken,
        ) {
            *self.plays.lock().unwrap() += 1;
            let _ = signals.send(FallbackSignal::Started);
            let _ = signals.send(FallbackSignal::Ended);
        }
    }

    fn coordinator() -> (SpeechCoordinator, mpsc::UnboundedReceiver<SpeechSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = BackendClient::new(&BackendConfig::default());
        let coordinator = SpeechCoordinator::new(
            backend,
            Arc::new(NullPlayer {
                plays: Mutex::new(0),
            }),
            PlaybackConfig {
                first_question_wait_ms: 50,
                subsequent_wait_ms: 20,
            },
            tx,
        );
        (coordinator, rx)
    }

    fn question(number: &str, audio: Option<&str>) -> Question {
        serde_json::from_value(serde_json::json!({
            "id": format!("q{number}"),
            "displayNumber": number,
            "questionText": "text",
            "audioUrl": audio,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn question_without_audio_dispatches_nothing() {
        let (mut c, mut rx) = coordinator();
        c.evaluate(&question("1", None), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn same_reference_is_never_dispatched_twice() {
        let (mut c, mut rx) = coordinator();
        let q = question("2", Some("/a.mp3"));

        c.evaluate(&q, 0);
        // The wait window elapses: exactly one WindowElapsed fires.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let signal = rx.recv().await.unwrap();
        assert!(matches!(signal, SpeechSignal::WindowElapsed { generation: 0 }));

        // Simulate the session loop completing the fallback dispatch, then
        // re-evaluating the same question state.
        c.on_window_elapsed(&q, 0);
        c.evaluate(&q, 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        // No second window race started for the same reference.
        let mut extra_windows = 0;
        while let Ok(signal) = rx.try_recv() {
            if matches!(signal, SpeechSignal::WindowElapsed { .. }) {
                extra_windows += 1;
            }
        }
        assert_eq!(extra_windows, 0);
    }

    #[tokio::test]
    async fn readiness_inside_window_beats_the_fallback() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = BackendClient::new(&BackendConfig::default());
        let (ready_tx, ready_rx) = watch::channel(false);

        struct NoSink;
        #[async_trait::async_trait]
        impl AvatarSink for NoSink {
            async fn send_audio(&self, _pcm: Vec<u8>) -> crate::error::Result<()> {
                Ok(())
            }
            async fn interrupt(&self) -> crate::error::Result<()> {
                Ok(())
            }
        }

        let mut c = SpeechCoordinator::new(
            backend,
            Arc::new(NullPlayer {
                plays: Mutex::new(0),
            }),
            PlaybackConfig {
                first_question_wait_ms: 200,
                subsequent_wait_ms: 200,
            },
            tx,
        )
        .with_avatar(Arc::new(NoSink), ready_rx);

        c.evaluate(&question("1", Some("/a.mp3")), 0);
        // Readiness arrives 2 units into a 12-unit window.
        tokio::time::sleep(Duration::from_millis(30)).await;
        ready_tx.send(true).unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            signal,
            SpeechSignal::ReadinessArrived { generation: 0 }
        ));

        // The window must not also elapse.
        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(signal) = rx.try_recv() {
            assert!(
                !matches!(signal, SpeechSignal::WindowElapsed { .. }),
                "fallback window fired despite early readiness"
            );
        }
    }

    #[tokio::test]
    async fn interrupt_cancels_a_pending_window() {
        let (mut c, mut rx) = coordinator();
        c.evaluate(&question("2", Some("/a.mp3")), 0);
        c.interrupt();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err(), "cancelled window still fired");
    }

    #[tokio::test]
    async fn replay_requires_avatar_readiness() {
        let (mut c, mut rx) = coordinator();
        // No avatar attached: replay is a no-op.
        c.replay(&question("1", Some("/a.mp3")), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }
}
