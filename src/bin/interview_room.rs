//! Headless interview room driver.
//!
//! Usage: `cargo run --bin viva-room -- [profession] [role]`
//!
//! Starts an interview against the configured backend, acquires the
//! microphone, brings the avatar renderer up (best effort), and drives the
//! session from stdin:
//!
//! ```text
//! r  start recording      p  pause        c  resume
//! x  stop                 s  send answer  a  replay question
//! j <n>  jump to question n (developer mode)
//! q  quit
//! ```

use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use viva::audio::playback::CpalFallback;
use viva::avatar::AvatarClient;
use viva::backend::InterviewSetup;
use viva::{BackendClient, MicCapture, SessionConfig, SessionController, SessionEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = SessionConfig::default_path();
    let config = if config_path.exists() {
        SessionConfig::from_file(&config_path).context("loading config")?
    } else {
        info!("no config at {}, using defaults", config_path.display());
        SessionConfig::default()
    };

    let mut args = std::env::args().skip(1);
    let profession = args.next().unwrap_or_else(|| "software".to_owned());
    let role = args.next().unwrap_or_else(|| "backend developer".to_owned());

    let backend = BackendClient::new(&config.backend);
    let session_id = backend
        .start_interview(&InterviewSetup {
            profession,
            role,
            level: "mid".to_owned(),
            difficulty: "normal".to_owned(),
            language: "en".to_owned(),
        })
        .await
        .context("starting interview")?;
    info!("interview session: {session_id}");

    // Device acquisition failure is terminal: no recording controls without
    // a microphone.
    let capture = MicCapture::acquire(&config.audio).context("acquiring microphone")?;
    let capture_handle = capture.handle();

    let fallback = Arc::new(CpalFallback::new(config.audio.clone()));
    let mut controller = SessionController::new(
        config.clone(),
        session_id,
        backend,
        capture_handle,
        fallback,
    );

    // Avatar bring-up is best effort; without it every question simply
    // falls back to local playback at the window boundary.
    match AvatarClient::connect(&config.avatar).await {
        Ok((client, events)) => {
            let ready = client.ready();
            controller = controller.with_avatar(Arc::new(client), ready, events);
        }
        Err(e) => warn!("avatar unavailable, using fallback audio only: {e}"),
    }

    let handle = controller.handle();
    let mut events = handle.subscribe();
    let cancel = controller.cancel_token();

    let capture_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = capture.run(capture_cancel).await {
            warn!("capture stopped: {e}");
        }
    });

    let session_task = tokio::spawn(controller.run());

    // Event printer.
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::QuestionChanged { question }) => {
                    println!(
                        "\n== Question {} ==\n{}",
                        question.display_number, question.text
                    );
                    if let Some(code) = &question.code_snippet {
                        println!("--- reference code ---\n{code}");
                    }
                }
                Ok(SessionEvent::QuestionStarted) => println!("(question ready)"),
                Ok(SessionEvent::Recording { state, time_left }) => {
                    println!("[recording: {state:?}, {time_left}s left]");
                }
                Ok(SessionEvent::TimeRemaining(left)) => {
                    if left % 15 == 0 || left <= 10 {
                        println!("[{left}s left]");
                    }
                }
                Ok(SessionEvent::Speaking(speaking)) => {
                    println!("[interviewer {}]", if speaking { "speaking" } else { "quiet" });
                }
                Ok(SessionEvent::AvatarReady(ready)) => println!("[avatar ready: {ready}]"),
                Ok(SessionEvent::SubmissionFailed { message }) => {
                    println!("[send failed, press 's' to retry: {message}]");
                }
                Ok(SessionEvent::Completed) => {
                    println!("\nInterview complete. See the report view for feedback.");
                }
                Ok(SessionEvent::Error { message }) => println!("[error: {message}]"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Stdin command loop.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let mut parts = line.trim().split_whitespace();
                match parts.next() {
                    Some("r") => handle.start_recording(),
                    Some("p") => handle.pause_recording(),
                    Some("c") => handle.resume_recording(),
                    Some("x") => handle.stop_recording(),
                    Some("s") => handle.send_answer(),
                    Some("a") => handle.replay_question(),
                    Some("j") => match parts.next().and_then(|n| n.parse().ok()) {
                        Some(n) => handle.jump_to_question(n),
                        None => println!("usage: j <question number>"),
                    },
                    Some("q") => {
                        handle.shutdown();
                        break;
                    }
                    Some(other) => println!("unknown command: {other}"),
                    None => {}
                }
            }
        }
    }

    let _ = session_task.await;
    Ok(())
}
