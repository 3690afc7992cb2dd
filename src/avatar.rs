//! Avatar renderer client: readiness signalling and the raw-PCM audio sink.
//!
//! The renderer is a remote collaborator that lip-syncs supplied audio to a
//! visual avatar. Bring-up is a session-token exchange and an ICE
//! negotiation over HTTP, followed by a WebSocket on which this client
//! pushes 16kHz mono PCM16 frames. Rendering internals are opaque; the only
//! contract here is the wire protocol and the readiness/error events.

use crate::config::AvatarConfig;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

const API_KEY_HEADER: &str = "x-avatar-api-key";

/// Events surfaced by the renderer connection.
#[derive(Debug, Clone)]
pub enum AvatarEvent {
    /// The renderer finished its startup and will lip-sync incoming audio.
    /// Fires once per connection.
    Ready,
    /// The renderer drained its audio buffer for the current utterance.
    PlaybackFinished,
    /// Renderer-side error. Non-fatal for the interview: the fallback
    /// playback path compensates.
    Error(String),
}

/// Write side of the avatar channel.
///
/// Only the playback coordinator holds this; nothing else may feed the
/// renderer.
#[async_trait]
pub trait AvatarSink: Send + Sync {
    /// Queue raw 16kHz mono PCM16 audio for lip-synced rendering.
    async fn send_audio(&self, pcm: Vec<u8>) -> Result<()>;

    /// Stop rendering immediately and flush any buffered audio.
    async fn interrupt(&self) -> Result<()>;
}

// Wire protocol (serde-tagged, mirroring the renderer's message schema).

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Hello { ice_servers: serde_json::Value },
    Interrupt,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Ready,
    PlaybackFinished,
    Error {
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionTokenRequest<'a> {
    face_id: &'a str,
    handle_silence: bool,
    max_session_length: u32,
    max_idle_time: u32,
}

#[derive(Debug, Deserialize)]
struct SessionTokenResponse {
    session_token: String,
}

enum SinkCommand {
    Audio(Vec<u8>),
    Interrupt,
}

/// Connected avatar renderer client.
pub struct AvatarClient {
    cmd_tx: mpsc::UnboundedSender<SinkCommand>,
    ready_rx: watch::Receiver<bool>,
}

impl AvatarClient {
    /// Negotiate a renderer session and open the audio socket.
    ///
    /// Returns the client and the stream of renderer events. Readiness is
    /// additionally exposed as a watch signal via [`AvatarClient::ready`]:
    /// it flips to `true` exactly once, when the renderer reports startup
    /// completion, and is never unset for the life of the session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Avatar`] if the token exchange, ICE fetch, or
    /// socket connection fails. Callers treat this as non-fatal and lean on
    /// the fallback playback path.
    pub async fn connect(
        config: &AvatarConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AvatarEvent>)> {
        let http = reqwest::Client::new();
        let base = config.base_url.trim_end_matches('/');

        let token_response = http
            .post(format!("{base}/session"))
            .header(API_KEY_HEADER, &config.api_key)
            .json(&SessionTokenRequest {
                face_id: &config.face_id,
                handle_silence: true,
                max_session_length: config.max_session_secs,
                max_idle_time: config.max_idle_secs,
            })
            .send()
            .await
            .map_err(|e| SessionError::Avatar(format!("session token exchange: {e}")))?;
        if !token_response.status().is_success() {
            return Err(SessionError::Avatar(format!(
                "session token exchange: HTTP {}",
                token_response.status()
            )));
        }
        let token: SessionTokenResponse = token_response
            .json()
            .await
            .map_err(|e| SessionError::Avatar(format!("session token body: {e}")))?;

        let ice_response = http
            .get(format!("{base}/ice"))
            .header(API_KEY_HEADER, &config.api_key)
            .send()
            .await
            .map_err(|e| SessionError::Avatar(format!("ICE negotiation: {e}")))?;
        if !ice_response.status().is_success() {
            return Err(SessionError::Avatar(format!(
                "ICE negotiation: HTTP {}",
                ice_response.status()
            )));
        }
        let ice_servers: serde_json::Value = ice_response
            .json()
            .await
            .map_err(|e| SessionError::Avatar(format!("ICE body: {e}")))?;

        let ws_url = websocket_url(base, &token.session_token)?;
        info!("connecting avatar socket");
        let (socket, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SessionError::Avatar(format!("socket connect: {e}")))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);

        tokio::spawn(run_socket(socket, ice_servers, cmd_rx, event_tx, ready_tx));

        Ok((Self { cmd_tx, ready_rx }, event_rx))
    }

    /// Readiness signal: `false` until the renderer's startup event, then
    /// `true` for the rest of the session.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }
}

#[async_trait]
impl AvatarSink for AvatarClient {
    async fn send_audio(&self, pcm: Vec<u8>) -> Result<()> {
        self.cmd_tx
            .send(SinkCommand::Audio(pcm))
            .map_err(|_| SessionError::Avatar("avatar socket closed".into()))
    }

    async fn interrupt(&self) -> Result<()> {
        self.cmd_tx
            .send(SinkCommand::Interrupt)
            .map_err(|_| SessionError::Avatar("avatar socket closed".into()))
    }
}

/// Derive the socket endpoint from the HTTP base URL.
fn websocket_url(base: &str, session_token: &str) -> Result<Url> {
    let mut url = Url::parse(&format!("{base}/session/connect"))
        .map_err(|e| SessionError::Avatar(format!("bad avatar base url: {e}")))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|()| SessionError::Avatar("bad avatar url scheme".into()))?;
    url.query_pairs_mut()
        .append_pair("session_token", session_token);
    Ok(url)
}

async fn run_socket(
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    ice_servers: serde_json::Value,
    mut cmd_rx: mpsc::UnboundedReceiver<SinkCommand>,
    event_tx: mpsc::UnboundedSender<AvatarEvent>,
    ready_tx: watch::Sender<bool>,
) {
    let (mut write, mut read) = socket.split();

    // Negotiation handshake payload travels in-band once the socket is up.
    let hello = ClientMessage::Hello { ice_servers };
    if let Ok(text) = serde_json::to_string(&hello) {
        if write.send(Message::Text(text)).await.is_err() {
            error!("avatar socket closed during handshake");
            let _ = event_tx.send(AvatarEvent::Error("socket closed during handshake".into()));
            return;
        }
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SinkCommand::Audio(pcm)) => {
                        if write.send(Message::Binary(pcm)).await.is_err() {
                            let _ = event_tx.send(AvatarEvent::Error("socket write failed".into()));
                            break;
                        }
                    }
                    Some(SinkCommand::Interrupt) => {
                        let msg = ClientMessage::Interrupt;
                        if let Ok(text) = serde_json::to_string(&msg) {
                            if write.send(Message::Text(text)).await.is_err() {
                                let _ = event_tx.send(AvatarEvent::Error("socket write failed".into()));
                                break;
                            }
                        }
                    }
                    None => {
                        // Client dropped; close politely.
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(ServerMessage::Ready) => {
                                info!("avatar renderer ready");
                                let _ = ready_tx.send(true);
                                let _ = event_tx.send(AvatarEvent::Ready);
                            }
                            Ok(ServerMessage::PlaybackFinished) => {
                                let _ = event_tx.send(AvatarEvent::PlaybackFinished);
                            }
                            Ok(ServerMessage::Error { message }) => {
                                warn!("avatar renderer error: {message}");
                                let _ = event_tx.send(AvatarEvent::Error(message));
                            }
                            Err(e) => debug!("unrecognized avatar message: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("avatar socket closed");
                        let _ = event_tx.send(AvatarEvent::Error("socket closed".into()));
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = event_tx.send(AvatarEvent::Error(format!("socket error: {e}")));
                        break;
                    }
                }
            }
        }
    }
}
