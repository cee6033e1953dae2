//! Gemini Live endpoint over a bidirectional WebSocket.
//!
//! Connecting opens the socket and sends the `setup` message; the session is
//! considered open only when the server answers with `setupComplete`, which is
//! surfaced as [`ServerEvent::Open`].

use crate::audio::capture::AudioSender;
use crate::audio::pcm::{self, PcmBlob};
use crate::config::{EndpointConfig, SessionConfig};
use crate::error::{LiveError, Result};
use crate::live::transport::{
    LiveConnection, LiveEndpoint, LiveSession, RemoteAudioChunk, ServerEvent,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound queue depth. Each send waits for its write, so at most one frame
/// sits here; anything newer stays in the capture slot where overrun applies.
const OUTBOUND_QUEUE: usize = 1;
/// How long to wait for the close frame to go out on teardown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaBlob>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaBlob {
    mime_type: String,
    data: String,
}

/// Messages received from the server. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

fn setup_message(endpoint: &EndpointConfig) -> ClientMessage {
    ClientMessage::Setup(Setup {
        model: format!("models/{}", endpoint.model),
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".to_owned()],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: endpoint.voice_name.clone(),
                    },
                },
            },
        },
        system_instruction: Content {
            parts: vec![TextPart {
                text: endpoint.system_instruction.clone(),
            }],
        },
    })
}

fn audio_message(blob: &PcmBlob) -> ClientMessage {
    ClientMessage::RealtimeInput(RealtimeInput {
        media_chunks: vec![MediaBlob {
            mime_type: blob.mime_type(),
            data: blob.to_base64(),
        }],
    })
}

/// Translate one server frame into events, preserving in-message order:
/// audio parts first, then interruption, then turn completion.
fn parse_server_message(text: &str, default_rate: u32) -> Vec<ServerEvent> {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!("ignoring unparseable server message: {e}");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    if msg.setup_complete.is_some() {
        events.push(ServerEvent::Open);
    }
    if let Some(content) = msg.server_content {
        let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
        for inline in parts.into_iter().filter_map(|p| p.inline_data) {
            if inline.data.is_empty() || !inline.mime_type.starts_with("audio/") {
                continue;
            }
            events.push(ServerEvent::Audio(RemoteAudioChunk {
                sample_rate: pcm::parse_rate(&inline.mime_type).unwrap_or(default_rate),
                data: inline.data,
            }));
        }
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }
    if msg.go_away.is_some() {
        events.push(ServerEvent::Closed {
            reason: Some("server requested disconnect".to_owned()),
        });
    }
    events
}

/// Endpoint URL with the key appended as a query parameter.
fn session_url(endpoint: &EndpointConfig, key: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(&endpoint.url)
        .map_err(|e| LiveError::ConnectFailed(format!("invalid endpoint url: {e}")))?;
    url.query_pairs_mut().append_pair("key", key);
    Ok(url)
}

// ---------------------------------------------------------------------------
// Endpoint and session
// ---------------------------------------------------------------------------

/// Connects to Gemini Live.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiLiveEndpoint;

#[async_trait]
impl LiveEndpoint for GeminiLiveEndpoint {
    async fn connect(&self, config: &SessionConfig) -> Result<LiveConnection> {
        if config.credential.is_empty() {
            return Err(LiveError::ConnectFailed("API key is missing".into()));
        }
        let url = session_url(&config.endpoint, config.credential.expose())?;
        info!(endpoint = %config.endpoint.url, model = %config.endpoint.model, "connecting to live endpoint");

        let (ws_stream, _) =
            tokio::time::timeout(config.endpoint.connect_timeout(), tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| {
                    LiveError::ConnectFailed(format!(
                        "timed out after {}s",
                        config.endpoint.connect_timeout_secs
                    ))
                })?
                .map_err(|e| LiveError::ConnectFailed(format!("connect: {e}")))?;

        let (mut write, read) = ws_stream.split();

        let setup = serde_json::to_string(&setup_message(&config.endpoint))
            .map_err(|e| LiveError::ConnectFailed(format!("encode setup: {e}")))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| LiveError::ConnectFailed(format!("send setup: {e}")))?;

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(write, outbound_rx, event_tx.clone(), cancel.clone()));
        tokio::spawn(read_loop(
            read,
            event_tx,
            config.audio.output_sample_rate,
            cancel.clone(),
        ));

        Ok(LiveConnection {
            session: Arc::new(GeminiLiveSession {
                outbound: outbound_tx,
                cancel,
            }),
            events: event_rx,
        })
    }
}

/// One serialized frame plus the signal fired once the socket accepted it.
struct Outbound {
    json: String,
    written: oneshot::Sender<()>,
}

/// Handle to an open Gemini Live socket. Dropping it closes the socket.
struct GeminiLiveSession {
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

#[async_trait]
impl AudioSender for GeminiLiveSession {
    async fn send_audio(&self, blob: PcmBlob) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(LiveError::SessionError("session closed".into()));
        }
        let json = serde_json::to_string(&audio_message(&blob))
            .map_err(|e| LiveError::SessionError(format!("encode audio: {e}")))?;
        let (written, accepted) = oneshot::channel();
        self.outbound
            .send(Outbound { json, written })
            .await
            .map_err(|_| LiveError::SessionError("session closed".into()))?;
        // Resolve only once the frame is on the socket; while it is not, newer
        // frames wait in the capture slot.
        accepted
            .await
            .map_err(|_| LiveError::SessionError("session closed before frame was written".into()))
    }
}

impl LiveSession for GeminiLiveSession {
    fn close(&self) -> Result<()> {
        if !self.cancel.is_cancelled() {
            info!("closing live session");
            self.cancel.cancel();
        }
        Ok(())
    }
}

impl Drop for GeminiLiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn write_loop<S>(
    mut write: S,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    cancel: CancellationToken,
) where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_GRACE, write.send(Message::Close(None))).await;
                break;
            }
            outbound = outbound_rx.recv() => {
                let Some(Outbound { json, written }) = outbound else { break };
                let result = tokio::select! {
                    () = cancel.cancelled() => break,
                    result = write.send(Message::Text(json)) => result,
                };
                if let Err(e) = result {
                    if !cancel.is_cancelled() {
                        let _ = event_tx.send(ServerEvent::Error(format!("send error: {e}")));
                    }
                    cancel.cancel();
                    break;
                }
                let _ = written.send(());
            }
        }
    }
    debug!("live writer exited");
}

async fn read_loop<S, E>(
    mut read: S,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    default_rate: u32,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = read.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => {
                    warn!("ignoring non-UTF-8 binary frame: {e}");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty());
                let _ = event_tx.send(ServerEvent::Closed { reason });
                break;
            }
            None => {
                let _ = event_tx.send(ServerEvent::Closed { reason: None });
                break;
            }
            Some(Err(e)) => {
                if !cancel.is_cancelled() {
                    let _ = event_tx.send(ServerEvent::Error(format!("read error: {e}")));
                }
                break;
            }
            Some(Ok(_)) => continue, // Ping/Pong handled by tungstenite.
        };

        for event in parse_server_message(&text, default_rate) {
            let terminal = matches!(event, ServerEvent::Closed { .. });
            if event_tx.send(event).is_err() || terminal {
                cancel.cancel();
                debug!("live reader exited");
                return;
            }
        }
    }
    cancel.cancel();
    debug!("live reader exited");
}
