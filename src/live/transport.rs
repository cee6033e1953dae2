//! Boundary to the remote conversational endpoint.

use crate::audio::capture::AudioSender;
use crate::audio::pcm::AudioBuffer;
use crate::config::SessionConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Base64 PCM reply audio as received, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAudioChunk {
    /// Base64-encoded 16-bit little-endian PCM.
    pub data: String,
    /// Rate declared by the server.
    pub sample_rate: u32,
}

impl RemoteAudioChunk {
    /// Decode into playable samples. Called at most once per chunk.
    ///
    /// # Errors
    ///
    /// Returns `MalformedAudioData` for invalid base64 or odd-length PCM.
    pub fn decode(&self) -> Result<AudioBuffer> {
        AudioBuffer::from_base64(&self.data, self.sample_rate)
    }
}

/// Events delivered by the endpoint, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Handshake complete; audio may flow.
    Open,
    /// Reply audio, in playback order.
    Audio(RemoteAudioChunk),
    /// The user barged in; drop everything still playing.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
    /// The server ended the session.
    Closed {
        /// Reason reported by the server, if any.
        reason: Option<String>,
    },
    /// Transport fault after open.
    Error(String),
}

/// An established network session. Sending is ordered and fire-and-forget.
pub trait LiveSession: AudioSender {
    /// Close the session. Idempotent; in-flight sends fail silently afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport reported a failure while closing.
    fn close(&self) -> Result<()>;
}

/// Adapts a session handle to the capture pipeline's sender seam.
struct SessionAudio(Arc<dyn LiveSession>);

#[async_trait]
impl AudioSender for SessionAudio {
    async fn send_audio(&self, blob: crate::audio::pcm::PcmBlob) -> Result<()> {
        self.0.send_audio(blob).await
    }
}

/// Sender that forwards capture frames to `session`.
pub fn audio_sender(session: Arc<dyn LiveSession>) -> Arc<dyn AudioSender> {
    Arc::new(SessionAudio(session))
}

/// A connected session plus its event stream.
pub struct LiveConnection {
    /// Handle used for sending audio and closing.
    pub session: Arc<dyn LiveSession>,
    /// Server events in arrival order. Ends when the transport is gone.
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Factory for network sessions.
#[async_trait]
pub trait LiveEndpoint: Send + Sync {
    /// Open a session with explicit configuration and credential.
    ///
    /// # Errors
    ///
    /// Returns `ConnectFailed` for a missing credential or a network reject.
    async fn connect(&self, config: &SessionConfig) -> Result<LiveConnection>;
}
