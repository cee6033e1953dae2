//! Error types for the live conversation session.

/// Top-level error type for the duplex voice session.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// The remote endpoint could not be reached or rejected the session
    /// (missing credential, network reject, handshake timeout).
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Microphone or speaker could not be acquired.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Transport fault after the session was successfully opened.
    #[error("session error: {0}")]
    SessionError(String),

    /// Audio payload could not be decoded. Contained per chunk.
    #[error("malformed audio data: {0}")]
    MalformedAudioData(String),

    /// A captured frame was dropped because the send path had not accepted
    /// the previous one yet. Non-fatal.
    #[error("capture overrun: {dropped} frame(s) dropped so far")]
    CaptureOverrun {
        /// Total frames dropped in this capture run.
        dropped: u64,
    },

    /// `start` was requested while a session is already active.
    #[error("a session is already active ({0})")]
    SessionBusy(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl LiveError {
    /// Whether this error ends the current session.
    ///
    /// Codec and overrun errors are contained to a single chunk or frame.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::MalformedAudioData(_) | Self::CaptureOverrun { .. }
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, LiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_level_errors_are_not_terminal() {
        assert!(!LiveError::MalformedAudioData("odd length".into()).is_terminal());
        assert!(!LiveError::CaptureOverrun { dropped: 3 }.is_terminal());
        assert!(LiveError::ConnectFailed("no key".into()).is_terminal());
        assert!(LiveError::DeviceUnavailable("mic".into()).is_terminal());
        assert!(LiveError::SessionError("reset".into()).is_terminal());
    }

    #[test]
    fn display_includes_detail() {
        let e = LiveError::CaptureOverrun { dropped: 2 };
        assert_eq!(e.to_string(), "capture overrun: 2 frame(s) dropped so far");
        let e = LiveError::ConnectFailed("API key is missing".into());
        assert!(e.to_string().contains("API key is missing"));
    }
}
