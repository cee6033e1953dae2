//! Configuration types for the live voice session.

use crate::error::{LiveError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Live model used when no override is configured.
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Default Gemini Live bidirectional streaming endpoint.
pub const DEFAULT_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Aura, an intelligent assistant for the blind. \
Speak clearly, concisely, and describe things vividly. Be helpful and empathetic. \
Your creator and developer is Rashpinder.";

/// Top-level configuration loaded from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Remote conversational endpoint settings.
    pub endpoint: EndpointConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture (wire) sample rate in Hz.
    pub input_sample_rate: u32,
    /// Playback sample rate in Hz. Must match the rate the endpoint declares.
    pub output_sample_rate: u32,
    /// Samples per captured frame.
    pub frame_size: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_size: 4096,
            input_device: None,
            output_device: None,
        }
    }
}

/// Remote endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// WebSocket URL of the live endpoint (without the key query parameter).
    pub url: String,
    /// Model identifier, without the `models/` prefix.
    pub model: String,
    /// Prebuilt voice used for synthesized replies.
    pub voice_name: String,
    /// Persona instruction sent in the setup message.
    pub system_instruction: String,
    /// Seconds to wait for the socket to connect.
    pub connect_timeout_secs: u64,
    /// Environment variable the binary reads the API key from.
    pub api_key_env: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_LIVE_URL.to_owned(),
            model: DEFAULT_LIVE_MODEL.to_owned(),
            voice_name: "Kore".to_owned(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_owned(),
            connect_timeout_secs: 15,
            api_key_env: "API_KEY".to_owned(),
        }
    }
}

impl EndpointConfig {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// API credential for the remote endpoint. Never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Read the key from the named environment variable.
    ///
    /// Returns an empty credential when the variable is unset; the endpoint
    /// rejects it at connect time with `ConnectFailed`.
    pub fn from_env(var: &str) -> Self {
        Self(std::env::var(var).unwrap_or_default())
    }

    /// The raw key.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether a key is present.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Credential(<empty>)")
        } else {
            f.write_str("Credential(<redacted>)")
        }
    }
}

/// Everything a single session needs, passed explicitly to `start()`.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Audio settings.
    pub audio: AudioConfig,
    /// Endpoint settings.
    pub endpoint: EndpointConfig,
    /// API credential.
    pub credential: Credential,
}

impl SessionConfig {
    /// Build a session config from file config and an explicit credential.
    pub fn new(config: &LiveConfig, credential: Credential) -> Self {
        Self {
            audio: config.audio.clone(),
            endpoint: config.endpoint.clone(),
            credential,
        }
    }
}

impl LiveConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| LiveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| LiveError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/aura/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("aura")
            .join("config.toml")
    }

    /// Reject values no session could run with.
    ///
    /// # Errors
    ///
    /// Returns `LiveError::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.audio.input_sample_rate == 0 {
            return Err(LiveError::Config("audio.input_sample_rate must be > 0".into()));
        }
        if self.audio.output_sample_rate == 0 {
            return Err(LiveError::Config("audio.output_sample_rate must be > 0".into()));
        }
        if self.audio.frame_size == 0 {
            return Err(LiveError::Config("audio.frame_size must be > 0".into()));
        }
        if self.endpoint.model.trim().is_empty() {
            return Err(LiveError::Config("endpoint.model must not be empty".into()));
        }
        url::Url::parse(&self.endpoint.url)
            .map_err(|e| LiveError::Config(format!("endpoint.url: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = LiveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio.input_sample_rate, 16_000);
        assert_eq!(config.audio.output_sample_rate, 24_000);
        assert_eq!(config.audio.frame_size, 4096);
        assert_eq!(config.endpoint.voice_name, "Kore");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = LiveConfig::default();
        config.audio.frame_size = 2048;
        config.endpoint.voice_name = "Puck".to_owned();

        config.save_to_file(&path).unwrap();
        let loaded = LiveConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: LiveConfig = toml::from_str("[audio]\nframe_size = 1024\n").unwrap();
        assert_eq!(config.audio.frame_size, 1024);
        assert_eq!(config.audio.output_sample_rate, 24_000);
        assert_eq!(config.endpoint.model, DEFAULT_LIVE_MODEL);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = LiveConfig::from_file(std::path::Path::new("/nonexistent/aura/config.toml"));
        assert!(matches!(result, Err(LiveError::Io(_))));
    }

    #[test]
    fn zero_frame_size_is_rejected() {
        let mut config = LiveConfig::default();
        config.audio.frame_size = 0;
        assert!(matches!(config.validate(), Err(LiveError::Config(_))));
    }

    #[test]
    fn invalid_url_is_rejected() {
        let mut config = LiveConfig::default();
        config.endpoint.url = "not a url".to_owned();
        assert!(matches!(config.validate(), Err(LiveError::Config(_))));
    }

    #[test]
    fn credential_debug_is_redacted() {
        let cred = Credential::new("secret-key");
        let shown = format!("{cred:?}");
        assert!(!shown.contains("secret-key"));
        assert!(Credential::default().is_empty());
        assert!(Credential::new("   ").is_empty());
    }
}
