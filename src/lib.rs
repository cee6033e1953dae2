//! Aura: real-time duplex voice conversation with a remote audio model.
//!
//! Microphone audio streams up to the endpoint while reply audio streams back
//! and plays gaplessly, with barge-in when the user talks over the assistant:
//! Microphone → PCM encode → Endpoint → PCM decode → Scheduler → Speaker
//!
//! # Architecture
//!
//! - **Codec** (`audio::pcm`): float ↔ 16-bit little-endian PCM, base64 blobs
//! - **Capture** (`audio::capture`): microphone frames to the network, newest wins
//! - **Playback** (`audio::playback`): sample-accurate scheduling on the output clock
//! - **Session** (`live`): state machine, endpoint transport, and the controller
//!   that owns every resource for one conversation

pub mod audio;
pub mod config;
pub mod error;
pub mod live;
pub mod testing;

pub use config::{Credential, LiveConfig, SessionConfig};
pub use error::{LiveError, Result};
pub use live::{SessionController, SessionState, SessionStatus};
