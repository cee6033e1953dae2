//! Live session: endpoint transport, state machine and the controller that ties
//! capture and playback to a network session.

pub mod controller;
pub mod gemini;
pub mod state;
pub mod transport;

pub use controller::{ResourceSummary, SessionController};
pub use gemini::GeminiLiveEndpoint;
pub use state::{SessionState, SessionStatus};
pub use transport::{LiveConnection, LiveEndpoint, LiveSession, RemoteAudioChunk, ServerEvent};
