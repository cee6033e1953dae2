//! Session state machine.
//!
//! [`SessionState::on`] is the transition table; the controller never assigns
//! a state directly. [`SessionStatus`] is the read-only projection shown to the UI.

use std::fmt;

/// Lifecycle state of the duplex session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session and no resources.
    Idle,
    /// Network session requested, handshake not complete.
    Connecting,
    /// Open; capture running, nothing playing.
    Listening,
    /// Open; capture running, reply audio playing.
    Speaking,
    /// Teardown in progress.
    Closing,
    /// A terminal error occurred; teardown in progress.
    Faulted(String),
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// User asked to start.
    Start,
    /// Endpoint completed its handshake.
    ServerOpen,
    /// A reply chunk was scheduled.
    ChunkArrived,
    /// The last active playback source ended.
    PlaybackDrained,
    /// Endpoint signalled barge-in.
    ServerInterrupt,
    /// Endpoint closed the session.
    ServerClose,
    /// User asked to stop.
    UserStop,
    /// Connect, device, or transport failure.
    Fault(String),
    /// Every resource has been released.
    CleanupComplete,
}

/// A trigger that has no meaning in the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    /// State the trigger arrived in.
    pub from: SessionState,
    /// The trigger.
    pub trigger: Trigger,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} is not valid in {:?}", self.trigger, self.from)
    }
}

impl SessionState {
    /// Next state for `trigger`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when the trigger does not apply; the
    /// caller keeps the current state.
    pub fn on(&self, trigger: Trigger) -> Result<SessionState, InvalidTransition> {
        use SessionState::*;
        use Trigger as T;

        let next = match (self, &trigger) {
            (Idle, T::Start) => Connecting,
            (Idle, T::UserStop) => Idle,

            (Connecting, T::ServerOpen) => Listening,

            (Listening | Speaking, T::ChunkArrived) => Speaking,
            (Speaking, T::PlaybackDrained) => Listening,
            (Listening | Speaking, T::ServerInterrupt) => Listening,

            (Connecting | Listening | Speaking, T::ServerClose | T::UserStop) => Closing,
            (Connecting | Listening | Speaking, T::Fault(msg)) => Faulted(msg.clone()),
            // Repeated stop requests while tearing down.
            (Closing, T::UserStop | T::ServerClose) => Closing,

            (Closing | Faulted(_), T::CleanupComplete) => Idle,

            _ => {
                return Err(InvalidTransition {
                    from: self.clone(),
                    trigger,
                });
            }
        };
        Ok(next)
    }

    /// Whether a network session, capture or playback may be held.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Listening | Self::Speaking)
    }

    /// Whether the session is open and streaming audio both ways.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Listening | Self::Speaking)
    }

    /// Short lowercase name, used in logs and `SessionBusy` errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Closing => "closing",
            Self::Faulted(_) => "faulted",
        }
    }
}

/// What the presentation layer shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Ready to start.
    Idle,
    /// Waiting for the endpoint.
    Connecting,
    /// The assistant is listening.
    Listening,
    /// The assistant is speaking.
    Speaking,
    /// The last session ended with an error.
    Error(String),
}

impl SessionStatus {
    /// Project a state plus the last surfaced error.
    pub fn project(state: &SessionState, last_error: Option<&str>) -> Self {
        match state {
            SessionState::Connecting => Self::Connecting,
            SessionState::Listening => Self::Listening,
            SessionState::Speaking => Self::Speaking,
            SessionState::Faulted(msg) => Self::Error(msg.clone()),
            SessionState::Idle | SessionState::Closing => match last_error {
                Some(msg) => Self::Error(msg.to_owned()),
                None => Self::Idle,
            },
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Tap to start speaking"),
            Self::Connecting => f.write_str("Connecting to Aura..."),
            Self::Listening => f.write_str("Aura is listening..."),
            Self::Speaking => f.write_str("Aura is speaking..."),
            Self::Error(msg) => write!(f, "Error: {msg}"),
        }
    }
}
