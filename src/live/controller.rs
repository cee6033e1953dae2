//! Session controller: the single owner of session state and resources.
//!
//! The controller runs as one tokio task. User commands, connect completion,
//! server events and playback completions all arrive on queues that the task
//! drains one at a time, so every transition and every acquire/release of the
//! resource set is serialized without locks.
//!
//! Start-up order: speaker, then network, then (only after the endpoint's
//! handshake) microphone. Teardown order: capture, playback, network. Each
//! teardown step runs even if an earlier one failed. Teardown completes within
//! the event that triggered it, so a `start` sent while teardown is under way
//! is processed after it finishes.
//!
//! Interruption carries no turn id on the wire. After a flush, any audio the
//! server still sends is played as the next turn; a server that reorders an
//! interrupt ahead of trailing audio for the same turn would make that audio
//! audible.

use crate::audio::capture::{CapturePipeline, CaptureStats};
use crate::audio::device::{InputDevice, OutputDevice, SourceEvent};
use crate::audio::playback::{Completion, PlaybackScheduler};
use crate::config::SessionConfig;
use crate::error::{LiveError, Result};
use crate::live::state::{SessionState, SessionStatus, Trigger};
use crate::live::transport::{
    LiveConnection, LiveEndpoint, LiveSession, RemoteAudioChunk, ServerEvent, audio_sender,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{Span, debug, error, info, info_span, warn};

/// What the session currently holds. Used by tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSummary {
    /// Microphone open and capture running.
    pub microphone: bool,
    /// Speaker open.
    pub speaker: bool,
    /// Network session established.
    pub network: bool,
    /// Connect attempt in flight.
    pub connecting: bool,
    /// Playback sources started and not yet ended.
    pub active_sources: usize,
    /// Capture counters, while capture runs.
    pub capture: Option<CaptureStats>,
}

impl ResourceSummary {
    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        !self.microphone
            && !self.speaker
            && !self.network
            && !self.connecting
            && self.active_sources == 0
    }
}

enum Command {
    Start {
        config: SessionConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
    Resources {
        reply: oneshot::Sender<ResourceSummary>,
    },
}

/// Handle to the session actor.
///
/// Dropping the handle stops the actor and releases every resource.
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

impl SessionController {
    /// Spawn the controller on the current tokio runtime.
    pub fn spawn(
        endpoint: Arc<dyn LiveEndpoint>,
        input: Arc<dyn InputDevice>,
        output: Arc<dyn OutputDevice>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::Idle);
        let actor = SessionActor {
            endpoint,
            input,
            output,
            state: SessionState::Idle,
            last_error: None,
            config: None,
            resources: Resources::default(),
            status_tx,
            span: Span::none(),
        };
        let task = tokio::spawn(actor.run(command_rx));
        Self {
            commands,
            status,
            task,
        }
    }

    /// Begin a session.
    ///
    /// Returns once the request is accepted; connect and device failures are
    /// reported through [`status`](Self::status).
    ///
    /// # Errors
    ///
    /// `SessionBusy` if a session is active, `Config` for unusable settings.
    pub async fn start(&self, config: SessionConfig) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { config, reply })?;
        rx.await.map_err(|_| controller_gone())?
    }

    /// End the session and release everything. Resolves once the controller
    /// is idle. From idle, clears a surfaced error.
    ///
    /// # Errors
    ///
    /// Returns an error only if the controller task is gone.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply })?;
        rx.await.map_err(|_| controller_gone())
    }

    /// Current state.
    ///
    /// # Errors
    ///
    /// Returns an error only if the controller task is gone.
    pub async fn state(&self) -> Result<SessionState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::State { reply })?;
        rx.await.map_err(|_| controller_gone())
    }

    /// Snapshot of held resources.
    ///
    /// # Errors
    ///
    /// Returns an error only if the controller task is gone.
    pub async fn resources(&self) -> Result<ResourceSummary> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Resources { reply })?;
        rx.await.map_err(|_| controller_gone())
    }

    /// Read-only status stream for presentation.
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Stop any session and wait for the controller task to exit.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            error!("session controller task failed: {e}");
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| controller_gone())
    }
}

fn controller_gone() -> LiveError {
    LiveError::Channel("session controller stopped".into())
}

/// The resource set. Every field is released by `SessionActor::cleanup`.
#[derive(Default)]
struct Resources {
    connecting: Option<JoinHandle<Result<LiveConnection>>>,
    session: Option<Arc<dyn LiveSession>>,
    server_events: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    playback: Option<PlaybackScheduler>,
    source_events: Option<mpsc::UnboundedReceiver<SourceEvent>>,
    capture: Option<CapturePipeline>,
}

impl Resources {
    fn summary(&self) -> ResourceSummary {
        ResourceSummary {
            microphone: self.capture.as_ref().is_some_and(CapturePipeline::is_running),
            speaker: self.playback.is_some(),
            network: self.session.is_some(),
            connecting: self.connecting.is_some(),
            active_sources: self.playback.as_ref().map_or(0, PlaybackScheduler::active_len),
            capture: self.capture.as_ref().map(CapturePipeline::stats),
        }
    }
}

enum Input {
    Command(Command),
    Connected(std::result::Result<Result<LiveConnection>, JoinError>),
    Server(Option<ServerEvent>),
    Source(Option<SourceEvent>),
}

struct SessionActor {
    endpoint: Arc<dyn LiveEndpoint>,
    input: Arc<dyn InputDevice>,
    output: Arc<dyn OutputDevice>,
    state: SessionState,
    last_error: Option<String>,
    config: Option<SessionConfig>,
    resources: Resources,
    status_tx: watch::Sender<SessionStatus>,
    span: Span,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let input = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => Input::Command(cmd),
                    None => break,
                },
                Some(result) = join_opt(&mut self.resources.connecting) => Input::Connected(result),
                event = recv_opt(&mut self.resources.server_events) => Input::Server(event),
                event = recv_opt(&mut self.resources.source_events) => Input::Source(event),
            };
            let span = self.span.clone();
            let _entered = span.enter();
            self.dispatch(input);
        }

        if self.state.is_active() {
            let _entered = self.span.clone().entered();
            info!("controller dropped, tearing down session");
            self.stop();
        }
    }

    fn dispatch(&mut self, input: Input) {
        match input {
            Input::Command(Command::Start { config, reply }) => {
                let _ = reply.send(self.start(config));
            }
            Input::Command(Command::Stop { reply }) => {
                self.stop();
                let _ = reply.send(());
            }
            Input::Command(Command::State { reply }) => {
                let _ = reply.send(self.state.clone());
            }
            Input::Command(Command::Resources { reply }) => {
                let _ = reply.send(self.resources.summary());
            }
            Input::Connected(result) => {
                self.resources.connecting = None;
                self.on_connected(result);
            }
            Input::Server(Some(event)) => self.on_server_event(event),
            Input::Server(None) => {
                self.resources.server_events = None;
                self.on_server_event(ServerEvent::Closed {
                    reason: Some("event stream ended".into()),
                });
            }
            Input::Source(Some(event)) => self.on_source_event(event),
            Input::Source(None) => self.resources.source_events = None,
        }
    }

    fn start(&mut self, config: SessionConfig) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(LiveError::SessionBusy(self.state.name().to_owned()));
        }
        if config.audio.frame_size == 0
            || config.audio.input_sample_rate == 0
            || config.audio.output_sample_rate == 0
        {
            return Err(LiveError::Config(
                "sample rates and frame size must be non-zero".into(),
            ));
        }

        self.span = info_span!("live_session", id = %uuid::Uuid::new_v4());
        let _entered = self.span.clone().entered();
        self.last_error = None;
        self.transition(Trigger::Start);

        let (source_tx, source_rx) = mpsc::unbounded_channel();
        match PlaybackScheduler::open(
            self.output.as_ref(),
            config.audio.output_sample_rate,
            source_tx,
        ) {
            Ok(playback) => {
                self.resources.playback = Some(playback);
                self.resources.source_events = Some(source_rx);
            }
            Err(e) => {
                self.fault(e);
                return Ok(());
            }
        }

        let endpoint = Arc::clone(&self.endpoint);
        let connect_config = config.clone();
        self.resources.connecting = Some(tokio::spawn(async move {
            endpoint.connect(&connect_config).await
        }));
        self.config = Some(config);
        Ok(())
    }

    fn stop(&mut self) {
        if self.state == SessionState::Idle {
            if self.last_error.take().is_some() {
                self.publish();
            }
            return;
        }
        info!(state = self.state.name(), "stopping session");
        self.transition(Trigger::UserStop);
        self.cleanup();
        self.transition(Trigger::CleanupComplete);
    }

    fn on_connected(&mut self, result: std::result::Result<Result<LiveConnection>, JoinError>) {
        match result {
            Ok(Ok(connection)) => {
                if self.state != SessionState::Connecting {
                    // Stop won the race; release the late session.
                    if let Err(e) = connection.session.close() {
                        warn!(error = %e, "closing late session failed");
                    }
                    return;
                }
                info!("network session established, awaiting handshake");
                self.resources.session = Some(connection.session);
                self.resources.server_events = Some(connection.events);
            }
            Ok(Err(e)) => self.fault(e),
            Err(e) if e.is_cancelled() => debug!("connect aborted"),
            Err(e) => self.fault(LiveError::ConnectFailed(format!("connect task failed: {e}"))),
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Open => self.on_open(),
            ServerEvent::Audio(chunk) => self.on_audio(&chunk),
            ServerEvent::Interrupted => {
                if !self.state.is_open() {
                    debug!(state = self.state.name(), "interrupt ignored");
                    return;
                }
                let stopped = self
                    .resources
                    .playback
                    .as_mut()
                    .map_or(0, PlaybackScheduler::flush);
                info!(stopped, "barge-in: playback flushed");
                self.transition(Trigger::ServerInterrupt);
            }
            ServerEvent::TurnComplete => debug!("model turn complete"),
            ServerEvent::Closed { reason } if self.state == SessionState::Connecting => {
                // Rejected during the handshake (bad key, unknown model).
                let reason = reason.unwrap_or_else(|| "closed before setup completed".into());
                self.fault(LiveError::ConnectFailed(reason));
            }
            ServerEvent::Error(message) if self.state == SessionState::Connecting => {
                self.fault(LiveError::ConnectFailed(message));
            }
            ServerEvent::Closed { reason } => {
                info!(reason = reason.as_deref().unwrap_or("none"), "server closed session");
                self.transition(Trigger::ServerClose);
                self.cleanup();
                self.transition(Trigger::CleanupComplete);
            }
            ServerEvent::Error(message) => self.fault(LiveError::SessionError(message)),
        }
    }

    fn on_open(&mut self) {
        if self.state != SessionState::Connecting {
            debug!(state = self.state.name(), "duplicate open ignored");
            return;
        }
        let (Some(session), Some(config)) = (self.resources.session.clone(), self.config.clone())
        else {
            self.fault(LiveError::SessionError("open without a session".into()));
            return;
        };
        self.transition(Trigger::ServerOpen);

        match CapturePipeline::start(self.input.as_ref(), &config.audio, audio_sender(session)) {
            Ok(capture) => {
                self.resources.capture = Some(capture);
                info!("session open, capture running");
            }
            Err(e) => self.fault(e),
        }
    }

    fn on_audio(&mut self, chunk: &RemoteAudioChunk) {
        if !self.state.is_open() {
            debug!(state = self.state.name(), "audio chunk outside open session dropped");
            return;
        }
        let Some(playback) = self.resources.playback.as_mut() else {
            return;
        };
        if chunk.sample_rate != playback.sample_rate() {
            warn!(
                declared = chunk.sample_rate,
                output = playback.sample_rate(),
                "rejecting chunk with mismatched sample rate"
            );
            return;
        }
        let buffer = match chunk.decode() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "dropping undecodable chunk");
                return;
            }
        };
        match playback.enqueue(&buffer) {
            Ok(Some(_)) => self.transition(Trigger::ChunkArrived),
            Ok(None) => debug!("empty chunk ignored"),
            Err(e) if e.is_terminal() => self.fault(e),
            Err(e) => warn!(error = %e, "chunk rejected by playback"),
        }
    }

    fn on_source_event(&mut self, event: SourceEvent) {
        let SourceEvent::Ended(id) = event;
        let Some(playback) = self.resources.playback.as_mut() else {
            return;
        };
        if playback.complete(id) == Completion::Drained {
            debug!("playback drained");
            self.transition(Trigger::PlaybackDrained);
        }
    }

    fn fault(&mut self, error: LiveError) {
        let message = error.to_string();
        error!(error = %message, "session faulted");
        self.last_error = Some(message.clone());
        self.transition(Trigger::Fault(message));
        self.cleanup();
        self.transition(Trigger::CleanupComplete);
    }

    /// Release the whole resource set. Never short-circuits; returns every
    /// failure encountered.
    fn cleanup(&mut self) -> Vec<LiveError> {
        let mut errors = Vec::new();

        if let Some(connecting) = self.resources.connecting.take() {
            connecting.abort();
        }
        if let Some(mut capture) = self.resources.capture.take() {
            if let Err(e) = capture.stop() {
                errors.push(e);
            }
        }
        if let Some(playback) = self.resources.playback.take() {
            if let Err(e) = playback.close() {
                errors.push(e);
            }
        }
        self.resources.source_events = None;
        self.resources.server_events = None;
        if let Some(session) = self.resources.session.take() {
            if let Err(e) = session.close() {
                errors.push(e);
            }
        }
        self.config = None;

        for e in &errors {
            warn!(error = %e, "cleanup step failed");
        }
        info!(failures = errors.len(), "session resources released");
        errors
    }

    fn transition(&mut self, trigger: Trigger) {
        match self.state.on(trigger) {
            Ok(next) => {
                if next != self.state {
                    debug!(from = self.state.name(), to = next.name(), "state transition");
                }
                self.state = next;
                self.publish();
            }
            Err(e) => debug!("ignored: {e}"),
        }
    }

    fn publish(&self) {
        let status = SessionStatus::project(&self.state, self.last_error.as_deref());
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_opt<T>(
    handle: &mut Option<JoinHandle<T>>,
) -> Option<std::result::Result<T, JoinError>> {
    match handle {
        Some(handle) => Some(handle.await),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::testing::{ManualSpeaker, MockMicrophone, ScriptedEndpoint};
    use std::time::Duration;

    fn controller() -> (SessionController, ScriptedEndpoint, MockMicrophone, ManualSpeaker) {
        let endpoint = ScriptedEndpoint::new();
        let mic = MockMicrophone::new();
        let speaker = ManualSpeaker::new();
        let ctl = SessionController::spawn(
            Arc::new(endpoint.clone()),
            Arc::new(mic.clone()),
            Arc::new(speaker.clone()),
        );
        (ctl, endpoint, mic, speaker)
    }

    async fn wait_status(ctl: &SessionController, want: SessionStatus) {
        let mut rx = ctl.status();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
            .await
            .expect("status timeout")
            .expect("status channel closed");
    }

    #[tokio::test]
    async fn cleanup_twice_is_a_noop() {
        let (ctl, endpoint, _mic, _speaker) = controller();
        ctl.start(SessionConfig::default()).await.unwrap();
        endpoint.emit(ServerEvent::Open);
        wait_status(&ctl, SessionStatus::Listening).await;

        ctl.stop().await.unwrap();
        let first = (ctl.state().await.unwrap(), ctl.resources().await.unwrap());
        ctl.stop().await.unwrap();
        let second = (ctl.state().await.unwrap(), ctl.resources().await.unwrap());
        assert_eq!(first, second);
        assert_eq!(first.0, SessionState::Idle);
        assert!(first.1.is_empty());
        assert_eq!(endpoint.closes(), 1);
    }

    #[tokio::test]
    async fn busy_start_is_rejected() {
        let (ctl, _endpoint, _mic, _speaker) = controller();
        ctl.start(SessionConfig::default()).await.unwrap();
        let again = ctl.start(SessionConfig::default()).await;
        assert!(matches!(again, Err(LiveError::SessionBusy(s)) if s == "connecting"));
    }

    #[tokio::test]
    async fn zero_frame_size_is_rejected() {
        let (ctl, _endpoint, _mic, _speaker) = controller();
        let mut config = SessionConfig::default();
        config.audio.frame_size = 0;
        assert!(matches!(
            ctl.start(config).await,
            Err(LiveError::Config(_))
        ));
        assert_eq!(ctl.state().await.unwrap(), SessionState::Idle);
    }

    #[tokio::test]
    async fn dropping_handle_releases_resources() {
        let (ctl, endpoint, mic, speaker) = controller();
        ctl.start(SessionConfig::default()).await.unwrap();
        endpoint.emit(ServerEvent::Open);
        wait_status(&ctl, SessionStatus::Listening).await;

        ctl.shutdown().await;
        assert!(!mic.is_open());
        assert!(!speaker.is_open());
        assert_eq!(endpoint.closes(), 1);
    }

    #[tokio::test]
    async fn connection_arriving_after_stop_is_closed() {
        let endpoint = ScriptedEndpoint::new();
        let (status_tx, _status) = watch::channel(SessionStatus::Idle);
        let mut actor = SessionActor {
            endpoint: Arc::new(endpoint.clone()),
            input: Arc::new(MockMicrophone::new()),
            output: Arc::new(ManualSpeaker::new()),
            state: SessionState::Idle,
            last_error: None,
            config: None,
            resources: Resources::default(),
            status_tx,
            span: Span::none(),
        };

        let late = endpoint.connect(&SessionConfig::default()).await;
        actor.on_connected(Ok(late));

        assert_eq!(endpoint.closes(), 1);
        assert!(actor.resources.session.is_none());
        assert!(actor.resources.server_events.is_none());
        assert_eq!(actor.state, SessionState::Idle);
    }
}
