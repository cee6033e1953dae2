//! In-memory devices and endpoint for driving a session without hardware or
//! network.
//!
//! Each double is a cheap `Clone` over shared state: hand one clone to the
//! controller and keep the other to script events and inspect effects.

use crate::audio::capture::AudioSender;
use crate::audio::device::{
    AudioFrame, ClockTime, FrameSink, InputDevice, InputStream, OutputDevice, OutputStream,
    SourceEvent, SourceId,
};
use crate::audio::pcm::PcmBlob;
use crate::config::SessionConfig;
use crate::error::{LiveError, Result};
use crate::live::transport::{LiveConnection, LiveEndpoint, LiveSession, ServerEvent};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Speaker
// ---------------------------------------------------------------------------

/// One `schedule` call seen by [`ManualSpeaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledPlay {
    /// Source id.
    pub id: SourceId,
    /// Effective start on the speaker clock.
    pub start: ClockTime,
    /// Length in frames.
    pub frames: u64,
}

#[derive(Default)]
struct SpeakerInner {
    now: ClockTime,
    sample_rate: u32,
    open: bool,
    opens: usize,
    fail_open: bool,
    fail_close: bool,
    lost: bool,
    events: Option<mpsc::UnboundedSender<SourceEvent>>,
    playing: BTreeMap<SourceId, ClockTime>,
    scheduled: Vec<ScheduledPlay>,
    stopped: Vec<SourceId>,
}

/// Speaker whose clock only moves when the test calls [`advance`](Self::advance).
#[derive(Clone, Default)]
pub struct ManualSpeaker {
    inner: Arc<Mutex<SpeakerInner>>,
}

impl ManualSpeaker {
    /// A speaker that opens successfully with its clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A speaker that refuses to open.
    pub fn unavailable() -> Self {
        let speaker = Self::new();
        lock(&speaker.inner).fail_open = true;
        speaker
    }

    /// A speaker whose close reports an error (and still releases).
    pub fn failing_close() -> Self {
        let speaker = Self::new();
        lock(&speaker.inner).fail_close = true;
        speaker
    }

    /// Make every later schedule call fail, as when the output device is unplugged.
    pub fn disconnect(&self) {
        lock(&self.inner).lost = true;
    }

    /// Move the clock forward, ending every source whose last frame is now behind it.
    pub fn advance(&self, frames: u64) {
        let mut inner = lock(&self.inner);
        inner.now += frames;
        let now = inner.now;
        let ended: Vec<SourceId> = inner
            .playing
            .iter()
            .filter(|&(_, &end)| end <= now)
            .map(|(&id, _)| id)
            .collect();
        for id in ended {
            inner.playing.remove(&id);
            if let Some(events) = &inner.events {
                let _ = events.send(SourceEvent::Ended(id));
            }
        }
    }

    /// Current clock position.
    pub fn now(&self) -> ClockTime {
        lock(&self.inner).now
    }

    /// Every schedule call, in order.
    pub fn scheduled(&self) -> Vec<ScheduledPlay> {
        lock(&self.inner).scheduled.clone()
    }

    /// Every stop call, in order.
    pub fn stopped(&self) -> Vec<SourceId> {
        lock(&self.inner).stopped.clone()
    }

    /// Sources currently audible.
    pub fn playing(&self) -> usize {
        lock(&self.inner).playing.len()
    }

    /// Whether a stream is open.
    pub fn is_open(&self) -> bool {
        lock(&self.inner).open
    }

    /// Number of successful opens.
    pub fn opens(&self) -> usize {
        lock(&self.inner).opens
    }
}

impl OutputDevice for ManualSpeaker {
    fn open(
        &self,
        sample_rate: u32,
        events: mpsc::UnboundedSender<SourceEvent>,
    ) -> Result<Box<dyn OutputStream>> {
        let mut inner = lock(&self.inner);
        if inner.fail_open {
            return Err(LiveError::DeviceUnavailable("no output device".into()));
        }
        inner.now = 0;
        inner.sample_rate = sample_rate;
        inner.open = true;
        inner.opens += 1;
        inner.events = Some(events);
        inner.playing.clear();
        Ok(Box::new(ManualOutputStream {
            inner: Arc::clone(&self.inner),
            closed: false,
        }))
    }
}

struct ManualOutputStream {
    inner: Arc<Mutex<SpeakerInner>>,
    closed: bool,
}

impl OutputStream for ManualOutputStream {
    fn sample_rate(&self) -> u32 {
        lock(&self.inner).sample_rate
    }

    fn now(&self) -> ClockTime {
        lock(&self.inner).now
    }

    fn schedule(
        &mut self,
        id: SourceId,
        samples: Arc<[f32]>,
        start_at: ClockTime,
    ) -> Result<ClockTime> {
        if self.closed {
            return Err(LiveError::DeviceUnavailable("speaker closed".into()));
        }
        let mut inner = lock(&self.inner);
        if inner.lost {
            return Err(LiveError::DeviceUnavailable("speaker disconnected".into()));
        }
        let start = start_at.max(inner.now);
        let frames = samples.len() as u64;
        inner.playing.insert(id, start + frames);
        inner.scheduled.push(ScheduledPlay { id, start, frames });
        Ok(start)
    }

    fn stop(&mut self, id: SourceId) {
        let mut inner = lock(&self.inner);
        inner.playing.remove(&id);
        inner.stopped.push(id);
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut inner = lock(&self.inner);
        inner.open = false;
        inner.events = None;
        inner.playing.clear();
        if inner.fail_close {
            return Err(LiveError::DeviceUnavailable("speaker close failed".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MicInner {
    fail_open: bool,
    sink: Option<FrameSink>,
    sample_rate: u32,
    opens: usize,
}

/// Microphone that delivers whatever frames the test pushes.
#[derive(Clone, Default)]
pub struct MockMicrophone {
    inner: Arc<Mutex<MicInner>>,
}

impl MockMicrophone {
    /// A microphone that opens successfully.
    pub fn new() -> Self {
        Self::default()
    }

    /// A microphone that refuses to open, as when permission is denied.
    pub fn unavailable() -> Self {
        let mic = Self::new();
        lock(&mic.inner).fail_open = true;
        mic
    }

    /// Deliver one frame. Returns `false` if the microphone is not open.
    pub fn push_frame(&self, samples: Vec<f32>) -> bool {
        let mut inner = lock(&self.inner);
        let sample_rate = inner.sample_rate;
        match inner.sink.as_mut() {
            Some(sink) => {
                sink(AudioFrame {
                    samples,
                    sample_rate,
                });
                true
            }
            None => false,
        }
    }

    /// Whether a stream is open.
    pub fn is_open(&self) -> bool {
        lock(&self.inner).sink.is_some()
    }

    /// Number of successful opens.
    pub fn opens(&self) -> usize {
        lock(&self.inner).opens
    }
}

impl InputDevice for MockMicrophone {
    fn open(
        &self,
        sample_rate: u32,
        _frame_size: usize,
        sink: FrameSink,
    ) -> Result<Box<dyn InputStream>> {
        let mut inner = lock(&self.inner);
        if inner.fail_open {
            return Err(LiveError::DeviceUnavailable(
                "microphone permission denied".into(),
            ));
        }
        inner.sink = Some(sink);
        inner.sample_rate = sample_rate;
        inner.opens += 1;
        Ok(Box::new(MockInputStream {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockInputStream {
    inner: Arc<Mutex<MicInner>>,
}

impl InputStream for MockInputStream {
    fn close(&mut self) -> Result<()> {
        lock(&self.inner).sink = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EndpointInner {
    fail_with: Option<String>,
    connect_delay: Option<Duration>,
    connects: usize,
    closes: usize,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
    pending: Vec<ServerEvent>,
    sent: Vec<PcmBlob>,
}

struct EndpointShared {
    inner: Mutex<EndpointInner>,
    hold: watch::Sender<bool>,
}

/// Endpoint whose server side is driven by the test.
///
/// Events emitted while no session is connected are delivered to the next one.
#[derive(Clone)]
pub struct ScriptedEndpoint {
    shared: Arc<EndpointShared>,
}

impl Default for ScriptedEndpoint {
    fn default() -> Self {
        Self {
            shared: Arc::new(EndpointShared {
                inner: Mutex::new(EndpointInner::default()),
                hold: watch::Sender::new(false),
            }),
        }
    }
}

impl ScriptedEndpoint {
    /// An endpoint that accepts every connect.
    pub fn new() -> Self {
        Self::default()
    }

    /// An endpoint that rejects every connect with `message`.
    pub fn failing(message: &str) -> Self {
        let endpoint = Self::new();
        lock(&endpoint.shared.inner).fail_with = Some(message.to_owned());
        endpoint
    }

    /// Make every connect take `delay` before resolving.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        lock(&self.shared.inner).connect_delay = Some(delay);
        self
    }

    /// Change how later connects resolve; `None` lets them succeed.
    pub fn set_failure(&self, message: Option<&str>) {
        lock(&self.shared.inner).fail_with = message.map(str::to_owned);
    }

    /// Push a server event to the session.
    pub fn emit(&self, event: ServerEvent) {
        let mut inner = lock(&self.shared.inner);
        match &inner.events {
            Some(events) => {
                let _ = events.send(event);
            }
            None => inner.pending.push(event),
        }
    }

    /// Drop the server side of the event stream without a close message.
    pub fn hang_up(&self) {
        lock(&self.shared.inner).events = None;
    }

    /// Block outbound sends until [`release_sends`](Self::release_sends).
    pub fn hold_sends(&self) {
        self.shared.hold.send_replace(true);
    }

    /// Let blocked sends proceed.
    pub fn release_sends(&self) {
        self.shared.hold.send_replace(false);
    }

    /// Every blob the client sent, in order.
    pub fn sent(&self) -> Vec<PcmBlob> {
        lock(&self.shared.inner).sent.clone()
    }

    /// Connect attempts so far.
    pub fn connects(&self) -> usize {
        lock(&self.shared.inner).connects
    }

    /// Sessions closed by the client.
    pub fn closes(&self) -> usize {
        lock(&self.shared.inner).closes
    }
}

#[async_trait]
impl LiveEndpoint for ScriptedEndpoint {
    async fn connect(&self, _config: &SessionConfig) -> Result<LiveConnection> {
        let delay = {
            let mut inner = lock(&self.shared.inner);
            inner.connects += 1;
            inner.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = lock(&self.shared.inner);
        if let Some(message) = inner.fail_with.clone() {
            return Err(LiveError::ConnectFailed(message));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for event in inner.pending.drain(..) {
            let _ = tx.send(event);
        }
        inner.events = Some(tx);
        drop(inner);

        Ok(LiveConnection {
            session: Arc::new(ScriptedSession {
                shared: Arc::clone(&self.shared),
                closed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}

struct ScriptedSession {
    shared: Arc<EndpointShared>,
    closed: AtomicBool,
}

#[async_trait]
impl AudioSender for ScriptedSession {
    async fn send_audio(&self, blob: PcmBlob) -> Result<()> {
        let mut hold = self.shared.hold.subscribe();
        hold.wait_for(|held| !*held)
            .await
            .map_err(|_| LiveError::Channel("endpoint dropped".into()))?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(LiveError::SessionError("session closed".into()));
        }
        lock(&self.shared.inner).sent.push(blob);
        Ok(())
    }
}

impl LiveSession for ScriptedSession {
    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut inner = lock(&self.shared.inner);
            inner.closes += 1;
            inner.events = None;
            inner.pending.clear();
        }
        Ok(())
    }
}
