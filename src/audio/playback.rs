//! Gapless playback of streamed reply audio.
//!
//! [`PlaybackScheduler`] owns the output stream, the timeline cursor and the
//! set of active sources. Chunks are laid back to back on the device clock in
//! arrival order; [`PlaybackScheduler::flush`] silences everything at once for
//! barge-in.

use crate::audio::device::{
    ClockTime, OutputDevice, OutputStream, SourceEvent, SourceId, frames_to_duration,
    wait_blocking,
};
use crate::audio::pcm::AudioBuffer;
use crate::error::{LiveError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Placement of one source on the output clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSource {
    /// Source identifier, echoed back in `SourceEvent::Ended`.
    pub id: SourceId,
    /// First frame.
    pub start: ClockTime,
    /// One past the last frame.
    pub end: ClockTime,
}

/// Result of a source completing naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Other sources are still playing or queued.
    Pending,
    /// The last active source finished.
    Drained,
    /// The source was not active (already flushed or never scheduled).
    Stale,
}

/// Timeline scheduler over one open output stream.
pub struct PlaybackScheduler {
    output: Box<dyn OutputStream>,
    next_start: ClockTime,
    active: BTreeMap<SourceId, ScheduledSource>,
    next_id: u64,
}

impl PlaybackScheduler {
    /// Open `device` at `sample_rate` and wrap it in a fresh scheduler.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the speaker cannot be opened.
    pub fn open(
        device: &dyn OutputDevice,
        sample_rate: u32,
        events: mpsc::UnboundedSender<SourceEvent>,
    ) -> Result<Self> {
        Ok(Self::new(device.open(sample_rate, events)?))
    }

    /// Wrap an already open stream.
    pub fn new(output: Box<dyn OutputStream>) -> Self {
        let next_start = output.now();
        Self {
            output,
            next_start,
            active: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Sample rate of the underlying stream.
    pub fn sample_rate(&self) -> u32 {
        self.output.sample_rate()
    }

    /// Current output clock.
    pub fn now(&self) -> ClockTime {
        self.output.now()
    }

    /// Where the next chunk would start if nothing else changes.
    pub fn next_start_time(&self) -> ClockTime {
        self.next_start
    }

    /// Number of sources started and not yet ended.
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Schedule `buffer` right after everything already queued.
    ///
    /// Returns `None` for an empty buffer, which is ignored.
    ///
    /// # Errors
    ///
    /// Returns `MalformedAudioData` if the buffer rate differs from the
    /// stream rate, or the stream's error if it refused the source.
    pub fn enqueue(&mut self, buffer: &AudioBuffer) -> Result<Option<ScheduledSource>> {
        let rate = self.output.sample_rate();
        if buffer.sample_rate() != rate {
            return Err(LiveError::MalformedAudioData(format!(
                "chunk declared {}Hz but output runs at {}Hz",
                buffer.sample_rate(),
                rate
            )));
        }
        if buffer.is_empty() {
            return Ok(None);
        }

        let requested = self.next_start.max(self.output.now());
        let id = SourceId(self.next_id);
        self.next_id += 1;

        // The clock may have moved since `now()`; the stream reports where the
        // source really starts.
        let start = self
            .output
            .schedule(id, Arc::clone(buffer.samples()), requested)?;
        let end = start + buffer.frames();

        let source = ScheduledSource { id, start, end };
        self.active.insert(id, source);
        self.next_start = end;
        debug!(
            source = id.0,
            start,
            duration_ms = frames_to_duration(buffer.frames(), rate).as_millis() as u64,
            active = self.active.len(),
            "scheduled playback source"
        );
        Ok(Some(source))
    }

    /// Record the natural end of a source.
    pub fn complete(&mut self, id: SourceId) -> Completion {
        if self.active.remove(&id).is_none() {
            return Completion::Stale;
        }
        if self.active.is_empty() {
            Completion::Drained
        } else {
            Completion::Pending
        }
    }

    /// Stop every active source immediately and reset the cursor to now.
    ///
    /// Returns how many sources were silenced. Idempotent.
    pub fn flush(&mut self) -> usize {
        let stopped = self.active.len();
        for id in std::mem::take(&mut self.active).into_keys() {
            self.output.stop(id);
        }
        self.next_start = self.output.now();
        if stopped > 0 {
            info!(stopped, "playback flushed");
        }
        stopped
    }

    /// Flush and release the output device.
    ///
    /// # Errors
    ///
    /// Returns the device's close error. The device is released regardless.
    pub fn close(mut self) -> Result<()> {
        self.flush();
        self.output.close()
    }
}

/// A source as seen by the mixer.
struct MixSource {
    id: SourceId,
    start: ClockTime,
    samples: Arc<[f32]>,
}

impl MixSource {
    fn end(&self) -> ClockTime {
        self.start + self.samples.len() as u64
    }
}

/// Renders scheduled sources into device buffers and keeps the output clock.
#[derive(Default)]
struct Mixer {
    position: ClockTime,
    sources: Vec<MixSource>,
}

impl Mixer {
    /// Fill `out` with the mix of all sources overlapping
    /// `[position, position + out.len())`, advance the clock, and return
    /// the ids of sources that have fully played.
    fn render(&mut self, out: &mut [f32]) -> Vec<SourceId> {
        out.fill(0.0);
        let from = self.position;
        let to = from + out.len() as u64;

        for src in &self.sources {
            let (s_start, s_end) = (src.start.max(from), src.end().min(to));
            if s_start >= s_end {
                continue;
            }
            let src_off = (s_start - src.start) as usize;
            let out_off = (s_start - from) as usize;
            let n = (s_end - s_start) as usize;
            for (o, s) in out[out_off..out_off + n]
                .iter_mut()
                .zip(&src.samples[src_off..src_off + n])
            {
                *o += *s;
            }
        }
        for o in out.iter_mut() {
            *o = o.clamp(-1.0, 1.0);
        }

        self.position = to;
        let mut ended = Vec::new();
        self.sources.retain(|s| {
            let done = s.end() <= to;
            if done {
                ended.push(s.id);
            }
            !done
        });
        ended
    }

    /// Register a source; past starts play from the current position.
    /// Returns the effective start.
    fn schedule(&mut self, id: SourceId, samples: Arc<[f32]>, start: ClockTime) -> ClockTime {
        let start = start.max(self.position);
        self.sources.push(MixSource { id, start, samples });
        start
    }

    fn stop(&mut self, id: SourceId) {
        self.sources.retain(|s| s.id != id);
    }
}

fn lock_mixer(mixer: &Mutex<Mixer>) -> std::sync::MutexGuard<'_, Mixer> {
    match mixer.lock() {
        Ok(m) => m,
        Err(p) => p.into_inner(),
    }
}

/// Speaker backed by cpal, mono at the requested rate.
#[derive(Debug, Clone, Default)]
pub struct CpalSpeaker {
    device_name: Option<String>,
}

impl CpalSpeaker {
    /// Use the named output device, or the system default for `None`.
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl OutputDevice for CpalSpeaker {
    fn open(
        &self,
        sample_rate: u32,
        events: mpsc::UnboundedSender<SourceEvent>,
    ) -> Result<Box<dyn OutputStream>> {
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let device_name = self.device_name.clone();
        let thread_mixer = Arc::clone(&mixer);

        let thread = std::thread::Builder::new()
            .name("aura-playback".into())
            .spawn(move || {
                let stream = match build_output_stream(device_name.as_deref(), sample_rate, thread_mixer, events) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
                info!("audio playback stopped");
            })
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot spawn playback thread: {e}")))?;

        match wait_blocking(|| ready_rx.recv()) {
            Ok(Ok(())) => Ok(Box::new(CpalOutputStream {
                sample_rate,
                mixer,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = wait_blocking(|| thread.join());
                Err(e)
            }
            Err(_) => Err(LiveError::DeviceUnavailable(
                "playback thread exited during open".into(),
            )),
        }
    }
}

struct CpalOutputStream {
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    stop_tx: Option<crossbeam_channel::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl OutputStream for CpalOutputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> ClockTime {
        lock_mixer(&self.mixer).position
    }

    fn schedule(
        &mut self,
        id: SourceId,
        samples: Arc<[f32]>,
        start_at: ClockTime,
    ) -> Result<ClockTime> {
        if self.thread.is_none() {
            return Err(LiveError::DeviceUnavailable("output stream is closed".into()));
        }
        Ok(lock_mixer(&self.mixer).schedule(id, samples, start_at))
    }

    fn stop(&mut self, id: SourceId) {
        lock_mixer(&self.mixer).stop(id);
    }

    fn close(&mut self) -> Result<()> {
        lock_mixer(&self.mixer).sources.clear();
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(thread) => wait_blocking(|| thread.join())
                .map_err(|_| LiveError::DeviceUnavailable("playback thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for CpalOutputStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn build_output_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    events: mpsc::UnboundedSender<SourceEvent>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| LiveError::DeviceUnavailable(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| LiveError::DeviceUnavailable("no default output device".into()))?
    };

    let name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {name}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let ended = lock_mixer(&mixer).render(data);
                for id in ended {
                    // Receiver gone means the session is already torn down.
                    let _ = events.send(SourceEvent::Ended(id));
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| LiveError::DeviceUnavailable(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| LiveError::DeviceUnavailable(format!("failed to start output stream: {e}")))?;

    info!("audio playback started at {sample_rate}Hz");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::testing::ManualSpeaker;

    const RATE: u32 = 24_000;

    fn buffer_secs(secs: f64) -> AudioBuffer {
        AudioBuffer::new(vec![0.1; (secs * f64::from(RATE)).round() as usize], RATE)
    }

    fn scheduler() -> (PlaybackScheduler, ManualSpeaker) {
        let speaker = ManualSpeaker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sched = PlaybackScheduler::open(&speaker, RATE, tx).unwrap();
        (sched, speaker)
    }

    #[test]
    fn chunks_are_contiguous() {
        let (mut sched, speaker) = scheduler();
        let a = sched.enqueue(&buffer_secs(0.5)).unwrap().unwrap();
        let b = sched.enqueue(&buffer_secs(0.3)).unwrap().unwrap();
        let c = sched.enqueue(&buffer_secs(0.2)).unwrap().unwrap();

        assert_eq!((a.start, a.end), (0, 12_000));
        assert_eq!((b.start, b.end), (12_000, 19_200));
        assert_eq!((c.start, c.end), (19_200, 24_000));
        assert_eq!(frames_to_duration(c.end - a.start, RATE).as_secs_f64(), 1.0);
        assert_eq!(sched.active_len(), 3);
        assert_eq!(speaker.scheduled().len(), 3);
    }

    #[test]
    fn idle_cursor_is_clamped_to_now() {
        let (mut sched, speaker) = scheduler();
        sched.enqueue(&buffer_secs(0.1)).unwrap();
        speaker.advance(10_000);
        let next = sched.enqueue(&buffer_secs(0.1)).unwrap().unwrap();
        assert_eq!(next.start, 10_000);
    }

    #[test]
    fn flush_empties_set_and_resets_cursor() {
        let (mut sched, speaker) = scheduler();
        sched.enqueue(&buffer_secs(0.5)).unwrap();
        sched.enqueue(&buffer_secs(0.3)).unwrap();
        speaker.advance(15_000);

        assert_eq!(sched.flush(), 2);
        assert_eq!(sched.active_len(), 0);
        assert!(sched.next_start_time() <= sched.now());
        assert_eq!(speaker.stopped().len(), 2);

        let fresh = sched.enqueue(&buffer_secs(0.2)).unwrap().unwrap();
        assert_eq!(fresh.start, 15_000);

        // Second flush with one source, third with none.
        assert_eq!(sched.flush(), 1);
        assert_eq!(sched.flush(), 0);
    }

    #[test]
    fn completion_reports_drain_once() {
        let (mut sched, _speaker) = scheduler();
        let a = sched.enqueue(&buffer_secs(0.1)).unwrap().unwrap();
        let b = sched.enqueue(&buffer_secs(0.1)).unwrap().unwrap();
        assert_eq!(sched.complete(a.id), Completion::Pending);
        assert_eq!(sched.complete(b.id), Completion::Drained);
        assert_eq!(sched.complete(b.id), Completion::Stale);
    }

    #[test]
    fn completion_after_flush_is_stale() {
        let (mut sched, _speaker) = scheduler();
        let a = sched.enqueue(&buffer_secs(0.1)).unwrap().unwrap();
        sched.flush();
        assert_eq!(sched.complete(a.id), Completion::Stale);
    }

    #[test]
    fn rate_mismatch_is_rejected_without_side_effects() {
        let (mut sched, _speaker) = scheduler();
        let wrong = AudioBuffer::new(vec![0.0; 100], 16_000);
        assert!(matches!(
            sched.enqueue(&wrong),
            Err(LiveError::MalformedAudioData(_))
        ));
        assert_eq!(sched.active_len(), 0);
        assert_eq!(sched.next_start_time(), 0);
    }

    #[test]
    fn empty_buffer_is_ignored() {
        let (mut sched, _speaker) = scheduler();
        assert!(sched.enqueue(&AudioBuffer::new(Vec::new(), RATE)).unwrap().is_none());
        assert_eq!(sched.active_len(), 0);
    }

    #[test]
    fn mixer_renders_back_to_back_sources_without_gap() {
        let mut mixer = Mixer::default();
        mixer.schedule(SourceId(0), vec![0.5; 3].into(), 0);
        mixer.schedule(SourceId(1), vec![0.25; 3].into(), 3);

        let mut out = [0.0f32; 4];
        assert_eq!(mixer.render(&mut out), vec![SourceId(0)]);
        assert_eq!(out, [0.5, 0.5, 0.5, 0.25]);

        let mut out = [0.0f32; 4];
        assert_eq!(mixer.render(&mut out), vec![SourceId(1)]);
        assert_eq!(out, [0.25, 0.25, 0.0, 0.0]);
        assert_eq!(mixer.position, 8);
    }

    #[test]
    fn mixer_stop_silences_mid_source() {
        let mut mixer = Mixer::default();
        mixer.schedule(SourceId(7), vec![0.5; 10].into(), 0);
        let mut out = [0.0f32; 4];
        mixer.render(&mut out);
        mixer.stop(SourceId(7));
        let mut out = [1.0f32; 4];
        assert!(mixer.render(&mut out).is_empty());
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn mixer_late_start_plays_from_position() {
        let mut mixer = Mixer::default();
        let mut out = [0.0f32; 4];
        mixer.render(&mut out);
        mixer.schedule(SourceId(1), vec![0.5; 2].into(), 1);
        let mut out = [0.0f32; 4];
        assert_eq!(mixer.render(&mut out), vec![SourceId(1)]);
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0]);
    }

    /// Output stream over a real mixer whose device callback renders a
    /// buffer between the scheduler's clock read and its schedule call.
    struct RacingOutput {
        mixer: Arc<Mutex<Mixer>>,
        burst: usize,
    }

    impl OutputStream for RacingOutput {
        fn sample_rate(&self) -> u32 {
            RATE
        }

        fn now(&self) -> ClockTime {
            lock_mixer(&self.mixer).position
        }

        fn schedule(
            &mut self,
            id: SourceId,
            samples: Arc<[f32]>,
            start_at: ClockTime,
        ) -> Result<ClockTime> {
            let mut mixer = lock_mixer(&self.mixer);
            let mut out = vec![0.0f32; self.burst];
            mixer.render(&mut out);
            Ok(mixer.schedule(id, samples, start_at))
        }

        fn stop(&mut self, id: SourceId) {
            lock_mixer(&self.mixer).stop(id);
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn callback_between_clock_read_and_schedule_never_overlaps() {
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let mut sched = PlaybackScheduler::new(Box::new(RacingOutput {
            mixer: Arc::clone(&mixer),
            burst: 256,
        }));

        let a = sched
            .enqueue(&AudioBuffer::new(vec![0.5; 480], RATE))
            .unwrap()
            .unwrap();
        let b = sched
            .enqueue(&AudioBuffer::new(vec![0.5; 480], RATE))
            .unwrap()
            .unwrap();

        // The first source slipped to where the clock really was.
        assert_eq!((a.start, a.end), (256, 736));
        assert_eq!(b.start, a.end);
        assert_eq!(sched.next_start_time(), b.end);

        let mut out = vec![0.0f32; 1024];
        lock_mixer(&mixer).render(&mut out);
        // Position 512..1536: a covers 512..736, b covers 736..1216.
        assert!(out.iter().all(|&s| s <= 0.5), "sources overlapped");
        assert!(out[..704].iter().all(|&s| s == 0.5), "gap between sources");
        assert!(out[704..].iter().all(|&s| s == 0.0));
    }
}
