//! Microphone capture and the capture-to-network pipeline.
//!
//! The device callback only assembles fixed-size frames, encodes them and
//! drops them into a single-slot handoff. A tokio task drains that slot onto
//! the network. When the network falls behind, the slot keeps only the newest
//! frame: stale conversational audio has no value, so bounded latency wins
//! over completeness. Every drop is counted and logged as a capture overrun.

use crate::audio::device::{AudioFrame, FrameSink, InputDevice, InputStream, wait_blocking};
use crate::audio::pcm::PcmBlob;
use crate::config::AudioConfig;
use crate::error::{LiveError, Result};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Destination for encoded capture frames.
#[async_trait]
pub trait AudioSender: Send + Sync {
    /// Send one encoded frame. May wait while the transport is not ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is gone.
    async fn send_audio(&self, blob: PcmBlob) -> Result<()>;
}

/// Counters for one capture run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames accepted by the sender.
    pub frames_sent: u64,
    /// Frames replaced in the handoff before they could be sent.
    pub frames_dropped: u64,
}

/// Single-slot handoff between the device callback and the send task.
#[derive(Default)]
struct FrameSlot {
    pending: Mutex<Option<PcmBlob>>,
    ready: Notify,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl FrameSlot {
    /// Store `blob`, replacing any frame not yet taken.
    ///
    /// Returns the running drop count when a frame was replaced.
    fn put(&self, blob: PcmBlob) -> Option<u64> {
        let replaced = {
            let mut pending = match self.pending.lock() {
                Ok(p) => p,
                Err(p) => p.into_inner(),
            };
            pending.replace(blob).is_some()
        };
        self.ready.notify_one();
        replaced.then(|| self.dropped.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn take(&self) -> Option<PcmBlob> {
        match self.pending.lock() {
            Ok(mut p) => p.take(),
            Err(p) => p.into_inner().take(),
        }
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_sent: self.sent.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// A running capture: open microphone plus the task draining frames to the network.
pub struct CapturePipeline {
    stream: Option<Box<dyn InputStream>>,
    slot: Arc<FrameSlot>,
    cancel: CancellationToken,
}

impl CapturePipeline {
    /// Open the microphone and start streaming encoded frames to `sender`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the microphone cannot be opened.
    pub fn start(
        device: &dyn InputDevice,
        config: &AudioConfig,
        sender: Arc<dyn AudioSender>,
    ) -> Result<Self> {
        let slot = Arc::new(FrameSlot::default());
        let cancel = CancellationToken::new();

        let sink_slot = Arc::clone(&slot);
        let sink: FrameSink = Box::new(move |frame: AudioFrame| {
            let blob = PcmBlob::from_samples(&frame.samples, frame.sample_rate);
            if let Some(dropped) = sink_slot.put(blob) {
                warn!(error = %LiveError::CaptureOverrun { dropped }, "send path behind, dropped oldest frame");
            }
        });

        let stream = device.open(config.input_sample_rate, config.frame_size, sink)?;

        tokio::spawn(run_sender(
            Arc::clone(&slot),
            sender,
            cancel.clone(),
        ));

        info!(
            rate = config.input_sample_rate,
            frame_size = config.frame_size,
            "capture pipeline started"
        );

        Ok(Self {
            stream: Some(stream),
            slot,
            cancel,
        })
    }

    /// Whether the microphone is still held.
    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Counters for this run.
    pub fn stats(&self) -> CaptureStats {
        self.slot.stats()
    }

    /// Release the microphone and stop the send task. Idempotent.
    ///
    /// Does not wait for an in-flight send; it fails or completes on its own.
    ///
    /// # Errors
    ///
    /// Returns the device's close error. The handle is released regardless.
    pub fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let result = stream.close();
        // Anything left in the slot is stale once the microphone is gone.
        let _ = self.slot.take();
        let stats = self.slot.stats();
        info!(
            sent = stats.frames_sent,
            dropped = stats.frames_dropped,
            "capture pipeline stopped"
        );
        result
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("capture close on drop failed: {e}");
        }
    }
}

async fn run_sender(slot: Arc<FrameSlot>, sender: Arc<dyn AudioSender>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = slot.ready.notified() => {
                while let Some(blob) = slot.take() {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        sent = sender.send_audio(blob) => match sent {
                            Ok(()) => {
                                slot.sent.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => debug!("capture frame not sent: {e}"),
                        }
                    }
                }
            }
        }
    }
    debug!("capture sender exited");
}

/// Builds fixed-size mono frames at the target rate from raw device buffers.
struct FrameAssembler {
    native_channels: u16,
    target_rate: u32,
    frame_size: usize,
    resampler: LinearResampler,
    pending: Vec<f32>,
    sink: FrameSink,
}

impl FrameAssembler {
    fn new(
        native_rate: u32,
        native_channels: u16,
        target_rate: u32,
        frame_size: usize,
        sink: FrameSink,
    ) -> Self {
        Self {
            native_channels,
            target_rate,
            frame_size,
            resampler: LinearResampler::new(native_rate, target_rate),
            pending: Vec::with_capacity(frame_size * 2),
            sink,
        }
    }

    fn push(&mut self, data: &[f32]) {
        let mono = if self.native_channels > 1 {
            to_mono(data, self.native_channels)
        } else {
            data.to_vec()
        };
        let samples = self.resampler.process(&mono);
        self.pending.extend_from_slice(&samples);

        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            let samples = std::mem::replace(&mut self.pending, rest);
            (self.sink)(AudioFrame {
                samples,
                sample_rate: self.target_rate,
            });
        }
    }
}

/// Microphone backed by cpal.
///
/// The cpal stream lives on a dedicated thread for its whole lifetime; the
/// returned handle only signals that thread.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    /// Use the named input device, or the system default for `None`.
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
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

impl InputDevice for CpalMicrophone {
    fn open(
        &self,
        sample_rate: u32,
        frame_size: usize,
        sink: FrameSink,
    ) -> Result<Box<dyn InputStream>> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("aura-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(device_name.as_deref(), sample_rate, frame_size, sink) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns on an explicit stop or when the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                info!("audio capture stopped");
            })
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot spawn capture thread: {e}")))?;

        match wait_blocking(|| ready_rx.recv()) {
            Ok(Ok(())) => Ok(Box::new(CpalInputStream {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = wait_blocking(|| thread.join());
                Err(e)
            }
            Err(_) => Err(LiveError::DeviceUnavailable(
                "capture thread exited during open".into(),
            )),
        }
    }
}

struct CpalInputStream {
    stop_tx: Option<crossbeam_channel::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InputStream for CpalInputStream {
    fn close(&mut self) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(thread) => wait_blocking(|| thread.join())
                .map_err(|_| LiveError::DeviceUnavailable("capture thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn build_input_stream(
    device_name: Option<&str>,
    target_rate: u32,
    frame_size: usize,
    sink: FrameSink,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| LiveError::DeviceUnavailable(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| LiveError::DeviceUnavailable("no default input device".into()))?
    };

    let name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using input device: {name}");

    let default_config = device
        .default_input_config()
        .map_err(|e| LiveError::DeviceUnavailable(format!("no default input config: {e}")))?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();

    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let mut assembler =
        FrameAssembler::new(native_rate, native_channels, target_rate, frame_size, sink);

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| assembler.push(data),
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| LiveError::DeviceUnavailable(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| LiveError::DeviceUnavailable(format!("failed to start input stream: {e}")))?;

    info!(
        "audio capture started: native {}Hz x{} -> {}Hz mono, {} samples/frame",
        native_rate, native_channels, target_rate, frame_size
    );
    Ok(stream)
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation rate converter for a continuous stream.
///
/// The read position and the last input sample carry over between calls, so
/// device buffer boundaries neither drop phase nor break the waveform.
struct LinearResampler {
    /// Source samples per output sample.
    step: f64,
    /// Source position of the next output. Index 0 is `prev` when present.
    pos: f64,
    prev: Option<f32>,
}

impl LinearResampler {
    fn new(src_rate: u32, dst_rate: u32) -> Self {
        let step = if src_rate == 0 || dst_rate == 0 {
            1.0
        } else {
            f64::from(src_rate) / f64::from(dst_rate)
        };
        Self {
            step,
            pos: 0.0,
            prev: None,
        }
    }

    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if (self.step - 1.0).abs() < f64::EPSILON {
            return input.to_vec();
        }
        let Some(&last) = input.last() else {
            return Vec::new();
        };

        let offset = usize::from(self.prev.is_some());
        let prev = self.prev.unwrap_or(0.0);
        let len = input.len() + offset;
        let at = |i: usize| if i < offset { prev } else { input[i - offset] };

        let mut output = Vec::with_capacity((len as f64 / self.step) as usize + 1);
        loop {
            let idx = self.pos as usize;
            if idx + 1 >= len {
                break;
            }
            let frac = self.pos - idx as f64;
            let sample = f64::from(at(idx)) * (1.0 - frac) + f64::from(at(idx + 1)) * frac;
            output.push(sample as f32);
            self.pos += self.step;
        }

        // Re-base so index 0 is the last sample of this buffer.
        self.pos -= (len - 1) as f64;
        self.prev = Some(last);
        output
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::time::Duration;

    fn collecting_sink() -> (FrameSink, Arc<Mutex<Vec<AudioFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&frames);
        let sink: FrameSink = Box::new(move |f| out.lock().unwrap().push(f));
        (sink, frames)
    }

    #[test]
    fn assembler_emits_fixed_size_frames_in_order() {
        let (sink, frames) = collecting_sink();
        let mut asm = FrameAssembler::new(16_000, 1, 16_000, 4, sink);
        asm.push(&[0.1, 0.2, 0.3]);
        assert!(frames.lock().unwrap().is_empty());
        asm.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[1].samples, vec![0.5, 0.6, 0.7, 0.8]);
        assert_eq!(asm.pending, vec![0.9]);
    }

    #[test]
    fn assembler_downmixes_and_resamples() {
        let (sink, frames) = collecting_sink();
        let mut asm = FrameAssembler::new(48_000, 2, 16_000, 2, sink);
        // 6 stereo frames at 48k -> 6 mono -> 2 samples at 16k
        asm.push(&[1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sample_rate, 16_000);
        for s in &frames[0].samples {
            assert!((s - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(LinearResampler::new(16_000, 16_000).process(&input), input);
    }

    #[test]
    fn resample_halves_length() {
        let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
        assert_eq!(LinearResampler::new(32_000, 16_000).process(&input).len(), 50);
    }

    #[test]
    fn resample_keeps_phase_across_device_buffers() {
        // 94 callbacks of 512 frames at 48 kHz.
        let mut chunked = LinearResampler::new(48_000, 16_000);
        let total: usize = (0..94).map(|_| chunked.process(&[0.25; 512]).len()).sum();
        let expected = 94.0 * 512.0 / 3.0;
        assert!(
            (total as f64 - expected).abs() <= 1.0,
            "got {total}, expected about {expected}"
        );
    }

    #[test]
    fn assembler_stream_is_continuous_over_uneven_callbacks() {
        let (sink, frames) = collecting_sink();
        let mut asm = FrameAssembler::new(44_100, 1, 16_000, 160, sink);

        // A ramp survives linear interpolation exactly, so any phase slip
        // at a buffer boundary shows up as a deviation.
        let slope = 1e-5f32;
        let ramp: Vec<f32> = (0..44_100).map(|i| i as f32 * slope).collect();
        let sizes = [441, 512, 97, 1024, 300];
        let mut offset = 0;
        let mut i = 0;
        while offset < ramp.len() {
            let n = sizes[i % sizes.len()].min(ramp.len() - offset);
            asm.push(&ramp[offset..offset + n]);
            offset += n;
            i += 1;
        }

        let mut out: Vec<f32> = frames
            .lock()
            .unwrap()
            .iter()
            .flat_map(|f| f.samples.iter().copied())
            .collect();
        out.extend_from_slice(&asm.pending);

        let step = 44_100.0 / 16_000.0;
        let expected = 44_100.0 / step;
        assert!((out.len() as f64 - expected).abs() <= 1.0, "len {}", out.len());
        for (k, s) in out.iter().enumerate() {
            let want = (k as f64 * step) as f32 * slope;
            assert!((s - want).abs() < 1e-4, "sample {k}: {s} vs {want}");
        }
    }

    #[test]
    fn slot_keeps_newest_and_counts_drops() {
        let slot = FrameSlot::default();
        assert_eq!(slot.put(PcmBlob::from_samples(&[0.1], 16_000)), None);
        assert_eq!(slot.put(PcmBlob::from_samples(&[0.2], 16_000)), Some(1));
        assert_eq!(slot.put(PcmBlob::from_samples(&[0.3], 16_000)), Some(2));
        let kept = slot.take().unwrap();
        assert_eq!(kept, PcmBlob::from_samples(&[0.3], 16_000));
        assert!(slot.take().is_none());
        assert_eq!(slot.stats().frames_dropped, 2);
    }

    struct RecordingSender {
        sent: Mutex<Vec<PcmBlob>>,
    }

    #[async_trait]
    impl AudioSender for RecordingSender {
        async fn send_audio(&self, blob: PcmBlob) -> Result<()> {
            self.sent.lock().unwrap().push(blob);
            Ok(())
        }
    }

    #[tokio::test]
    async fn sender_drains_slot_in_order() {
        let slot = Arc::new(FrameSlot::default());
        let sender = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sender(
            Arc::clone(&slot),
            sender.clone(),
            cancel.clone(),
        ));

        for i in 0..3 {
            slot.put(PcmBlob::from_samples(&[i as f32 / 10.0], 16_000));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2], PcmBlob::from_samples(&[0.2], 16_000));
        assert_eq!(slot.stats().frames_sent, 3);
    }
}
