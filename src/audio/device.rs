//! Boundary traits for the microphone and speaker.
//!
//! The session controller only talks to devices through these traits, so the
//! cpal backends and the in-memory test doubles are interchangeable.

use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A position on an output device clock, in sample frames since the stream opened.
pub type ClockTime = u64;

/// Convert a frame count at `sample_rate` into a [`Duration`].
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = u128::from(frames) * 1_000_000_000 / u128::from(sample_rate);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Run `f`, which parks the calling thread on a device thread handshake.
///
/// On a multi-threaded tokio worker the worker's queued tasks move to another
/// thread first, so the rest of the session keeps running. Elsewhere `f` runs
/// inline.
pub(crate) fn wait_blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// A fixed-size block of mono samples from the microphone.
///
/// Ownership moves downstream; frames are never shared.
#[derive(Debug)]
pub struct AudioFrame {
    /// Normalized samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/// Callback invoked on the device thread for every completed frame.
///
/// Must not block.
pub type FrameSink = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// A microphone that can be opened at a given rate.
pub trait InputDevice: Send + Sync {
    /// Open the device and start delivering `frame_size`-sample frames to `sink`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the device cannot be acquired.
    fn open(
        &self,
        sample_rate: u32,
        frame_size: usize,
        sink: FrameSink,
    ) -> Result<Box<dyn InputStream>>;
}

/// An open microphone stream.
pub trait InputStream: Send {
    /// Stop delivering frames and release the device. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the device reported a failure while closing; the
    /// handle is released either way.
    fn close(&mut self) -> Result<()>;
}

/// Identifier of one scheduled playback source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

/// Notifications raised by the output device's own clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    /// The source rendered its final sample.
    Ended(SourceId),
}

/// A speaker that can be opened at a given rate.
pub trait OutputDevice: Send + Sync {
    /// Open the device. Completion notifications are sent on `events`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if the device cannot be acquired.
    fn open(
        &self,
        sample_rate: u32,
        events: mpsc::UnboundedSender<SourceEvent>,
    ) -> Result<Box<dyn OutputStream>>;
}

/// An open speaker stream with its monotonic clock.
pub trait OutputStream: Send {
    /// Sample rate of the stream in Hz.
    fn sample_rate(&self) -> u32;

    /// Current position of the output clock.
    fn now(&self) -> ClockTime;

    /// Play `samples` starting at clock position `start_at`, returning the
    /// position the source will actually start at.
    ///
    /// A start already behind the clock is moved to the clock's current
    /// position; the clamp and the registration happen atomically with
    /// respect to the device clock. `SourceEvent::Ended(id)` is sent once the
    /// last sample has been rendered.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is closed.
    fn schedule(
        &mut self,
        id: SourceId,
        samples: Arc<[f32]>,
        start_at: ClockTime,
    ) -> Result<ClockTime>;

    /// Silence a source immediately. No `Ended` event follows. Unknown ids are ignored.
    fn stop(&mut self, id: SourceId);

    /// Release the device. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the device reported a failure while closing; the
    /// handle is released either way.
    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_convert_to_duration() {
        assert_eq!(frames_to_duration(24_000, 24_000), Duration::from_secs(1));
        assert_eq!(frames_to_duration(7_200, 24_000), Duration::from_millis(300));
        assert_eq!(frames_to_duration(10, 0), Duration::ZERO);
    }

    #[test]
    fn wait_blocking_outside_a_runtime_runs_inline() {
        assert_eq!(wait_blocking(|| 5), 5);
    }

    #[tokio::test]
    async fn wait_blocking_on_current_thread_runs_inline() {
        assert_eq!(wait_blocking(|| 5), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn wait_blocking_lets_the_only_worker_keep_serving_tasks() {
        let got = tokio::spawn(async {
            let (tx, rx) = std::sync::mpsc::channel();
            // Queued on this worker; it only runs if the worker is freed.
            tokio::spawn(async move {
                let _ = tx.send(7);
            });
            wait_blocking(|| rx.recv_timeout(Duration::from_secs(2)))
        })
        .await
        .unwrap();
        assert_eq!(got.unwrap(), 7);
    }
}
