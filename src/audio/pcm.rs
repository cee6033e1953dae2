//! Conversion between f32 samples and 16-bit little-endian PCM.
//!
//! No resampling happens here: callers are responsible for matching the
//! declared rate of a payload to the device it is played on.

use crate::error::{LiveError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::Arc;
use std::time::Duration;

/// Full-scale value used for both directions of the conversion.
const FULL_SCALE: f32 = 32767.0;

/// Encode normalized samples as 16-bit little-endian PCM.
///
/// Each sample is clamped to `[-1, 1]`, scaled by 32767 and rounded.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        // NaN saturates to 0 in the float->int cast.
        let v = (s.clamp(-1.0, 1.0) * FULL_SCALE).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode 16-bit little-endian PCM back to normalized samples.
///
/// # Errors
///
/// Returns `MalformedAudioData` for an odd byte count.
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(LiveError::MalformedAudioData(format!(
            "odd PCM byte length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| {
            let v = i16::from_le_bytes([pair[0], pair[1]]);
            // i16::MIN would land just below -1.0.
            (f32::from(v) / FULL_SCALE).max(-1.0)
        })
        .collect())
}

/// MIME descriptor for raw PCM at `rate`.
pub fn mime_type(rate: u32) -> String {
    format!("audio/pcm;rate={rate}")
}

/// Parse the `rate=` parameter out of an `audio/pcm;rate=N` descriptor.
pub fn parse_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|p| p.trim().strip_prefix("rate="))
        .find_map(|r| r.trim().parse().ok())
}

/// One captured frame encoded for the wire.
///
/// Exists only between encode and network send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmBlob {
    /// 16-bit little-endian samples.
    pub data: Vec<u8>,
    /// Sample rate of `data` in Hz.
    pub sample_rate: u32,
}

impl PcmBlob {
    /// Encode a frame of samples captured at `sample_rate`.
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            data: encode(samples),
            sample_rate,
        }
    }

    /// `audio/pcm;rate=N`.
    pub fn mime_type(&self) -> String {
        mime_type(self.sample_rate)
    }

    /// Base64 of the PCM bytes, as carried in JSON messages.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }
}

/// Decoded playback audio: mono f32 samples plus their rate.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Wrap already-decoded samples.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Decode a base64 PCM payload.
    ///
    /// # Errors
    ///
    /// Returns `MalformedAudioData` on invalid base64 or an odd byte count.
    pub fn from_base64(payload: &str, sample_rate: u32) -> Result<Self> {
        let bytes = BASE64
            .decode(payload.trim())
            .map_err(|e| LiveError::MalformedAudioData(format!("invalid base64: {e}")))?;
        Ok(Self::new(decode(&bytes)?, sample_rate))
    }

    /// Shared sample data.
    pub fn samples(&self) -> &Arc<[f32]> {
        &self.samples
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Length in sample frames (mono).
    pub fn frames(&self) -> u64 {
        self.samples.len() as u64
    }

    /// Whether the buffer holds no audio.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration.
    pub fn duration(&self) -> Duration {
        crate::audio::device::frames_to_duration(self.frames(), self.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn round_trip_within_quantization_error() {
        let samples: Vec<f32> = (0..2000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.97)
            .chain([1.0, -1.0, 0.0, 0.5, -0.5, 1e-6])
            .collect();
        let decoded = decode(&encode(&samples)).unwrap();
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(&decoded) {
            assert!((a - b).abs() <= 1.0 / FULL_SCALE, "{a} vs {b}");
        }
    }

    #[test]
    fn encode_clamps_out_of_range() {
        let bytes = encode(&[2.0, -3.5]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -32767);
    }

    #[test]
    fn encode_is_little_endian() {
        // 0.5 * 32767 = 16383.5 -> 16384 = 0x4000
        assert_eq!(encode(&[0.5]), vec![0x00, 0x40]);
    }

    #[test]
    fn decode_rejects_odd_length() {
        assert!(matches!(
            decode(&[0, 1, 2]),
            Err(LiveError::MalformedAudioData(_))
        ));
    }

    #[test]
    fn decode_min_value_stays_in_range() {
        let out = decode(&i16::MIN.to_le_bytes()).unwrap();
        assert_eq!(out, vec![-1.0]);
    }

    #[test]
    fn mime_type_round_trips_rate() {
        assert_eq!(mime_type(16_000), "audio/pcm;rate=16000");
        assert_eq!(parse_rate("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(parse_rate("audio/pcm; rate=8000"), Some(8_000));
        assert_eq!(parse_rate("audio/pcm"), None);
    }

    #[test]
    fn buffer_from_base64_reports_duration() {
        let pcm = encode(&vec![0.25; 12_000]);
        let b64 = BASE64.encode(&pcm);
        let buffer = AudioBuffer::from_base64(&b64, 24_000).unwrap();
        assert_eq!(buffer.frames(), 12_000);
        assert_eq!(buffer.duration(), Duration::from_millis(500));
    }

    #[test]
    fn buffer_from_invalid_base64_is_malformed() {
        assert!(matches!(
            AudioBuffer::from_base64("***", 24_000),
            Err(LiveError::MalformedAudioData(_))
        ));
    }
}
