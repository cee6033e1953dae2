//! Audio capture, playback scheduling, and PCM conversion via cpal.

pub mod capture;
pub mod device;
pub mod pcm;
pub mod playback;
