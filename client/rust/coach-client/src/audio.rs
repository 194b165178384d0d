//! Audio input devices as seen by the capture controller.

use crate::error::Result;
use tokio::sync::mpsc;

#[cfg(feature = "mic")]
pub mod mic;

/// Mono f32 samples in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate_hz: u32,
}

/// Processing requested from the input device. Devices that cannot honour a
/// flag record without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub sample_rate_hz: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self { echo_cancellation: true, noise_suppression: true, sample_rate_hz: 44_100 }
    }
}

/// A device that was opened for capture.
///
/// `release` stops all device tracks. It is called exactly once, after which
/// `chunks` ends. It may block until the device has stopped.
pub struct OpenedInput {
    pub sample_rate_hz: u32,
    pub chunks: mpsc::Receiver<AudioChunk>,
    pub release: Box<dyn FnOnce() + Send>,
}

impl std::fmt::Debug for OpenedInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedInput").field("sample_rate_hz", &self.sample_rate_hz).finish_non_exhaustive()
    }
}

pub trait AudioInput: Send + 'static {
    /// Requests exclusive access to the device. Failures are `ClientError::Device`.
    fn open(&mut self, constraints: &CaptureConstraints) -> Result<OpenedInput>;
}

/// Averages interleaved frames of `channels` samples into `out`.
pub fn downmix_to_mono_into<T: Copy>(
    data: &[T],
    channels: usize,
    out: &mut Vec<f32>,
    to_f32: impl Fn(T) -> f32,
) {
    out.clear();
    if channels <= 1 {
        out.extend(data.iter().map(|&s| to_f32(s)));
        return;
    }
    out.reserve(data.len() / channels);
    for frame in data.chunks_exact(channels) {
        let sum: f32 = frame.iter().map(|&s| to_f32(s)).sum();
        out.push(sum / channels as f32);
    }
}
