//! # Audio Capture Buffer
//!
//! Accumulates the raw PCM frames a client sends while the connection is in
//! its listening phase. The buffer is opened with [`CaptureBuffer::start`],
//! fed with [`CaptureBuffer::write`] and drained exactly once with
//! [`CaptureBuffer::stop`].
//!
//! ## Behavior outside the capture phase:
//! Frames written before `start` or after `stop` are dropped without error.
//! Clients commonly keep streaming a few frames after they send the stop
//! message; those frames must not leak into the next utterance.

use tracing::warn;

/// Append-only byte accumulator for one utterance.
#[derive(Debug)]
pub struct CaptureBuffer {
    /// Captured bytes (16-bit LE mono PCM at the declared rate)
    data: Vec<u8>,

    /// Whether writes are currently accepted
    open: bool,

    /// Upper bound on captured bytes; frames beyond it are dropped
    max_bytes: usize,

    /// Set once a frame did not fit; the rest of the capture is dropped
    overflowed: bool,
}

impl CaptureBuffer {
    /// Create a closed, empty buffer holding at most `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            data: Vec::new(),
            open: false,
            max_bytes,
            overflowed: false,
        }
    }

    /// Capacity bound for `seconds` of 16-bit mono audio at `sample_rate`.
    pub fn bound_for(sample_rate: u32, seconds: u32) -> usize {
        bytes_for_duration(sample_rate, seconds.saturating_mul(1000))
    }

    /// Reset to empty and start accepting frames.
    pub fn start(&mut self) {
        self.data.clear();
        self.overflowed = false;
        self.open = true;
    }

    /// Append a frame. No-op while the buffer is closed or after the first
    /// frame that did not fit, so the capture never has gaps.
    pub fn write(&mut self, frame: &[u8]) {
        if !self.open || self.overflowed {
            return;
        }

        let room = self.max_bytes.saturating_sub(self.data.len());
        if frame.len() > room {
            warn!(
                captured_bytes = self.data.len(),
                max_bytes = self.max_bytes,
                "Capture buffer full, dropping further audio"
            );
            self.overflowed = true;
            return;
        }

        self.data.extend_from_slice(frame);
    }

    /// Close the buffer and hand over everything captured since `start`.
    ///
    /// Returns an empty vector when the buffer was not open.
    pub fn stop(&mut self) -> Vec<u8> {
        if !self.open {
            return Vec::new();
        }
        self.open = false;
        std::mem::take(&mut self.data)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Drop any captured audio and close the buffer (connection teardown).
    pub fn release(&mut self) {
        self.open = false;
        self.data = Vec::new();
    }
}

/// Number of bytes `duration_ms` of 16-bit mono PCM occupies at `sample_rate`.
pub fn bytes_for_duration(sample_rate: u32, duration_ms: u32) -> usize {
    (sample_rate as usize * 2 * duration_ms as usize) / 1000
}

/// Whether a capture is long enough to be worth transcribing.
pub fn is_usable_capture(pcm: &[u8], sample_rate: u32, min_duration_ms: u32) -> bool {
    pcm.len() >= bytes_for_duration(sample_rate, min_duration_ms)
}
