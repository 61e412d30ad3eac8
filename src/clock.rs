//! Monotonic nanosecond clock shared by the capture and worker threads

use std::time::Instant;

/// Monotonic clock anchored at engine start.
///
/// Timestamps are plain `u64` nanoseconds so they can be published through
/// atomics from the audio callback.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds since the clock was created
    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
