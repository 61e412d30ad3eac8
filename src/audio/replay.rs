//! Replay source: pushes a pre-recorded buffer into the ring at real-time pace

use super::capture::{SourceError, StreamFormat};
use super::ring::PcmProducer;
use crate::clock::Clock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Burst size used when the format leaves it open
pub const DEFAULT_REPLAY_BURST: u32 = 128;

/// Plays interleaved samples from a dedicated thread.
///
/// After the buffer runs out a non-looping replay keeps delivering silence,
/// like a live input with nothing playing.
pub struct ReplaySource {
    samples: Arc<[f32]>,
    format: StreamFormat,
    looping: bool,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReplaySource {
    pub fn new(samples: Vec<f32>, format: StreamFormat, looping: bool) -> Self {
        let format = StreamFormat {
            sample_rate: format.sample_rate.max(1),
            channels: format.channels.max(1),
            frames_per_burst: if format.frames_per_burst == 0 {
                DEFAULT_REPLAY_BURST
            } else {
                format.frames_per_burst
            },
        };
        Self {
            samples: samples.into(),
            format,
            looping,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn start(&mut self, producer: PcmProducer, clock: Clock) -> Result<(), SourceError> {
        if self.thread.is_some() {
            return Err(SourceError::DeviceBusy("replay already started".into()));
        }
        self.stop.store(false, Ordering::Release);

        let player = Player {
            samples: self.samples.clone(),
            format: self.format,
            looping: self.looping,
            stop: self.stop.clone(),
            producer,
            clock,
            position: 0,
        };
        let thread = thread::Builder::new()
            .name("audio-replay".to_string())
            .spawn(move || player.run())?;
        self.thread = Some(thread);

        log::info!(
            "Replay started: {} samples, {} Hz, {} channels, burst {}",
            self.samples.len(),
            self.format.sample_rate,
            self.format.channels,
            self.format.frames_per_burst
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            log::info!("Replay stopped");
        }
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Player {
    samples: Arc<[f32]>,
    format: StreamFormat,
    looping: bool,
    stop: Arc<AtomicBool>,
    producer: PcmProducer,
    clock: Clock,
    position: usize,
}

impl Player {
    fn run(mut self) {
        let frames = self.format.frames_per_burst as usize;
        let burst = frames * self.format.channels as usize;
        let period = Duration::from_secs_f64(frames as f64 / self.format.sample_rate as f64);

        let mut deadline = Instant::now();
        while !self.stop.load(Ordering::Acquire) {
            deadline += period;
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            }
            self.push_burst(burst);
        }
    }

    fn push_burst(&mut self, burst: usize) {
        let mut remaining = burst;
        while remaining > 0 {
            if self.position >= self.samples.len() {
                if self.looping && !self.samples.is_empty() {
                    self.position = 0;
                } else {
                    self.producer.write_silence(remaining);
                    break;
                }
            }
            let n = remaining.min(self.samples.len() - self.position);
            self.producer
                .write(&self.samples[self.position..self.position + n]);
            self.position += n;
            remaining -= n;
        }
        self.producer.stamp(self.clock.now_ns());
    }
}
