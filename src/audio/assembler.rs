//! Frame assembler: turns the PCM ring into overlapping analysis frames

use super::{AnalysisConfig, PcmConsumer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Extra wait on top of the expected arrival time of the next hop
const ARRIVAL_SLACK: Duration = Duration::from_millis(1);

/// Longest single sleep, so stop requests are seen within one tick
const MAX_WAIT: Duration = Duration::from_millis(10);

/// One analysis frame, borrowed from the assembler's scratch buffers
#[derive(Debug)]
pub struct AnalysisFrame<'a> {
    /// Mono samples before windowing (F samples, oldest first)
    pub raw: &'a [f32],

    /// `raw` multiplied by the Hann envelope
    pub windowed: &'a [f32],

    /// Clock time when the oldest sample in the frame entered the ring
    pub timestamp_ns: u64,

    /// Clock time when the newest sample in the frame entered the ring
    pub newest_ns: u64,

    /// Sequence number of this frame
    pub index: u64,
}

/// Hann envelope `w[n] = 0.5 (1 - cos(2 pi n / (F - 1)))`
pub fn hann_window(size: usize) -> Vec<f32> {
    if size < 2 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|i| {
            0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
        })
        .collect()
}

/// Pulls hops of H samples from the ring and emits frames of F samples
pub struct FrameAssembler {
    consumer: PcmConsumer,
    frame_size: usize,
    hop_size: usize,
    channels: usize,
    samples_per_sec: f64,
    window: Vec<f32>,
    hop: Vec<f32>,
    history: Vec<f32>,
    windowed: Vec<f32>,
    filled: usize,
    frames: u64,
    underruns: u64,
}

impl FrameAssembler {
    pub fn new(consumer: PcmConsumer, config: &AnalysisConfig) -> Self {
        let channels = config.channels.max(1) as usize;
        Self {
            consumer,
            frame_size: config.frame_size,
            hop_size: config.hop_size,
            channels,
            samples_per_sec: config.sample_rate as f64 * channels as f64,
            window: hann_window(config.frame_size),
            hop: vec![0.0; config.hop_size * channels],
            history: vec![0.0; config.frame_size],
            windowed: vec![0.0; config.frame_size],
            filled: 0,
            frames: 0,
            underruns: 0,
        }
    }

    /// Emit the next frame if a full hop is already buffered
    pub fn try_next(&mut self) -> Option<AnalysisFrame<'_>> {
        while self.pull_hop() {
            if self.filled >= self.frame_size {
                return Some(self.emit());
            }
        }
        None
    }

    /// Emit the next frame, sleeping until the expected arrival of the
    /// missing samples when the ring runs dry.
    ///
    /// Returns `None` on underrun (data still missing after the wait) or
    /// when `stop` is raised, so the caller can re-check its own state.
    pub fn next_frame(&mut self, stop: &AtomicBool) -> Option<AnalysisFrame<'_>> {
        let mut waited = false;
        loop {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            if self.pull_hop() {
                if self.filled >= self.frame_size {
                    return Some(self.emit());
                }
                continue;
            }
            if waited {
                self.underruns += 1;
                return None;
            }
            std::thread::sleep(self.expected_wait());
            waited = true;
        }
    }

    /// How long until the rest of the next hop should have arrived
    fn expected_wait(&self) -> Duration {
        let missing = self.hop.len().saturating_sub(self.consumer.available());
        let secs = missing as f64 / self.samples_per_sec.max(1.0);
        (Duration::from_secs_f64(secs) + ARRIVAL_SLACK).min(MAX_WAIT)
    }

    /// Read one hop, downmix it and slide it into the history
    fn pull_hop(&mut self) -> bool {
        let needed = self.hop.len();
        if self.consumer.read_into(&mut self.hop, needed) == 0 {
            return false;
        }

        let hop_size = self.hop_size;
        self.history.copy_within(hop_size.., 0);
        let tail = &mut self.history[self.frame_size - hop_size..];
        match self.channels {
            1 => tail.copy_from_slice(&self.hop),
            2 => {
                for (out, pair) in tail.iter_mut().zip(self.hop.chunks_exact(2)) {
                    *out = (pair[0] + pair[1]) * 0.5;
                }
            }
            n => {
                let scale = 1.0 / n as f32;
                for (out, group) in tail.iter_mut().zip(self.hop.chunks_exact(n)) {
                    *out = group.iter().sum::<f32>() * scale;
                }
            }
        }
        self.filled = (self.filled + hop_size).min(self.frame_size);
        true
    }

    fn emit(&mut self) -> AnalysisFrame<'_> {
        for ((out, &s), &w) in self
            .windowed
            .iter_mut()
            .zip(self.history.iter())
            .zip(self.window.iter())
        {
            *out = s * w;
        }

        let end = self.consumer.position();
        let span = self.frame_size * self.channels;
        let oldest = end.wrapping_sub(span);
        let newest = end.wrapping_sub(1);
        let timestamp_ns = self
            .consumer
            .arrival_ns(oldest, self.samples_per_sec)
            .unwrap_or(0);
        let newest_ns = self
            .consumer
            .arrival_ns(newest, self.samples_per_sec)
            .unwrap_or(timestamp_ns);

        let index = self.frames;
        self.frames += 1;

        AnalysisFrame {
            raw: &self.history,
            windowed: &self.windowed,
            timestamp_ns,
            newest_ns,
            index,
        }
    }

    /// Drop buffered audio and start filling a fresh window
    pub fn reset(&mut self) {
        self.consumer.skip_all();
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.filled = 0;
    }

    /// Hops that could not be served after waiting
    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    /// Samples dropped by the producer side
    pub fn overruns(&self) -> u64 {
        self.consumer.overruns()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm_ring;
    use proptest::prelude::*;

    fn small_config(channels: u16) -> AnalysisConfig {
        AnalysisConfig {
            frame_size: 16,
            hop_size: 4,
            channels,
            ..AnalysisConfig::default()
        }
    }

    #[test]
    fn hann_window_is_zero_at_edges_and_one_in_middle() {
        let window = hann_window(1025);
        assert!(window[0].abs() < 1e-6);
        assert!(window[1024].abs() < 1e-6);
        assert!((window[512] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn no_frame_until_a_full_window_is_buffered() {
        let (mut producer, consumer) = pcm_ring(256);
        let mut assembler = FrameAssembler::new(consumer, &small_config(1));

        producer.write(&[0.5; 12]);
        assert!(assembler.try_next().is_none());

        producer.write(&[0.5; 4]);
        let frame = assembler.try_next().expect("frame after 16 samples");
        assert_eq!(frame.raw.len(), 16);
        assert_eq!(frame.index, 0);
        assert!(assembler.try_next().is_none());
    }

    #[test]
    fn consecutive_frames_overlap_by_frame_minus_hop() {
        let (mut producer, consumer) = pcm_ring(256);
        let mut assembler = FrameAssembler::new(consumer, &small_config(1));
        let samples: Vec<f32> = (0..20).map(|i| i as f32).collect();
        producer.write(&samples);

        let first = assembler.try_next().unwrap().raw.to_vec();
        let second = assembler.try_next().unwrap().raw.to_vec();
        assert_eq!(&first[4..], &second[..12]);
        assert_eq!(second[15], 19.0);
    }

    #[test]
    fn stereo_is_summed_and_halved() {
        let (mut producer, consumer) = pcm_ring(256);
        let mut assembler = FrameAssembler::new(consumer, &small_config(2));
        let interleaved: Vec<f32> = (0..16).flat_map(|_| [1.0, 0.0]).collect();
        producer.write(&interleaved);

        let frame = assembler.try_next().unwrap();
        assert!(frame.raw.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn windowed_frame_applies_hann() {
        let (mut producer, consumer) = pcm_ring(256);
        let mut assembler = FrameAssembler::new(consumer, &small_config(1));
        producer.write(&[1.0; 16]);

        let frame = assembler.try_next().unwrap();
        let window = hann_window(16);
        for (w, expected) in frame.windowed.iter().zip(window) {
            assert!((w - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn next_frame_counts_underrun_when_ring_stays_empty() {
        let (_producer, consumer) = pcm_ring(256);
        let mut assembler = FrameAssembler::new(consumer, &AnalysisConfig::default());
        let stop = AtomicBool::new(false);

        assert!(assembler.next_frame(&stop).is_none());
        assert_eq!(assembler.underruns(), 1);
    }

    #[test]
    fn next_frame_returns_immediately_when_stopped() {
        let (_producer, consumer) = pcm_ring(256);
        let mut assembler = FrameAssembler::new(consumer, &AnalysisConfig::default());
        let stop = AtomicBool::new(true);

        assert!(assembler.next_frame(&stop).is_none());
        assert_eq!(assembler.underruns(), 0);
    }

    #[test]
    fn frame_timestamps_follow_arrival_order() {
        let (mut producer, consumer) = pcm_ring(4096);
        let config = small_config(1);
        let mut assembler = FrameAssembler::new(consumer, &config);

        producer.write(&[0.0; 16]);
        producer.stamp(1_000_000_000);
        let frame = assembler.try_next().unwrap();
        assert!(frame.timestamp_ns < frame.newest_ns);
        let expected = 1_000_000_000i64 - (1e9 / 48_000.0) as i64;
        assert!((frame.newest_ns as i64 - expected).abs() <= 1);
    }

    #[test]
    fn reset_discards_history() {
        let (mut producer, consumer) = pcm_ring(256);
        let mut assembler = FrameAssembler::new(consumer, &small_config(1));
        producer.write(&[1.0; 24]);
        assembler.reset();
        assert!(assembler.try_next().is_none());

        producer.write(&[0.25; 16]);
        let frame = assembler.try_next().unwrap();
        assert!(frame.raw.iter().all(|&s| s == 0.25));
    }

    proptest! {
        #[test]
        fn un_overlapped_frames_reproduce_the_input(
            samples in proptest::collection::vec(-1.0f32..1.0, 16..400),
            burst in 1usize..64,
        ) {
            let (mut producer, consumer) = pcm_ring(127);
            let config = small_config(1);
            let mut assembler = FrameAssembler::new(consumer, &config);

            let mut accepted = Vec::new();
            let mut rebuilt = Vec::new();
            let mut overruns_before = 0;
            for chunk in samples.chunks(burst) {
                let n = producer.write(chunk);
                accepted.extend_from_slice(&chunk[..n]);
                prop_assert_eq!(producer.overruns() - overruns_before, (chunk.len() - n) as u64);
                overruns_before = producer.overruns();

                while let Some(frame) = assembler.try_next() {
                    if frame.index == 0 {
                        rebuilt.extend_from_slice(frame.raw);
                    } else {
                        rebuilt.extend_from_slice(&frame.raw[12..]);
                    }
                }
            }

            // Everything not yet emitted is still waiting for a full hop
            let emitted = rebuilt.len();
            prop_assert_eq!(&rebuilt[..], &accepted[..emitted]);
            prop_assert_eq!(
                accepted.len() as u64 + producer.overruns(),
                samples.len() as u64
            );
        }
    }
}
