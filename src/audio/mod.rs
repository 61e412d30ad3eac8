//! Audio capture and analysis module

pub mod assembler;
pub mod capture;
pub mod fft;
pub mod filter;
pub mod replay;
pub mod ring;
mod sources;

pub use assembler::{AnalysisFrame, FrameAssembler};
pub use capture::{
    AudioSource, SourceError, SourceEvents, SourceKind, SourceRequest, StreamFormat, OPEN_TIMEOUT,
};
pub use fft::{FeatureExtractor, FeatureVector};
pub use replay::ReplaySource;
pub use ring::{pcm_ring, PcmConsumer, PcmProducer};
pub use sources::{list_input_devices, InputDevice};

/// Analysis frame size F
pub const FRAME_SIZE: usize = 1024;

/// Hop H between consecutive frames
pub const HOP_SIZE: usize = FRAME_SIZE / 4;

/// Number of log-spaced bands B
pub const BAND_COUNT: usize = 24;

/// Lowest band edge in Hz
pub const MIN_BAND_HZ: f32 = 40.0;

/// Highest band edge in Hz (capped by Nyquist)
pub const MAX_BAND_HZ: f32 = 16_000.0;

/// Floor of every dB value the analysis produces
pub const DB_FLOOR: f32 = -80.0;

/// Audio analysis configuration
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Interleaved channels delivered by the source
    pub channels: u16,

    /// Analysis window size
    pub frame_size: usize,

    /// New samples per frame
    pub hop_size: usize,

    /// Number of log-spaced bands
    pub band_count: usize,

    /// Loudness attack time constant (seconds)
    pub loudness_attack: f32,

    /// Loudness release time constant (seconds)
    pub loudness_release: f32,

    /// Onset threshold in running standard deviations above the mean
    pub onset_k: f32,

    /// Minimum time between onsets (seconds)
    pub onset_refractory: f32,

    /// Rise factor of the band smoothing filter
    pub band_rise: f32,

    /// Decay factor of the band smoothing filter
    pub band_decay: f32,
}

impl AnalysisConfig {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            ..Default::default()
        }
    }

    /// Seconds between consecutive frames
    pub fn hop_seconds(&self) -> f32 {
        self.hop_size as f32 / self.sample_rate.max(1) as f32
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_size: FRAME_SIZE,
            hop_size: HOP_SIZE,
            band_count: BAND_COUNT,
            loudness_attack: 0.010,
            loudness_release: 0.250,
            onset_k: 1.5,
            onset_refractory: 0.060,
            band_rise: 0.90,
            band_decay: 0.70,
        }
    }
}
