//! Feature extraction: spectrum, log-spaced band energies, loudness, onsets

use super::assembler::{hann_window, AnalysisFrame};
use super::filter::{flush_denormal, ExpFilter, ExpFilterBank};
use super::{AnalysisConfig, DB_FLOOR, MAX_BAND_HZ, MIN_BAND_HZ};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Number of past flux values kept for the adaptive onset threshold
const FLUX_HISTORY: usize = 128;

/// Flux (summed dB rise over all bands) below this never counts as an onset
const MIN_ONSET_FLUX: f32 = 6.0;

/// Smallest power fed to log10
const POWER_FLOOR: f32 = 1.0e-12;

/// Features of one analysis frame
#[derive(Debug, Clone)]
pub struct FeatureVector {
    /// Magnitude spectrum, F/2 + 1 bins, normalised so a full-scale sine peaks at 1.0
    pub mag: Vec<f32>,

    /// Band energies in dB, each in [-80, 0]
    pub bands: Vec<f32>,

    /// `bands` passed through the rise/decay smoothing filter
    pub smoothed_bands: Vec<f32>,

    /// Smoothed RMS loudness in dBFS, in [-80, 0]
    pub loudness: f32,

    /// Onset detected on this frame
    pub onset: bool,

    /// Spectral flux that drove the onset decision
    pub flux: f32,

    /// When the oldest sample of the frame entered the ring (clock ns)
    pub timestamp_ns: u64,

    /// When the newest sample of the frame entered the ring (clock ns)
    pub newest_ns: u64,

    /// Frame sequence number
    pub index: u64,
}

impl FeatureVector {
    pub fn new(bins: usize, band_count: usize) -> Self {
        Self {
            mag: vec![0.0; bins],
            bands: vec![DB_FLOOR; band_count],
            smoothed_bands: vec![DB_FLOOR; band_count],
            loudness: DB_FLOOR,
            onset: false,
            flux: 0.0,
            timestamp_ns: 0,
            newest_ns: 0,
            index: 0,
        }
    }

    /// A silent feature vector with the default shape
    pub fn silent(band_count: usize) -> Self {
        Self::new(super::FRAME_SIZE / 2 + 1, band_count)
    }
}

/// Convert a linear power to dB, clamped to [-80, 0]
#[inline]
pub fn power_to_db(power: f32) -> f32 {
    (10.0 * power.max(POWER_FLOOR).log10()).clamp(DB_FLOOR, 0.0)
}

/// Compute `[start, end)` bin ranges for `band_count` log-spaced bands.
///
/// Every band gets at least one bin; bins are assigned to exactly one band.
pub fn band_ranges(
    sample_rate: u32,
    frame_size: usize,
    band_count: usize,
) -> Vec<(usize, usize)> {
    let bins = frame_size / 2 + 1;
    let bin_hz = sample_rate as f32 / frame_size as f32;
    let f_max = MAX_BAND_HZ.min(sample_rate as f32 / 2.0);
    let f_min = MIN_BAND_HZ.min(f_max * 0.5);
    let ratio = (f_max / f_min).powf(1.0 / band_count as f32);

    let mut edges = Vec::with_capacity(band_count + 1);
    for k in 0..=band_count {
        let freq = f_min * ratio.powi(k as i32);
        edges.push((freq / bin_hz).ceil().max(1.0) as usize);
    }

    // Force strictly increasing edges, then pull them back under Nyquist
    for k in 1..edges.len() {
        if edges[k] <= edges[k - 1] {
            edges[k] = edges[k - 1] + 1;
        }
    }
    let last = edges.len() - 1;
    if edges[last] > bins {
        edges[last] = bins;
        for k in (0..last).rev() {
            if edges[k] >= edges[k + 1] {
                edges[k] = edges[k + 1] - 1;
            }
        }
    }

    edges.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Turns analysis frames into feature vectors.
///
/// All buffers, FFT twiddles and band tables are allocated in `new`;
/// `analyze` does not allocate.
pub struct FeatureExtractor {
    fft: Arc<dyn Fft<f32>>,
    frame_size: usize,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    magnitude_scale: f32,
    band_ranges: Vec<(usize, usize)>,
    prev_bands: Vec<f32>,
    band_filter: ExpFilterBank,
    loudness_filter: ExpFilter,
    flux_history: Vec<f32>,
    flux_len: usize,
    flux_pos: usize,
    onset_k: f32,
    refractory_frames: u64,
    last_onset: Option<u64>,
    frames: u64,
    features: FeatureVector,
}

impl FeatureExtractor {
    pub fn new(config: &AnalysisConfig) -> Self {
        let frame_size = config.frame_size;
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(frame_size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        // Coherent gain of the Hann window, so a sine of amplitude A peaks at A
        let window_sum: f32 = hann_window(frame_size).iter().sum();
        let magnitude_scale = 2.0 / window_sum.max(f32::EPSILON);

        let hop_s = config.hop_seconds();
        let refractory_frames = (config.onset_refractory / hop_s).ceil() as u64;

        Self {
            fft,
            frame_size,
            buffer: vec![Complex::new(0.0, 0.0); frame_size],
            scratch,
            magnitude_scale,
            band_ranges: band_ranges(config.sample_rate, frame_size, config.band_count),
            prev_bands: vec![DB_FLOOR; config.band_count],
            band_filter: ExpFilterBank::new(
                config.band_count,
                DB_FLOOR,
                config.band_rise,
                config.band_decay,
            ),
            loudness_filter: ExpFilter::with_time_constants(
                DB_FLOOR,
                config.loudness_attack,
                config.loudness_release,
                hop_s,
            ),
            flux_history: vec![0.0; FLUX_HISTORY],
            flux_len: 0,
            flux_pos: 0,
            onset_k: config.onset_k,
            refractory_frames,
            last_onset: None,
            frames: 0,
            features: FeatureVector::new(frame_size / 2 + 1, config.band_count),
        }
    }

    /// Bin ranges of each band
    pub fn band_ranges(&self) -> &[(usize, usize)] {
        &self.band_ranges
    }

    /// Most recent feature vector
    pub fn features(&self) -> &FeatureVector {
        &self.features
    }

    /// Analyze one frame and return its features
    pub fn analyze(&mut self, frame: &AnalysisFrame<'_>) -> &FeatureVector {
        self.frames += 1;
        let frame_no = self.frames;

        self.compute_spectrum(frame.windowed);
        self.compute_bands();

        let raw_loudness = rms_dbfs(frame.raw);
        let loudness = self.loudness_filter.update(raw_loudness).clamp(DB_FLOOR, 0.0);

        let flux = self.spectral_flux();
        let onset = self.detect_onset(flux, frame_no);

        self.band_filter.update(&self.features.bands);
        let features = &mut self.features;
        features
            .smoothed_bands
            .copy_from_slice(self.band_filter.values());
        for value in features.smoothed_bands.iter_mut() {
            *value = value.clamp(DB_FLOOR, 0.0);
        }
        features.loudness = loudness;
        features.onset = onset;
        features.flux = flux;
        features.timestamp_ns = frame.timestamp_ns;
        features.newest_ns = frame.newest_ns;
        features.index = frame.index;
        &self.features
    }

    fn compute_spectrum(&mut self, windowed: &[f32]) {
        for (slot, &sample) in self.buffer.iter_mut().zip(windowed.iter()) {
            *slot = Complex::new(sample, 0.0);
        }
        for slot in self.buffer.iter_mut().skip(windowed.len()) {
            *slot = Complex::new(0.0, 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let scale = self.magnitude_scale;
        for (mag, c) in self
            .features
            .mag
            .iter_mut()
            .zip(self.buffer.iter().take(self.frame_size / 2 + 1))
        {
            *mag = flush_denormal((c.re * c.re + c.im * c.im).sqrt() * scale);
        }
    }

    fn compute_bands(&mut self) {
        let mag = &self.features.mag;
        for (band, &(start, end)) in self.features.bands.iter_mut().zip(&self.band_ranges) {
            let end = end.min(mag.len());
            let power = if start < end {
                let sum: f32 = mag[start..end].iter().map(|m| m * m).sum();
                sum / (end - start) as f32
            } else {
                0.0
            };
            *band = power_to_db(power);
        }
    }

    /// Sum of positive band rises versus the previous frame
    fn spectral_flux(&mut self) -> f32 {
        let mut flux = 0.0;
        for (prev, &band) in self.prev_bands.iter_mut().zip(&self.features.bands) {
            flux += (band - *prev).max(0.0);
            *prev = band;
        }
        flux
    }

    /// Compare flux against mean + k * stddev of recent flux, with refractory period
    fn detect_onset(&mut self, flux: f32, frame_no: u64) -> bool {
        let (mean, std) = self.flux_stats();
        let threshold = (mean + self.onset_k * std).max(MIN_ONSET_FLUX);

        self.flux_history[self.flux_pos] = flux;
        self.flux_pos = (self.flux_pos + 1) % FLUX_HISTORY;
        self.flux_len = (self.flux_len + 1).min(FLUX_HISTORY);

        let ready = self
            .last_onset
            .map(|last| frame_no - last >= self.refractory_frames)
            .unwrap_or(true);

        if flux > threshold && ready {
            self.last_onset = Some(frame_no);
            true
        } else {
            false
        }
    }

    fn flux_stats(&self) -> (f32, f32) {
        if self.flux_len == 0 {
            return (0.0, 0.0);
        }
        let values = &self.flux_history[..self.flux_len];
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values
            .iter()
            .map(|v| {
                let d = *v - mean;
                d * d
            })
            .sum::<f32>()
            / n;
        (mean, var.sqrt())
    }

    /// Clear all smoothing and onset state
    pub fn reset(&mut self) {
        self.prev_bands.iter_mut().for_each(|b| *b = DB_FLOOR);
        self.band_filter.reset(DB_FLOOR);
        self.loudness_filter.reset(DB_FLOOR);
        self.flux_history.iter_mut().for_each(|f| *f = 0.0);
        self.flux_len = 0;
        self.flux_pos = 0;
        self.last_onset = None;
        self.features.bands.iter_mut().for_each(|b| *b = DB_FLOOR);
        self.features.smoothed_bands.iter_mut().for_each(|b| *b = DB_FLOOR);
        self.features.loudness = DB_FLOOR;
        self.features.onset = false;
    }
}

/// RMS of `samples` in dBFS, where a full-scale sine reads 0 dB
pub fn rms_dbfs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return DB_FLOOR;
    }
    let mean_square = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    power_to_db(mean_square * 2.0)
}
