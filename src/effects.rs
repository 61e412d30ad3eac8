//! Effect renderer: maps feature vectors to an RGB pixel strip
//!
//! Effects draw into a linear `f32` buffer (0-255 per channel). Gamma and
//! clamping happen once at the end through a lookup table, so every effect
//! shares the same output stage.

use crate::audio::{FeatureVector, DB_FLOOR};
use crate::config::EffectKind;
use serde::{Deserialize, Serialize};

/// dB mapped to channel value 0
const LEVEL_FLOOR_DB: f32 = -60.0;

/// dB mapped to channel value 255
const LEVEL_CEIL_DB: f32 = -10.0;

/// Beat-Flash decay time constant (seconds)
const FLASH_TAU: f32 = 0.120;

/// Render intervals longer than this are treated as a restart
const MAX_FRAME_GAP: f32 = 0.25;

/// One LED colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Mean of the three channels
    pub fn brightness(self) -> f32 {
        (self.r as f32 + self.g as f32 + self.b as f32) / 3.0
    }
}

/// `led_count` colours, index 0 first on the wire
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PixelStrip {
    pixels: Vec<Rgb>,
}

impl PixelStrip {
    /// An all-black strip
    pub fn new(led_count: usize) -> Self {
        Self {
            pixels: vec![Rgb::BLACK; led_count],
        }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixels(&self) -> &[Rgb] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [Rgb] {
        &mut self.pixels
    }

    /// Grow or shrink; new LEDs are black
    pub fn resize(&mut self, led_count: usize) {
        self.pixels.resize(led_count, Rgb::BLACK);
    }

    pub fn fill(&mut self, colour: Rgb) {
        self.pixels.iter_mut().for_each(|p| *p = colour);
    }

    /// Mean channel value over the whole strip
    pub fn mean_brightness(&self) -> f32 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        self.pixels.iter().map(|p| p.brightness()).sum::<f32>() / self.pixels.len() as f32
    }
}

/// Linear colour used while rendering (0-255 per channel, unclamped)
pub type Linear = [f32; 3];

/// Per-tick inputs shared by all effects
#[derive(Debug, Clone, Copy)]
pub struct RenderContext {
    /// Seconds since the previous render
    pub dt: f32,

    /// Mirror from the centre outwards
    pub symmetric: bool,

    /// Smoothed loudness below this blanks the baseline
    pub silence_gate_db: f32,
}

/// An entry in the effect registry
pub trait Effect: Send {
    fn kind(&self) -> EffectKind;

    /// Draw one frame into `out` (one entry per LED)
    fn render(&mut self, features: &FeatureVector, ctx: &RenderContext, out: &mut [Linear]);

    /// Forget any state carried between frames
    fn reset(&mut self);
}

/// Map a dB value onto 0-255 with the piecewise-linear level curve
#[inline]
pub fn level(db: f32) -> f32 {
    ((db - LEVEL_FLOOR_DB) / (LEVEL_CEIL_DB - LEVEL_FLOOR_DB)).clamp(0.0, 1.0) * 255.0
}

/// dB of the mean linear power of `bands`
fn group_db(bands: &[f32]) -> f32 {
    if bands.is_empty() {
        return DB_FLOOR;
    }
    let mean = bands.iter().map(|db| 10f32.powf(db / 10.0)).sum::<f32>() / bands.len() as f32;
    crate::audio::fft::power_to_db(mean)
}

/// Low/mid/high group levels in dB (lower, middle and upper third of the bands)
pub fn band_groups(bands: &[f32]) -> [f32; 3] {
    let third = bands.len() / 3;
    [
        group_db(&bands[..third]),
        group_db(&bands[third..2 * third]),
        group_db(&bands[2 * third..]),
    ]
}

/// The Energy colour for this frame, black below the silence gate
pub fn energy_colour(features: &FeatureVector, silence_gate_db: f32) -> Linear {
    if features.loudness < silence_gate_db {
        return [0.0; 3];
    }
    let [low, mid, high] = band_groups(&features.smoothed_bands);
    [level(low), level(mid), level(high)]
}

/// Uniform fill of the Energy colour, or a centre-out taper when symmetric
pub struct EnergyEffect;

impl EnergyEffect {
    fn draw(colour: Linear, features: &FeatureVector, ctx: &RenderContext, out: &mut [Linear]) {
        if !ctx.symmetric {
            out.iter_mut().for_each(|p| *p = colour);
            return;
        }

        // Loudness sets how far from the centre the colour reaches
        let reach = level(features.loudness) / 255.0;
        let centre = (out.len() as f32 - 1.0) / 2.0;
        let half = (out.len() as f32 / 2.0).max(1.0);
        for (i, pixel) in out.iter_mut().enumerate() {
            let distance = (i as f32 - centre).abs() / half;
            let scale = if reach > 0.0 {
                (1.0 - distance / reach).clamp(0.0, 1.0)
            } else {
                0.0
            };
            *pixel = [colour[0] * scale, colour[1] * scale, colour[2] * scale];
        }
    }
}

impl Effect for EnergyEffect {
    fn kind(&self) -> EffectKind {
        EffectKind::Energy
    }

    fn render(&mut self, features: &FeatureVector, ctx: &RenderContext, out: &mut [Linear]) {
        let colour = energy_colour(features, ctx.silence_gate_db);
        Self::draw(colour, features, ctx, out);
    }

    fn reset(&mut self) {}
}

/// Pushes the newest colour in at index 0, shifting the rest outwards
#[derive(Default)]
pub struct ScrollEffect {
    trail: Vec<Linear>,
}

impl Effect for ScrollEffect {
    fn kind(&self) -> EffectKind {
        EffectKind::Scroll
    }

    fn render(&mut self, features: &FeatureVector, ctx: &RenderContext, out: &mut [Linear]) {
        if self.trail.len() != out.len() {
            self.trail.resize(out.len(), [0.0; 3]);
        }
        if self.trail.is_empty() {
            return;
        }
        self.trail.rotate_right(1);
        self.trail[0] = energy_colour(features, ctx.silence_gate_db);
        out.copy_from_slice(&self.trail);
    }

    fn reset(&mut self) {
        self.trail.iter_mut().for_each(|p| *p = [0.0; 3]);
    }
}

/// Full white on onset, decaying exponentially back to the Energy baseline
#[derive(Default)]
pub struct BeatFlashEffect {
    flash: f32,
}

impl Effect for BeatFlashEffect {
    fn kind(&self) -> EffectKind {
        EffectKind::BeatFlash
    }

    fn render(&mut self, features: &FeatureVector, ctx: &RenderContext, out: &mut [Linear]) {
        if features.onset {
            self.flash = 1.0;
        } else {
            self.flash *= (-ctx.dt / FLASH_TAU).exp();
            if self.flash < 1.0e-3 {
                self.flash = 0.0;
            }
        }

        let colour = energy_colour(features, ctx.silence_gate_db);
        EnergyEffect::draw(colour, features, ctx, out);
        let flash = self.flash;
        for pixel in out.iter_mut() {
            for channel in pixel.iter_mut() {
                *channel = *channel * (1.0 - flash) + 255.0 * flash;
            }
        }
    }

    fn reset(&mut self) {
        self.flash = 0.0;
    }
}

/// Build the gamma lookup: `out = 255 * (v / 255) ^ gamma`
pub fn gamma_table(gamma: f32) -> [u8; 256] {
    let mut table = [0u8; 256];
    for (v, out) in table.iter_mut().enumerate() {
        let corrected = 255.0 * (v as f32 / 255.0).powf(gamma);
        *out = corrected.round().clamp(0.0, 255.0) as u8;
    }
    table
}

/// Owns the effect registry, per-effect state and the output strip
pub struct Renderer {
    effects: Vec<Box<dyn Effect>>,
    active: EffectKind,
    symmetric: bool,
    silence_gate_db: f32,
    frame_period: f32,
    gamma: [u8; 256],
    linear: Vec<Linear>,
    strip: PixelStrip,
    last_ns: Option<u64>,
}

impl Renderer {
    /// `frame_period` is the expected time between renders (seconds)
    pub fn new(
        led_count: usize,
        effect: EffectKind,
        symmetric: bool,
        gamma: f32,
        silence_gate_db: f32,
        frame_period: f32,
    ) -> Self {
        let effects: Vec<Box<dyn Effect>> = vec![
            Box::new(EnergyEffect),
            Box::new(ScrollEffect::default()),
            Box::new(BeatFlashEffect::default()),
        ];
        Self {
            effects,
            active: effect,
            symmetric,
            silence_gate_db,
            frame_period,
            gamma: gamma_table(gamma),
            linear: vec![[0.0; 3]; led_count],
            strip: PixelStrip::new(led_count),
            last_ns: None,
        }
    }

    /// Names of every registered effect
    pub fn effect_names(&self) -> Vec<&'static str> {
        self.effects.iter().map(|e| e.kind().name()).collect()
    }

    pub fn effect(&self) -> EffectKind {
        self.active
    }

    pub fn set_effect(&mut self, kind: EffectKind) {
        if kind != self.active {
            log::debug!("Effect changed to {}", kind.name());
            self.active = kind;
        }
    }

    pub fn led_count(&self) -> usize {
        self.strip.len()
    }

    /// Resize the strip; new LEDs start black
    pub fn set_led_count(&mut self, led_count: usize) {
        self.linear.resize(led_count, [0.0; 3]);
        self.strip.resize(led_count);
    }

    /// Clear all effect state
    pub fn reset(&mut self) {
        for effect in self.effects.iter_mut() {
            effect.reset();
        }
        self.linear.iter_mut().for_each(|p| *p = [0.0; 3]);
        self.strip.fill(Rgb::BLACK);
        self.last_ns = None;
    }

    /// Render one frame
    pub fn render(&mut self, features: &FeatureVector) -> &PixelStrip {
        let dt = self.frame_dt(features.newest_ns);
        let ctx = RenderContext {
            dt,
            symmetric: self.symmetric,
            silence_gate_db: self.silence_gate_db,
        };

        let active = self.active;
        if let Some(effect) = self.effects.iter_mut().find(|e| e.kind() == active) {
            effect.render(features, &ctx, &mut self.linear);
        }

        for (pixel, linear) in self.strip.pixels_mut().iter_mut().zip(&self.linear) {
            *pixel = Rgb::new(
                self.gamma[quantize(linear[0])],
                self.gamma[quantize(linear[1])],
                self.gamma[quantize(linear[2])],
            );
        }
        &self.strip
    }

    pub fn strip(&self) -> &PixelStrip {
        &self.strip
    }

    fn frame_dt(&mut self, now_ns: u64) -> f32 {
        let dt = match self.last_ns {
            Some(last) if now_ns > last => (now_ns - last) as f32 / 1e9,
            _ => self.frame_period,
        };
        self.last_ns = Some(now_ns);
        if dt > MAX_FRAME_GAP {
            self.frame_period
        } else {
            dt
        }
    }
}

#[inline]
fn quantize(value: f32) -> usize {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 255.0) as usize
}
