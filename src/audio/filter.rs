//! Asymmetric exponential smoothing

/// Values smaller than this are treated as zero to keep denormals out of
/// the recursive filters.
const DENORMAL_LIMIT: f32 = 1.0e-30;

/// Flush subnormal values to zero
#[inline]
pub fn flush_denormal(value: f32) -> f32 {
    if value.abs() < DENORMAL_LIMIT {
        0.0
    } else {
        value
    }
}

/// Per-step coefficient for a one-pole smoother with time constant `tau_s`
/// updated every `step_s` seconds.
pub fn coefficient(tau_s: f32, step_s: f32) -> f32 {
    if tau_s <= 0.0 {
        return 1.0;
    }
    1.0 - (-step_s / tau_s).exp()
}

/// One-pole filter with separate rise (attack) and decay (release) rates.
///
/// `y += alpha * (x - y)` where alpha is the rise coefficient when the input
/// is above the current value and the decay coefficient otherwise.
#[derive(Debug, Clone)]
pub struct ExpFilter {
    value: f32,
    rise: f32,
    decay: f32,
}

impl ExpFilter {
    pub fn new(initial: f32, rise: f32, decay: f32) -> Self {
        Self {
            value: initial,
            rise: rise.clamp(0.0, 1.0),
            decay: decay.clamp(0.0, 1.0),
        }
    }

    /// Build from attack/release time constants for a fixed update period
    pub fn with_time_constants(initial: f32, attack_s: f32, release_s: f32, step_s: f32) -> Self {
        Self::new(
            initial,
            coefficient(attack_s, step_s),
            coefficient(release_s, step_s),
        )
    }

    #[inline]
    pub fn update(&mut self, input: f32) -> f32 {
        let alpha = if input > self.value {
            self.rise
        } else {
            self.decay
        };
        self.value = flush_denormal(self.value + alpha * (input - self.value));
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn reset(&mut self, value: f32) {
        self.value = value;
    }
}

/// A bank of identical `ExpFilter`s smoothing a vector element-wise
#[derive(Debug, Clone)]
pub struct ExpFilterBank {
    values: Vec<f32>,
    rise: f32,
    decay: f32,
}

impl ExpFilterBank {
    pub fn new(size: usize, initial: f32, rise: f32, decay: f32) -> Self {
        Self {
            values: vec![initial; size],
            rise: rise.clamp(0.0, 1.0),
            decay: decay.clamp(0.0, 1.0),
        }
    }

    /// Smooth `input` into the bank; extra elements on either side are ignored
    pub fn update(&mut self, input: &[f32]) -> &[f32] {
        for (value, &x) in self.values.iter_mut().zip(input) {
            let alpha = if x > *value { self.rise } else { self.decay };
            *value = flush_denormal(*value + alpha * (x - *value));
        }
        &self.values
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn reset(&mut self, value: f32) {
        self.values.iter_mut().for_each(|v| *v = value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f32, expected: f32, tolerance: f32) {
        assert!(
            (actual - expected).abs() <= tolerance,
            "expected {expected} +/- {tolerance}, got {actual}"
        );
    }

    #[test]
    fn rise_and_decay_use_their_own_rates() {
        let mut filter = ExpFilter::new(0.0, 0.9, 0.1);
        assert_approx(filter.update(1.0), 0.9, 1e-6);
        assert_approx(filter.update(0.0), 0.81, 1e-6);
    }

    #[test]
    fn time_constant_reaches_63_percent_after_tau() {
        let step = 0.001;
        let mut filter = ExpFilter::with_time_constants(0.0, 0.01, 0.25, step);
        for _ in 0..10 {
            filter.update(1.0);
        }
        assert_approx(filter.value(), 1.0 - (-1.0f32).exp(), 0.01);
    }

    #[test]
    fn zero_time_constant_is_instant() {
        assert_eq!(coefficient(0.0, 0.005), 1.0);
    }

    #[test]
    fn denormals_are_flushed() {
        let mut filter = ExpFilter::new(1.0e-31, 0.5, 0.5);
        assert_eq!(filter.update(0.0), 0.0);
        assert_eq!(flush_denormal(f32::MIN_POSITIVE / 4.0), 0.0);
        assert_eq!(flush_denormal(-0.25), -0.25);
    }

    #[test]
    fn bank_filters_elementwise() {
        let mut bank = ExpFilterBank::new(3, 0.0, 0.9, 0.7);
        bank.update(&[1.0, 0.0, 2.0]);
        let values = bank.update(&[0.0, 0.0, 2.0]).to_vec();
        assert_approx(values[0], 0.9 * 0.3, 1e-6);
        assert_eq!(values[1], 0.0);
        assert_approx(values[2], 1.98, 1e-5);

        bank.reset(-80.0);
        assert!(bank.values().iter().all(|&v| v == -80.0));
    }
}
