//! Band Energy Balance
//!
//! Proportional controller behind the adaptive equalizer: the louder band is
//! turned down and the quieter band turned up by half their RMS difference.

use serde::{Deserialize, Serialize};

/// Per-cycle controller state for the two equalizer bands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandBalance {
    pub rms_low: f32,
    pub rms_high: f32,
    pub gain_low: f32,
    pub gain_high: f32,
}

impl Default for BandBalance {
    fn default() -> Self {
        Self {
            rms_low: 0.0,
            rms_high: 0.0,
            gain_low: 1.0,
            gain_high: 1.0,
        }
    }
}

impl BandBalance {
    /// Compute the band gains for one control cycle.
    ///
    /// `gain_low = 1 − 0.5·diff`, `gain_high = 1 + 0.5·diff` with
    /// `diff = rms_low − rms_high`. The controller keeps no memory between
    /// cycles. Gains are clamped only when `bounds` is given.
    pub fn compute(rms_low: f32, rms_high: f32, bounds: Option<(f32, f32)>) -> Self {
        let diff = rms_low - rms_high;
        let mut gain_low = 1.0 - 0.5 * diff;
        let mut gain_high = 1.0 + 0.5 * diff;

        if let Some((min, max)) = bounds {
            gain_low = gain_low.clamp(min, max);
            gain_high = gain_high.clamp(min, max);
        }

        Self {
            rms_low,
            rms_high,
            gain_low,
            gain_high,
        }
    }

    pub fn difference(&self) -> f32 {
        self.rms_low - self.rms_high
    }
}

/// Root-mean-square of a block of samples (0 for an empty block)
#[inline]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_louder_low_band() {
        let balance = BandBalance::compute(0.8, 0.4, None);
        assert!((balance.gain_low - 0.8).abs() < 1e-6);
        assert!((balance.gain_high - 1.2).abs() < 1e-6);
        assert!((balance.difference() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_equal_bands_unity() {
        let balance = BandBalance::compute(0.3, 0.3, None);
        assert_eq!(balance.gain_low, 1.0);
        assert_eq!(balance.gain_high, 1.0);
    }

    #[test]
    fn test_unbounded_by_default() {
        // A 4.0 RMS difference drives the low gain negative
        let balance = BandBalance::compute(4.0, 0.0, None);
        assert!((balance.gain_low + 1.0).abs() < 1e-6);
        assert!((balance.gain_high - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_bounds_clamp() {
        let balance = BandBalance::compute(4.0, 0.0, Some((0.0, 2.0)));
        assert_eq!(balance.gain_low, 0.0);
        assert_eq!(balance.gain_high, 2.0);
    }

    #[test]
    fn test_default_is_unity() {
        let balance = BandBalance::default();
        assert_eq!(balance.gain_low, 1.0);
        assert_eq!(balance.gain_high, 1.0);
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5; 64]) - 0.5).abs() < 1e-6);

        // Full-scale sine has RMS 1/sqrt(2)
        let sine: Vec<f32> = (0..4800)
            .map(|i| (2.0 * std::f32::consts::PI * 100.0 * i as f32 / 48000.0).sin())
            .collect();
        assert!((rms(&sine) - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-3);
    }
}
