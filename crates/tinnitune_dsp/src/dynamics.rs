//! Dynamics Compressor / Limiter
//!
//! Feed-forward compressor with a soft knee, used as the limiter at the head
//! of the master chain.
//!
//! # Algorithm
//!
//! - Peak detector converts each sample to dB
//! - Static gain computer with a quadratic knee around the threshold
//! - Gain reduction is smoothed with separate attack/release time constants
//!
//! No makeup gain is applied: the output is never louder than the input.

use serde::{Deserialize, Serialize};

use crate::db_to_linear;
use crate::error::DspError;
use crate::processor::{AudioProcessor, ProcessContext};

/// Level floor for the detector, avoids log of zero
const MIN_LEVEL_DB: f32 = -120.0;

/// Compressor settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorParams {
    pub threshold_db: f32,
    /// Width of the soft knee in dB
    pub knee_db: f32,
    pub ratio: f32,
    pub attack_seconds: f32,
    pub release_seconds: f32,
}

impl Default for CompressorParams {
    /// Master limiter settings
    fn default() -> Self {
        Self {
            threshold_db: -18.0,
            knee_db: 30.0,
            ratio: 8.0,
            attack_seconds: 0.003,
            release_seconds: 0.25,
        }
    }
}

impl CompressorParams {
    pub fn validate(&self) -> Result<(), DspError> {
        let checks = [
            ("threshold_db", self.threshold_db, (-100.0..=0.0).contains(&self.threshold_db)),
            ("knee_db", self.knee_db, (0.0..=40.0).contains(&self.knee_db)),
            ("ratio", self.ratio, (1.0..=20.0).contains(&self.ratio)),
            ("attack_seconds", self.attack_seconds, (0.0..=1.0).contains(&self.attack_seconds)),
            ("release_seconds", self.release_seconds, (0.0..=1.0).contains(&self.release_seconds)),
        ];
        match checks.into_iter().find(|(_, _, ok)| !ok) {
            Some((name, value, _)) => Err(DspError::InvalidDynamics { name, value }),
            None => Ok(()),
        }
    }

    /// Static output level for an input level, both in dB
    pub fn transfer_db(&self, level_db: f32) -> f32 {
        let over = level_db - self.threshold_db;
        let slope = 1.0 / self.ratio - 1.0;

        if 2.0 * over < -self.knee_db {
            level_db
        } else if self.knee_db > 0.0 && 2.0 * over.abs() <= self.knee_db {
            let x = over + self.knee_db / 2.0;
            level_db + slope * x * x / (2.0 * self.knee_db)
        } else {
            self.threshold_db + over / self.ratio
        }
    }
}

/// Soft-knee feed-forward compressor
pub struct Compressor {
    params: CompressorParams,
    sample_rate: f32,
    attack_coeff: f32,
    release_coeff: f32,
    /// Smoothed gain reduction in dB (≤ 0)
    reduction_db: f32,
}

impl Compressor {
    pub fn new(params: CompressorParams, sample_rate: f32) -> Result<Self, DspError> {
        if !(sample_rate > 0.0) {
            return Err(DspError::InvalidSampleRate(sample_rate));
        }
        params.validate()?;
        Ok(Self {
            params,
            sample_rate,
            attack_coeff: smoothing_coeff(params.attack_seconds, sample_rate),
            release_coeff: smoothing_coeff(params.release_seconds, sample_rate),
            reduction_db: 0.0,
        })
    }

    pub fn params(&self) -> &CompressorParams {
        &self.params
    }

    pub fn set_params(&mut self, params: CompressorParams) -> Result<(), DspError> {
        params.validate()?;
        self.attack_coeff = smoothing_coeff(params.attack_seconds, self.sample_rate);
        self.release_coeff = smoothing_coeff(params.release_seconds, self.sample_rate);
        self.params = params;
        Ok(())
    }

    /// Current gain reduction in dB (0 or negative)
    pub fn reduction_db(&self) -> f32 {
        self.reduction_db
    }

    /// Process a single sample
    ///
    /// # Real-time Safety
    /// No allocations, no syscalls, O(1) time.
    #[inline]
    pub fn process_sample(&mut self, sample: f32) -> f32 {
        let level_db = if sample == 0.0 {
            MIN_LEVEL_DB
        } else {
            (20.0 * sample.abs().log10()).max(MIN_LEVEL_DB)
        };
        let target = self.params.transfer_db(level_db) - level_db;

        // More reduction uses the attack constant, recovery uses release
        let coeff = if target < self.reduction_db {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.reduction_db = coeff * self.reduction_db + (1.0 - coeff) * target;

        sample * db_to_linear(self.reduction_db)
    }

    pub fn process_block(&mut self, block: &mut [f32]) {
        for sample in block.iter_mut() {
            *sample = self.process_sample(*sample);
        }
    }

    pub fn reset(&mut self) {
        self.reduction_db = 0.0;
    }
}

impl AudioProcessor for Compressor {
    fn process(&mut self, block: &mut [f32], _context: &ProcessContext) {
        self.process_block(block);
    }

    fn reset(&mut self) {
        Compressor::reset(self);
    }

    fn name(&self) -> &'static str {
        "Compressor"
    }
}

/// One-pole smoothing coefficient for a time constant
fn smoothing_coeff(seconds: f32, sample_rate: f32) -> f32 {
    if seconds <= 0.0 {
        0.0
    } else {
        (-1.0 / (seconds * sample_rate)).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 48000.0;

    #[test]
    fn test_default_params() {
        let params = CompressorParams::default();
        assert_eq!(params.threshold_db, -18.0);
        assert_eq!(params.knee_db, 30.0);
        assert_eq!(params.ratio, 8.0);
        assert_eq!(params.attack_seconds, 0.003);
        assert_eq!(params.release_seconds, 0.25);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_transfer_below_knee_is_linear() {
        let params = CompressorParams::default();
        // Knee spans -33 dB to -3 dB
        assert_eq!(params.transfer_db(-40.0), -40.0);
        assert_eq!(params.transfer_db(-60.0), -60.0);
    }

    #[test]
    fn test_transfer_above_knee_uses_ratio() {
        let params = CompressorParams::default();
        // 20 dB over threshold comes out 20/8 = 2.5 dB over
        let out = params.transfer_db(2.0);
        assert!((out - (-15.5)).abs() < 1e-4, "got {}", out);
    }

    #[test]
    fn test_transfer_continuous_at_knee_edges() {
        let params = CompressorParams::default();
        let lower = -18.0 - 15.0;
        let upper = -18.0 + 15.0;
        assert!((params.transfer_db(lower) - lower).abs() < 1e-3);
        assert!((params.transfer_db(upper) - (-18.0 + 15.0 / 8.0)).abs() < 1e-3);
    }

    #[test]
    fn test_hard_knee() {
        let params = CompressorParams {
            knee_db: 0.0,
            ..Default::default()
        };
        assert_eq!(params.transfer_db(-18.0), -18.0);
        assert!((params.transfer_db(-10.0) - (-17.0)).abs() < 1e-5);
    }

    #[test]
    fn test_quiet_signal_passes() {
        let mut comp = Compressor::new(CompressorParams::default(), SR).unwrap();
        // -46 dB stays below the knee
        for _ in 0..4800 {
            let out = comp.process_sample(0.005);
            assert!((out - 0.005).abs() < 1e-6);
        }
    }

    #[test]
    fn test_loud_signal_reduced() {
        let mut comp = Compressor::new(CompressorParams::default(), SR).unwrap();
        let mut last = 0.0;
        for i in 0..48000 {
            let t = i as f32 / SR;
            last = comp.process_sample((2.0 * std::f32::consts::PI * 440.0 * t).sin());
        }
        assert!(comp.reduction_db() < -6.0, "reduction {}", comp.reduction_db());
        assert!(last.abs() < 1.0);
    }

    #[test]
    fn test_never_louder_than_input() {
        let mut comp = Compressor::new(CompressorParams::default(), SR).unwrap();
        for i in 0..9600 {
            let input = ((i as f32) * 0.37).sin() * 0.9;
            let out = comp.process_sample(input);
            assert!(out.abs() <= input.abs() + 1e-6);
        }
    }

    #[test]
    fn test_release_recovers() {
        let mut comp = Compressor::new(CompressorParams::default(), SR).unwrap();
        for _ in 0..4800 {
            comp.process_sample(1.0);
        }
        let compressed = comp.reduction_db();
        for _ in 0..96000 {
            comp.process_sample(0.001);
        }
        assert!(comp.reduction_db() > compressed);
        assert!(comp.reduction_db() > -0.1);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = CompressorParams {
            ratio: 0.5,
            ..Default::default()
        };
        assert!(matches!(
            Compressor::new(params, SR),
            Err(DspError::InvalidDynamics { name: "ratio", .. })
        ));
        assert!(Compressor::new(CompressorParams::default(), 0.0).is_err());
    }

    #[test]
    fn test_reset() {
        let mut comp = Compressor::new(CompressorParams::default(), SR).unwrap();
        for _ in 0..480 {
            comp.process_sample(1.0);
        }
        comp.reset();
        assert_eq!(comp.reduction_db(), 0.0);
    }
}
