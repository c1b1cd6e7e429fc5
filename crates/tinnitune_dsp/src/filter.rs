//! Biquad Filter Stages
//!
//! Single second-order filter sections used by the therapy chains: notch and
//! peaking stages for the band-gap protocol, band-pass splitters for the
//! spectral equalizer, and the shelf/low-pass pair that colours pink noise.
//! Based on the RBJ (Robert Bristow-Johnson) Audio EQ Cookbook.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F32};
use serde::{Deserialize, Serialize};

use crate::error::DspError;
use crate::processor::{AudioProcessor, ProcessContext};

/// Response shape of a filter stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    LowPass,
    HighPass,
    BandPass,
    Notch,
    Peaking,
    LowShelf,
}

/// Parameters of one filter stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    pub kind: FilterKind,
    pub frequency: f32,
    pub q: f32,
    /// Boost/cut in dB, only meaningful for peaking and shelf stages
    pub gain_db: f32,
}

impl FilterParams {
    pub fn low_pass(frequency: f32, q: f32) -> Self {
        Self {
            kind: FilterKind::LowPass,
            frequency,
            q,
            gain_db: 0.0,
        }
    }

    pub fn high_pass(frequency: f32, q: f32) -> Self {
        Self {
            kind: FilterKind::HighPass,
            frequency,
            q,
            gain_db: 0.0,
        }
    }

    pub fn band_pass(frequency: f32, q: f32) -> Self {
        Self {
            kind: FilterKind::BandPass,
            frequency,
            q,
            gain_db: 0.0,
        }
    }

    pub fn notch(frequency: f32, q: f32) -> Self {
        Self {
            kind: FilterKind::Notch,
            frequency,
            q,
            gain_db: 0.0,
        }
    }

    pub fn peaking(frequency: f32, q: f32, gain_db: f32) -> Self {
        Self {
            kind: FilterKind::Peaking,
            frequency,
            q,
            gain_db,
        }
    }

    /// Low shelf with the cookbook's unit shelf slope (S = 1), i.e. Q = 1/sqrt(2)
    pub fn low_shelf(frequency: f32, gain_db: f32) -> Self {
        Self {
            kind: FilterKind::LowShelf,
            frequency,
            q: Q_BUTTERWORTH_F32,
            gain_db,
        }
    }

    /// Generate BiQuad coefficients for this stage
    fn to_coefficients(self, sample_rate: f32) -> Result<Coefficients<f32>, DspError> {
        if !(sample_rate > 0.0) {
            return Err(DspError::InvalidSampleRate(sample_rate));
        }
        if !(self.frequency > 0.0) || !self.frequency.is_finite() {
            return Err(DspError::InvalidFrequency(self.frequency));
        }

        let filter_type = match self.kind {
            FilterKind::LowPass => Type::LowPass,
            FilterKind::HighPass => Type::HighPass,
            FilterKind::BandPass => Type::BandPass,
            FilterKind::Notch => Type::Notch,
            // biquad takes shelf/peak gains in dB
            FilterKind::Peaking => Type::PeakingEQ(self.gain_db),
            FilterKind::LowShelf => Type::LowShelf(self.gain_db),
        };

        Coefficients::<f32>::from_params(filter_type, sample_rate.hz(), self.frequency.hz(), self.q)
            .map_err(|_| DspError::InvalidCoefficients {
                frequency: self.frequency,
                sample_rate,
            })
    }
}

/// One biquad section with its own delay line
///
/// Designed for real-time use: no allocations in `process_sample()`.
pub struct BiquadFilter {
    // DirectForm2Transposed: better numerical stability than DF1
    filter: DirectForm2Transposed<f32>,
    params: FilterParams,
    sample_rate: f32,
}

impl BiquadFilter {
    /// Create a filter stage, validating its parameters against the sample rate
    pub fn new(params: FilterParams, sample_rate: f32) -> Result<Self, DspError> {
        let coeffs = params.to_coefficients(sample_rate)?;
        Ok(Self {
            filter: DirectForm2Transposed::<f32>::new(coeffs),
            params,
            sample_rate,
        })
    }

    /// Retune the stage. The delay line is kept so retuning does not click.
    pub fn set_params(&mut self, params: FilterParams) -> Result<(), DspError> {
        let coeffs = params.to_coefficients(self.sample_rate)?;
        self.filter.update_coefficients(coeffs);
        self.params = params;
        Ok(())
    }

    pub fn params(&self) -> &FilterParams {
        &self.params
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    #[inline]
    pub fn process_sample(&mut self, sample: f32) -> f32 {
        self.filter.run(sample)
    }

    /// Process a mono block in-place
    #[inline]
    pub fn process_block(&mut self, block: &mut [f32]) {
        for sample in block.iter_mut() {
            *sample = self.filter.run(*sample);
        }
    }

    /// Reset filter state (clear delay line)
    pub fn reset(&mut self) {
        self.filter.reset_state();
    }
}

impl AudioProcessor for BiquadFilter {
    fn process(&mut self, block: &mut [f32], _context: &ProcessContext) {
        self.process_block(block);
    }

    fn reset(&mut self) {
        BiquadFilter::reset(self);
    }

    fn name(&self) -> &'static str {
        match self.params.kind {
            FilterKind::LowPass => "Low-pass",
            FilterKind::HighPass => "High-pass",
            FilterKind::BandPass => "Band-pass",
            FilterKind::Notch => "Notch",
            FilterKind::Peaking => "Peaking",
            FilterKind::LowShelf => "Low-shelf",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 48000.0;

    /// Steady-state peak amplitude of a unit sine after passing through `params`
    fn sine_gain(params: FilterParams, freq: f32) -> f32 {
        let mut filter = BiquadFilter::new(params, SR).unwrap();
        let mut peak = 0.0_f32;
        for i in 0..(SR as usize) {
            let t = i as f32 / SR;
            let out = filter.process_sample((2.0 * std::f32::consts::PI * freq * t).sin());
            // Skip the transient
            if i > SR as usize / 2 {
                peak = peak.max(out.abs());
            }
        }
        peak
    }

    #[test]
    fn test_rejects_frequency_above_nyquist() {
        let result = BiquadFilter::new(FilterParams::notch(30000.0, 1.0), SR);
        assert!(matches!(result, Err(DspError::InvalidCoefficients { .. })));
    }

    #[test]
    fn test_rejects_non_positive_frequency() {
        assert!(matches!(
            BiquadFilter::new(FilterParams::band_pass(0.0, 1.0), SR),
            Err(DspError::InvalidFrequency(_))
        ));
        assert!(matches!(
            BiquadFilter::new(FilterParams::band_pass(-100.0, 1.0), SR),
            Err(DspError::InvalidFrequency(_))
        ));
    }

    #[test]
    fn test_rejects_bad_sample_rate() {
        assert!(matches!(
            BiquadFilter::new(FilterParams::low_pass(1000.0, 0.7), 0.0),
            Err(DspError::InvalidSampleRate(_))
        ));
    }

    #[test]
    fn test_notch_attenuates_center() {
        let gain = sine_gain(FilterParams::notch(4000.0, 2.87), 4000.0);
        assert!(gain < 0.05, "Notch center should be nearly silent: {}", gain);
    }

    #[test]
    fn test_notch_passes_far_frequencies() {
        let gain = sine_gain(FilterParams::notch(4000.0, 2.87), 500.0);
        assert!(gain > 0.9, "Notch should pass distant frequencies: {}", gain);
    }

    #[test]
    fn test_peaking_boosts_by_gain() {
        // +20 dB at the center is a factor of 10
        let gain = sine_gain(FilterParams::peaking(3000.0, 1.0, 20.0), 3000.0);
        assert!((gain - 10.0).abs() < 0.5, "Expected ~10x boost, got {}", gain);
    }

    #[test]
    fn test_band_pass_unity_at_center() {
        let center = sine_gain(FilterParams::band_pass(2000.0, 1.0), 2000.0);
        let far = sine_gain(FilterParams::band_pass(2000.0, 1.0), 100.0);
        assert!((center - 1.0).abs() < 0.05, "Band-pass peak should be 0 dB: {}", center);
        assert!(far < 0.2, "Band-pass should reject distant frequencies: {}", far);
    }

    #[test]
    fn test_low_shelf_boosts_lows() {
        // +6 dB is roughly a factor of 2
        let low = sine_gain(FilterParams::low_shelf(500.0, 6.0), 50.0);
        let high = sine_gain(FilterParams::low_shelf(500.0, 6.0), 10000.0);
        assert!((low - 2.0).abs() < 0.15, "Low shelf should boost lows: {}", low);
        assert!((high - 1.0).abs() < 0.05, "Low shelf should leave highs: {}", high);
    }

    #[test]
    fn test_set_params_retunes() {
        let mut filter = BiquadFilter::new(FilterParams::low_pass(6000.0, 0.7), SR).unwrap();
        filter.set_params(FilterParams::low_pass(1000.0, 0.7)).unwrap();
        assert_eq!(filter.params().frequency, 1000.0);

        // A failed retune keeps the previous parameters
        assert!(filter.set_params(FilterParams::low_pass(-1.0, 0.7)).is_err());
        assert_eq!(filter.params().frequency, 1000.0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut filter = BiquadFilter::new(FilterParams::low_pass(1000.0, 0.7), SR).unwrap();
        for _ in 0..64 {
            filter.process_sample(1.0);
        }
        filter.reset();
        assert_eq!(filter.process_sample(0.0), 0.0);
    }
}
