//! Band-Gap Filter Parameters
//!
//! The notch/peak protocol removes a half-octave band around the listener's
//! tinnitus frequency and lifts the bands on either side of the gap.

use serde::{Deserialize, Serialize};

use crate::error::DspError;
use crate::filter::FilterParams;

/// Notch bandwidth in octaves
pub const NOTCH_BANDWIDTH_OCTAVES: f32 = 0.5;

/// Distance of each peak from the target, in octaves
pub const PEAK_OFFSET_OCTAVES: f32 = 3.0 / 8.0;

pub const PEAK_GAIN_DB: f32 = 20.0;

pub const PEAK_Q: f32 = 1.0;

/// Q of a notch whose -3 dB edges sit a quarter octave either side of center.
///
/// `f / (f·2^0.25 − f·2^−0.25)` cancels to this constant (≈ 2.871).
pub fn notch_q() -> f32 {
    let half = NOTCH_BANDWIDTH_OCTAVES / 2.0;
    1.0 / (2.0_f32.powf(half) - 2.0_f32.powf(-half))
}

/// Filter settings for the three cascaded band-gap stages
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandGapParams {
    pub target_hz: f32,
    pub notch: FilterParams,
    pub low_peak: FilterParams,
    pub high_peak: FilterParams,
}

impl BandGapParams {
    /// Derive the stage settings from a target frequency.
    ///
    /// Deterministic: the same target always yields the same parameters.
    pub fn for_target(target_hz: f32) -> Result<Self, DspError> {
        if !(target_hz > 0.0) || !target_hz.is_finite() {
            return Err(DspError::InvalidFrequency(target_hz));
        }

        let offset = 2.0_f32.powf(PEAK_OFFSET_OCTAVES);
        Ok(Self {
            target_hz,
            notch: FilterParams::notch(target_hz, notch_q()),
            low_peak: FilterParams::peaking(target_hz / offset, PEAK_Q, PEAK_GAIN_DB),
            high_peak: FilterParams::peaking(target_hz * offset, PEAK_Q, PEAK_GAIN_DB),
        })
    }

    /// Stages in processing order: notch, low peak, high peak
    pub fn stages(&self) -> [FilterParams; 3] {
        [self.notch, self.low_peak, self.high_peak]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterKind;

    #[test]
    fn test_notch_q_is_constant() {
        assert!((notch_q() - 2.871).abs() < 0.001, "got {}", notch_q());

        for f in [125.0_f32, 1000.0, 4000.0, 12000.0] {
            let params = BandGapParams::for_target(f).unwrap();
            let explicit = f / (f * 2.0_f32.powf(0.25) - f * 2.0_f32.powf(-0.25));
            assert!((params.notch.q - explicit).abs() < 1e-3);
            assert_eq!(params.notch.frequency, f);
            assert_eq!(params.notch.kind, FilterKind::Notch);
        }
    }

    #[test]
    fn test_peaks_three_eighths_octave_away() {
        let params = BandGapParams::for_target(4000.0).unwrap();
        let expected_low = 4000.0 * 2.0_f32.powf(-0.375);
        let expected_high = 4000.0 * 2.0_f32.powf(0.375);

        assert!((params.low_peak.frequency - expected_low).abs() < 0.01);
        assert!((params.high_peak.frequency - expected_high).abs() < 0.01);
        assert!((params.low_peak.frequency - 3084.4).abs() < 0.5);
        assert!((params.high_peak.frequency - 5187.6).abs() < 0.5);

        for peak in [params.low_peak, params.high_peak] {
            assert_eq!(peak.kind, FilterKind::Peaking);
            assert_eq!(peak.gain_db, 20.0);
            assert_eq!(peak.q, 1.0);
        }
    }

    #[test]
    fn test_deterministic() {
        let a = BandGapParams::for_target(6000.0).unwrap();
        let b = BandGapParams::for_target(6000.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_invalid_target() {
        assert!(BandGapParams::for_target(0.0).is_err());
        assert!(BandGapParams::for_target(-440.0).is_err());
        assert!(BandGapParams::for_target(f32::NAN).is_err());
    }

    #[test]
    fn test_stage_order() {
        let params = BandGapParams::for_target(1000.0).unwrap();
        let stages = params.stages();
        assert_eq!(stages[0].kind, FilterKind::Notch);
        assert!(stages[1].frequency < stages[2].frequency);
    }
}
