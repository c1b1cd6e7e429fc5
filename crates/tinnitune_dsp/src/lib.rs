//! Tinnitune DSP - Digital Signal Processing Module
//!
//! This crate provides the signal-level building blocks of the therapy
//! engine:
//! - BiQuad filter stages (notch, peaking, band-pass, shelf, low/high-pass)
//! - Band-gap filter parameters derived from a tinnitus target frequency
//! - Oscillators with built-in and custom (Fourier-defined) waveforms
//! - White, pink and harmonic noise generation
//! - Soft-knee compressor used as the master limiter
//! - Parameter automation timelines (set, ramp, exponential approach)
//! - Analyser ring buffer with RMS and FFT spectrum
//! - Band energy balance for the adaptive equalizer
//!
//! # Architecture
//!
//! Everything here is single-threaded and allocation-free on the processing
//! path. The engine crate owns these objects inside its render graph.

mod analyser;
mod balance;
mod bandgap;
mod dynamics;
mod error;
mod filter;
mod noise;
mod oscillator;
mod param;
mod processor;

pub use analyser::{Analyser, DEFAULT_WINDOW, NUM_BINS};
pub use balance::{rms, BandBalance};
pub use bandgap::{notch_q, BandGapParams, PEAK_GAIN_DB, PEAK_OFFSET_OCTAVES, PEAK_Q};
pub use dynamics::{Compressor, CompressorParams};
pub use error::DspError;
pub use filter::{BiquadFilter, FilterKind, FilterParams};
pub use noise::{
    harmonic_partials, pink_filters, white_noise_buffer, HarmonicPartial, DEFAULT_NOISE_SECONDS,
    HARMONIC_FREQUENCIES, NOISE_AMPLITUDE,
};
pub use oscillator::{Oscillator, OscillatorShape, PeriodicWave, Waveform};
pub use param::{AutomationEvent, ParamTimeline};
pub use processor::{AudioProcessor, ProcessContext};

/// Convert decibels to linear amplitude: `10^(dB/20)`
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert linear amplitude to decibels, with silence mapped to `-inf`
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    20.0 * linear.abs().log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_to_linear() {
        assert_eq!(db_to_linear(0.0), 1.0);
        assert!((db_to_linear(-20.0) - 0.1).abs() < 1e-6);
        assert!((db_to_linear(20.0) - 10.0).abs() < 1e-4);
        assert!((db_to_linear(-6.0) - 0.501).abs() < 0.001);
    }

    #[test]
    fn test_db_to_linear_strictly_increasing() {
        let mut previous = db_to_linear(-120.0);
        let mut db = -119.5;
        while db <= 24.0 {
            let current = db_to_linear(db);
            assert!(current > previous, "not increasing at {} dB", db);
            previous = current;
            db += 0.5;
        }
    }

    #[test]
    fn test_linear_to_db_inverse() {
        for db in [-60.0_f32, -18.0, -6.0, 0.0, 6.0] {
            assert!((linear_to_db(db_to_linear(db)) - db).abs() < 1e-4);
        }
        assert_eq!(linear_to_db(0.0), f32::NEG_INFINITY);
    }

    #[test]
    fn test_crate_exports() {
        // Verify all public types are accessible
        let _params = CompressorParams::default();
        let _balance = BandBalance::default();
        let _timeline = ParamTimeline::new(1.0);
        assert!(BandGapParams::for_target(4000.0).is_ok());
    }
}
