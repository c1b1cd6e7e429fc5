//! Oscillators
//!
//! Phase-accumulator oscillators with per-sample (a-rate) frequency input.
//! Square and sawtooth use polyBLEP correction to keep aliasing down at the
//! high partials used by harmonic noise.

use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DspError;

/// Samples per cycle in a periodic wave table
pub const PERIODIC_WAVE_SIZE: usize = 4096;

/// Built-in oscillator shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    Sine,
    Square,
    Triangle,
    Sawtooth,
}

impl Waveform {
    pub const ALL: [Waveform; 4] = [
        Waveform::Sine,
        Waveform::Square,
        Waveform::Triangle,
        Waveform::Sawtooth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Waveform::Sine => "sine",
            Waveform::Square => "square",
            Waveform::Triangle => "triangle",
            Waveform::Sawtooth => "sawtooth",
        }
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Waveform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Waveform::ALL
            .into_iter()
            .find(|w| w.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown waveform '{}'", s))
    }
}

/// Custom single-cycle waveform defined by Fourier coefficients.
///
/// One cycle is `Σ real[k]·cos(kθ) + imag[k]·sin(kθ)` for `k ≥ 1`; the DC
/// terms at index 0 are ignored. With normalization enabled the table is
/// scaled so its peak magnitude is 1.
#[derive(Debug, Clone)]
pub struct PeriodicWave {
    table: Arc<[f32]>,
}

impl PeriodicWave {
    pub fn new(real: &[f32], imag: &[f32], normalize: bool) -> Result<Self, DspError> {
        if real.len() != imag.len() {
            return Err(DspError::InvalidPeriodicWave(format!(
                "real and imag lengths differ ({} vs {})",
                real.len(),
                imag.len()
            )));
        }
        if real.len() < 2 {
            return Err(DspError::InvalidPeriodicWave(
                "at least one harmonic is required".to_string(),
            ));
        }
        if real.iter().chain(imag.iter()).any(|c| !c.is_finite()) {
            return Err(DspError::InvalidPeriodicWave(
                "coefficients must be finite".to_string(),
            ));
        }

        let mut table: Vec<f32> = (0..PERIODIC_WAVE_SIZE)
            .map(|i| {
                let theta = 2.0 * std::f64::consts::PI * i as f64 / PERIODIC_WAVE_SIZE as f64;
                real.iter()
                    .zip(imag.iter())
                    .enumerate()
                    .skip(1)
                    .map(|(k, (&re, &im))| {
                        let kt = k as f64 * theta;
                        re as f64 * kt.cos() + im as f64 * kt.sin()
                    })
                    .sum::<f64>() as f32
            })
            .collect();

        if normalize {
            let peak = table.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
            if peak > 0.0 {
                for sample in table.iter_mut() {
                    *sample /= peak;
                }
            }
        }

        Ok(Self {
            table: table.into(),
        })
    }

    /// Single harmonic whose phase is shifted by `phase_radians`:
    /// `real[1] = cos φ`, `imag[1] = −sin φ`, i.e. `cos(θ + φ)`.
    pub fn phase_shifted_cosine(phase_radians: f32, normalize: bool) -> Result<Self, DspError> {
        Self::new(
            &[0.0, phase_radians.cos()],
            &[0.0, -phase_radians.sin()],
            normalize,
        )
    }

    /// Value at a phase in cycles `[0, 1)`, linearly interpolated
    #[inline]
    pub fn sample(&self, phase: f64) -> f32 {
        let pos = phase * PERIODIC_WAVE_SIZE as f64;
        let index = pos as usize % PERIODIC_WAVE_SIZE;
        let next = (index + 1) % PERIODIC_WAVE_SIZE;
        let frac = (pos - pos.floor()) as f32;
        self.table[index] + (self.table[next] - self.table[index]) * frac
    }
}

/// What an oscillator plays
#[derive(Debug, Clone)]
pub enum OscillatorShape {
    Basic(Waveform),
    Custom(PeriodicWave),
}

impl From<Waveform> for OscillatorShape {
    fn from(waveform: Waveform) -> Self {
        OscillatorShape::Basic(waveform)
    }
}

/// Phase-accumulator oscillator
#[derive(Debug, Clone)]
pub struct Oscillator {
    shape: OscillatorShape,
    /// Phase in cycles, `[0, 1)`
    phase: f64,
    sample_rate: f32,
}

impl Oscillator {
    pub fn new(shape: impl Into<OscillatorShape>, sample_rate: f32) -> Result<Self, DspError> {
        if !(sample_rate > 0.0) {
            return Err(DspError::InvalidSampleRate(sample_rate));
        }
        Ok(Self {
            shape: shape.into(),
            phase: 0.0,
            sample_rate,
        })
    }

    pub fn shape(&self) -> &OscillatorShape {
        &self.shape
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    /// Restart the cycle from phase zero
    pub fn reset(&mut self) {
        self.phase = 0.0;
    }

    /// Produce one sample at `frequency` Hz and advance the phase
    #[inline]
    pub fn next_sample(&mut self, frequency: f32) -> f32 {
        let increment = frequency as f64 / self.sample_rate as f64;
        let dt = increment.abs();
        let phase = self.phase;

        let value = match &self.shape {
            OscillatorShape::Basic(Waveform::Sine) => (2.0 * PI * phase as f32).sin(),
            OscillatorShape::Basic(Waveform::Square) => {
                let naive = if phase < 0.5 { 1.0 } else { -1.0 };
                naive + poly_blep(phase, dt) - poly_blep((phase + 0.5).fract(), dt)
            }
            OscillatorShape::Basic(Waveform::Sawtooth) => {
                // Zero crossing rising at phase 0, matching the sine's phase
                let shifted = (phase + 0.5).fract();
                (2.0 * shifted - 1.0) as f32 - poly_blep(shifted, dt)
            }
            OscillatorShape::Basic(Waveform::Triangle) => {
                let shifted = (phase + 0.25).fract() as f32;
                if shifted < 0.5 {
                    4.0 * shifted - 1.0
                } else {
                    3.0 - 4.0 * shifted
                }
            }
            OscillatorShape::Custom(wave) => wave.sample(phase),
        };

        self.phase = (phase + increment).rem_euclid(1.0);
        value
    }

    /// Fill `out` using a per-sample frequency track
    pub fn process(&mut self, frequencies: &[f32], out: &mut [f32]) {
        for (sample, &frequency) in out.iter_mut().zip(frequencies.iter()) {
            *sample = self.next_sample(frequency);
        }
    }
}

/// Polynomial band-limited step residual around a discontinuity at phase 0
#[inline]
fn poly_blep(phase: f64, dt: f64) -> f32 {
    if dt <= 0.0 {
        return 0.0;
    }
    if phase < dt {
        let t = phase / dt;
        (t + t - t * t - 1.0) as f32
    } else if phase > 1.0 - dt {
        let t = (phase - 1.0) / dt;
        (t * t + t + t + 1.0) as f32
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 48000.0;

    fn render(osc: &mut Oscillator, frequency: f32, frames: usize) -> Vec<f32> {
        let freqs = vec![frequency; frames];
        let mut out = vec![0.0; frames];
        osc.process(&freqs, &mut out);
        out
    }

    #[test]
    fn test_sine_starts_at_zero_and_peaks_at_quarter() {
        let mut osc = Oscillator::new(Waveform::Sine, SR).unwrap();
        // 1 kHz at 48 kHz: 48 samples per cycle, quarter cycle at 12
        let out = render(&mut osc, 1000.0, 48);
        assert!(out[0].abs() < 1e-6);
        assert!((out[12] - 1.0).abs() < 1e-4);
        assert!((out[36] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_waveforms_bounded() {
        for waveform in Waveform::ALL {
            let mut osc = Oscillator::new(waveform, SR).unwrap();
            let out = render(&mut osc, 440.0, 4800);
            let peak = out.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
            assert!(peak <= 1.1, "{} peaked at {}", waveform, peak);
            assert!(peak >= 0.9, "{} too quiet: {}", waveform, peak);
        }
    }

    #[test]
    fn test_triangle_shape() {
        let mut osc = Oscillator::new(Waveform::Triangle, SR).unwrap();
        let out = render(&mut osc, 1000.0, 48);
        assert!(out[0].abs() < 1e-6);
        assert!((out[12] - 1.0).abs() < 1e-4);
        assert!((out[36] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_square_mean_is_zero() {
        let mut osc = Oscillator::new(Waveform::Square, SR).unwrap();
        let out = render(&mut osc, 1000.0, 48000);
        let mean: f32 = out.iter().sum::<f32>() / out.len() as f32;
        assert!(mean.abs() < 0.01);
    }

    #[test]
    fn test_waveform_from_str() {
        assert_eq!("sine".parse::<Waveform>().unwrap(), Waveform::Sine);
        assert_eq!("Sawtooth".parse::<Waveform>().unwrap(), Waveform::Sawtooth);
        assert!("noise".parse::<Waveform>().is_err());
        assert_eq!(Waveform::Triangle.to_string(), "triangle");
    }

    #[test]
    fn test_periodic_wave_phase_zero_is_cosine() {
        let wave = PeriodicWave::phase_shifted_cosine(0.0, false).unwrap();
        assert!((wave.sample(0.0) - 1.0).abs() < 1e-6);
        assert!(wave.sample(0.25).abs() < 1e-3);
        assert!((wave.sample(0.5) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_periodic_wave_phase_shift() {
        // cos(θ + π/2) = −sin θ
        let wave = PeriodicWave::phase_shifted_cosine(std::f32::consts::FRAC_PI_2, false).unwrap();
        assert!(wave.sample(0.0).abs() < 1e-3);
        assert!((wave.sample(0.25) + 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_periodic_wave_normalization() {
        let raw = PeriodicWave::new(&[0.0, 0.0], &[0.0, 0.5], false).unwrap();
        assert!((raw.sample(0.25) - 0.5).abs() < 1e-3);

        let normalized = PeriodicWave::new(&[0.0, 0.0], &[0.0, 0.5], true).unwrap();
        assert!((normalized.sample(0.25) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_periodic_wave_rejects_bad_coefficients() {
        assert!(PeriodicWave::new(&[0.0, 1.0], &[0.0], false).is_err());
        assert!(PeriodicWave::new(&[0.0], &[0.0], false).is_err());
        assert!(PeriodicWave::new(&[0.0, f32::NAN], &[0.0, 0.0], false).is_err());
    }

    #[test]
    fn test_custom_oscillator_follows_table() {
        let wave = PeriodicWave::phase_shifted_cosine(0.0, false).unwrap();
        let mut osc = Oscillator::new(OscillatorShape::Custom(wave), SR).unwrap();
        let out = render(&mut osc, 1000.0, 48);
        assert!((out[0] - 1.0).abs() < 1e-4);
        assert!((out[24] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_rejects_bad_sample_rate() {
        assert!(Oscillator::new(Waveform::Sine, 0.0).is_err());
    }
}
