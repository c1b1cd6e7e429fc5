//! Noise Generators
//!
//! White noise is rendered once into a loopable buffer. Pink noise is that
//! buffer coloured by a low shelf and a low-pass stage. Harmonic noise is a
//! bank of slightly detuned oscillators spread over the hearing range.

use rand::Rng;

use crate::filter::FilterParams;

/// Peak amplitude of generated white noise
pub const NOISE_AMPLITUDE: f32 = 0.35;

/// Default length of a generated noise buffer
pub const DEFAULT_NOISE_SECONDS: f32 = 60.0;

/// Partial frequencies of harmonic noise
pub const HARMONIC_FREQUENCIES: [f32; 9] = [
    200.0, 400.0, 800.0, 1600.0, 3200.0, 6400.0, 9600.0, 12000.0, 24000.0,
];

/// Maximum detune of each partial, as a fraction of its frequency (±4 %)
pub const HARMONIC_DETUNE: f32 = 0.08;

pub const PINK_SHELF_HZ: f32 = 500.0;
pub const PINK_SHELF_GAIN_DB: f32 = 6.0;
pub const PINK_LOWPASS_HZ: f32 = 6000.0;
pub const PINK_LOWPASS_Q: f32 = 0.7;

/// Mono white-noise buffer of `sample_rate × duration_seconds` independent
/// uniform samples in `±NOISE_AMPLITUDE`
pub fn white_noise_buffer<R: Rng + ?Sized>(
    rng: &mut R,
    sample_rate: f32,
    duration_seconds: f32,
) -> Vec<f32> {
    let frames = (sample_rate * duration_seconds.max(0.0)) as usize;
    (0..frames)
        .map(|_| rng.gen_range(-1.0_f32..1.0) * NOISE_AMPLITUDE)
        .collect()
}

/// The two colouring stages that turn white noise pink: shelf, then low-pass
pub fn pink_filters() -> [FilterParams; 2] {
    [
        FilterParams::low_shelf(PINK_SHELF_HZ, PINK_SHELF_GAIN_DB),
        FilterParams::low_pass(PINK_LOWPASS_HZ, PINK_LOWPASS_Q),
    ]
}

/// One oscillator of a harmonic-noise bank
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarmonicPartial {
    pub frequency: f32,
    pub gain: f32,
}

/// Detuned partials for harmonic noise, each at gain `1 / n`.
///
/// Partials above `nyquist` are kept; the oscillator aliases them like any
/// other out-of-range frequency.
pub fn harmonic_partials<R: Rng + ?Sized>(rng: &mut R) -> Vec<HarmonicPartial> {
    let gain = 1.0 / HARMONIC_FREQUENCIES.len() as f32;
    HARMONIC_FREQUENCIES
        .iter()
        .map(|&base| {
            let r: f32 = rng.gen();
            HarmonicPartial {
                frequency: base * (1.0 + (r - 0.5) * HARMONIC_DETUNE),
                gain,
            }
        })
        .collect()
}
