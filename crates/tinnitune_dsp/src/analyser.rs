//! Analyser
//!
//! Keeps the most recent window of samples passing through an analyser unit.
//! The equalizer reads RMS from it every control cycle; the master analyser
//! also provides an FFT magnitude spectrum for visual feedback.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::error::DspError;

/// Window of the master analyser
/// 2048 samples at 48kHz = ~42ms window, ~23Hz resolution
pub const DEFAULT_WINDOW: usize = 2048;

/// Number of frequency bins in a spectrum snapshot
/// These are logarithmically spaced to match human hearing
pub const NUM_BINS: usize = 32;

const MIN_WINDOW: usize = 32;
const MAX_WINDOW: usize = 32768;

/// Hann window coefficient
fn hann_window(n: usize, size: usize) -> f32 {
    0.5 * (1.0 - (2.0 * std::f32::consts::PI * n as f32 / (size - 1) as f32).cos())
}

/// FFT state, created on the first spectrum request
struct SpectrumState {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

/// Ring buffer of recent samples
pub struct Analyser {
    ring: Vec<f32>,
    write_pos: usize,
    spectrum: Option<SpectrumState>,
}

impl Analyser {
    pub fn new(window: usize) -> Result<Self, DspError> {
        if !window.is_power_of_two() || !(MIN_WINDOW..=MAX_WINDOW).contains(&window) {
            return Err(DspError::InvalidWindowSize(window));
        }
        Ok(Self {
            ring: vec![0.0; window],
            write_pos: 0,
            spectrum: None,
        })
    }

    pub fn window(&self) -> usize {
        self.ring.len()
    }

    /// Append a block of samples, overwriting the oldest
    ///
    /// # Real-time Safety
    /// No allocations, O(n) time.
    #[inline]
    pub fn push(&mut self, block: &[f32]) {
        let len = self.ring.len();
        for &sample in block {
            self.ring[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % len;
        }
    }

    /// Copy the window into `out`, oldest sample first
    pub fn time_domain(&self, out: &mut [f32]) -> Result<(), DspError> {
        if out.len() != self.ring.len() {
            return Err(DspError::BufferSizeMismatch {
                expected: self.ring.len(),
                got: out.len(),
            });
        }
        let (newer, older) = self.ring.split_at(self.write_pos);
        out[..older.len()].copy_from_slice(older);
        out[older.len()..].copy_from_slice(newer);
        Ok(())
    }

    /// RMS over the whole window
    pub fn rms(&self) -> f32 {
        crate::balance::rms(&self.ring)
    }

    /// Magnitude spectrum in `NUM_BINS` log-spaced bins, each 0.0 to 1.0
    pub fn spectrum(&mut self) -> [f32; NUM_BINS] {
        let size = self.ring.len();
        let state = self.spectrum.get_or_insert_with(|| {
            let mut planner = FftPlanner::new();
            SpectrumState {
                fft: planner.plan_fft_forward(size),
                window: (0..size).map(|i| hann_window(i, size)).collect(),
                scratch: vec![Complex::new(0.0, 0.0); size],
            }
        });

        // Read from ring buffer in correct order (oldest first)
        for i in 0..size {
            let sample = self.ring[(self.write_pos + i) % size];
            state.scratch[i] = Complex::new(sample * state.window[i], 0.0);
        }
        state.fft.process(&mut state.scratch);

        let mut bins = [0.0; NUM_BINS];
        compute_log_spectrum(&state.scratch, &mut bins);
        bins
    }

    pub fn reset(&mut self) {
        self.ring.fill(0.0);
        self.write_pos = 0;
    }
}

/// Convert FFT output to logarithmically-spaced magnitude bins
///
/// Maps the linear FFT bins to logarithmic frequency bands that
/// better match human perception of pitch.
fn compute_log_spectrum(fft_output: &[Complex<f32>], spectrum: &mut [f32; NUM_BINS]) {
    // Only use first half of FFT (positive frequencies)
    let nyquist = fft_output.len() / 2;
    let min_bin = 1; // Skip DC
    let max_bin = nyquist;

    let log_min = (min_bin as f32).ln();
    let log_max = (max_bin as f32).ln();
    let log_step = (log_max - log_min) / NUM_BINS as f32;

    // A full-scale sine with a Hann window peaks near size / 4
    let reference_magnitude = fft_output.len() as f32 / 4.0;

    for (i, spectrum_bin) in spectrum.iter_mut().enumerate() {
        let log_start = log_min + i as f32 * log_step;
        let log_end = log_min + (i + 1) as f32 * log_step;
        let bin_start = (log_start.exp() as usize).min(nyquist - 1);
        let bin_end = (log_end.exp() as usize).min(max_bin);

        let end_idx = (bin_end + 1).min(nyquist).max(bin_start + 1);
        let (sum, count): (f32, usize) = fft_output[bin_start..end_idx]
            .iter()
            .map(|c| c.norm())
            .fold((0.0, 0), |(s, c), mag| (s + mag, c + 1));

        let avg_mag = if count > 0 { sum / count as f32 } else { 0.0 };

        let db = 20.0 * (avg_mag / reference_magnitude).max(1e-10).log10();

        // Map -60dB..0dB to 0.0..1.0
        *spectrum_bin = ((db + 60.0) / 60.0).clamp(0.0, 1.0);
    }
}
