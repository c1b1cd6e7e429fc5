//! Adaptive Spectral Equalizer
//!
//! ```text
//!          ┌─▶ band-pass 0.75·f ─▶ gain low ─▶ analyser ─┐
//! input ───┤                                             ├─▶ output
//!          └─▶ band-pass 1.5·f ──▶ gain high ─▶ analyser ─┘
//! ```
//!
//! A control thread measures both analysers at a fixed cadence and moves the
//! band gains toward equal loudness (see [`BandBalance::compute`]).

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tinnitune_dsp::{BandBalance, FilterParams};
use tracing::{debug, warn};

use crate::chains::{retire_unit, ChainBuilder};
use crate::config::EqualizerConfig;
use crate::error::{EngineError, EngineResult};
use crate::graph::{AudioGraph, Endpoint, ParamKind, UnitId};
use crate::sound::TeardownReport;

/// Band centers relative to the target frequency
pub const LOW_BAND_RATIO: f32 = 0.75;
pub const HIGH_BAND_RATIO: f32 = 1.5;

pub const BAND_Q: f32 = 1.0;

#[derive(Debug, Clone, Copy)]
struct BandUnits {
    gain_low: UnitId,
    gain_high: UnitId,
    analyser_low: UnitId,
    analyser_high: UnitId,
}

/// Running equalizer; stopping it ends the control loop and releases its units
pub struct EqualizerHandle {
    output: UnitId,
    bands: BandUnits,
    units: Vec<UnitId>,
    balance: Arc<Mutex<BandBalance>>,
    stop_sender: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    graph: Arc<Mutex<AudioGraph>>,
}

/// Split `input` into two bands around `target_hz` and keep them balanced
pub fn equalize_spectrum(
    graph: &Arc<Mutex<AudioGraph>>,
    input: UnitId,
    target_hz: f32,
    config: &EqualizerConfig,
) -> EngineResult<EqualizerHandle> {
    if !(target_hz > 0.0) || !target_hz.is_finite() {
        return Err(EngineError::InvalidParameter(format!(
            "equalizer target must be a positive frequency, got {}",
            target_hz
        )));
    }
    if !(config.control_rate_hz > 0.0) {
        return Err(EngineError::InvalidParameter(format!(
            "equalizer control rate must be positive, got {}",
            config.control_rate_hz
        )));
    }

    let (output, bands, units) = {
        let mut guard = graph.lock();
        let mut builder = ChainBuilder::new(&mut guard);
        let result = (|| -> EngineResult<(UnitId, BandUnits)> {
            let output = builder.create(|g| g.add_gain(1.0))?;
            let (gain_low, analyser_low) =
                build_band(&mut builder, input, target_hz * LOW_BAND_RATIO, output, config)?;
            let (gain_high, analyser_high) =
                build_band(&mut builder, input, target_hz * HIGH_BAND_RATIO, output, config)?;
            Ok((
                output,
                BandUnits {
                    gain_low,
                    gain_high,
                    analyser_low,
                    analyser_high,
                },
            ))
        })();

        match result {
            Ok((output, bands)) => (output, bands, builder.into_parts().0),
            Err(e) => {
                builder.abort().log("equalizer build");
                return Err(e);
            }
        }
    };

    let balance = Arc::new(Mutex::new(BandBalance::default()));
    let (stop_sender, stop_receiver) = bounded::<()>(1);
    let period = Duration::from_secs_f32(1.0 / config.control_rate_hz);
    let bounds = config.gain_bounds;
    let graph_clone = Arc::clone(graph);
    let balance_clone = Arc::clone(&balance);

    let spawned = thread::Builder::new()
        .name("tinnitune-eq".into())
        .spawn(move || {
            debug!("Equalizer loop started ({:?} period)", period);
            loop {
                match stop_receiver.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                match control_cycle(&graph_clone, &bands, bounds) {
                    Ok(state) => *balance_clone.lock() = state,
                    Err(e) => {
                        warn!("Equalizer loop stopped: {}", e);
                        break;
                    }
                }
            }
            debug!("Equalizer loop finished");
        });

    let thread = match spawned {
        Ok(thread) => thread,
        Err(e) => {
            let mut report = TeardownReport::new();
            let mut g = graph.lock();
            for &id in units.iter().rev() {
                report.record(format!("roll back equalizer unit {}", id), g.release(id));
            }
            report.log("equalizer thread spawn");
            return Err(EngineError::InvalidState(format!(
                "failed to spawn equalizer thread: {}",
                e
            )));
        }
    };

    Ok(EqualizerHandle {
        output,
        bands,
        units,
        balance,
        stop_sender: Some(stop_sender),
        thread: Some(thread),
        graph: Arc::clone(graph),
    })
}

/// `input → band-pass → gain → analyser → output`
fn build_band(
    builder: &mut ChainBuilder<'_>,
    input: UnitId,
    center_hz: f32,
    output: UnitId,
    config: &EqualizerConfig,
) -> EngineResult<(UnitId, UnitId)> {
    let filter = builder.create(|g| g.add_filter(FilterParams::band_pass(center_hz, BAND_Q)))?;
    let gain = builder.create(|g| g.add_gain(1.0))?;
    let analyser = builder.create(|g| g.add_analyser(config.analyser_window))?;

    builder.connect(input, Endpoint::Input(filter))?;
    builder.connect(filter, Endpoint::Input(gain))?;
    builder.connect(gain, Endpoint::Input(analyser))?;
    builder.connect(analyser, Endpoint::Input(output))?;
    Ok((gain, analyser))
}

/// Measure both bands and apply the new gains
fn control_cycle(
    graph: &Mutex<AudioGraph>,
    bands: &BandUnits,
    bounds: Option<(f32, f32)>,
) -> EngineResult<BandBalance> {
    let mut g = graph.lock();
    let rms_low = g.analyser_rms(bands.analyser_low)?;
    let rms_high = g.analyser_rms(bands.analyser_high)?;
    let balance = BandBalance::compute(rms_low, rms_high, bounds);

    g.set_param_now(bands.gain_low, ParamKind::Gain, balance.gain_low)?;
    g.set_param_now(bands.gain_high, ParamKind::Gain, balance.gain_high)?;
    Ok(balance)
}

impl EqualizerHandle {
    /// Balanced signal, to be connected downstream
    pub fn output(&self) -> UnitId {
        self.output
    }

    pub fn units(&self) -> &[UnitId] {
        &self.units
    }

    /// Latest controller state
    pub fn balance(&self) -> BandBalance {
        *self.balance.lock()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// End the control loop and release every unit now
    pub fn stop(&mut self) -> TeardownReport {
        let now = self.graph.lock().current_time();
        self.stop_at(now)
    }

    /// End the control loop now and release the units at `when`.
    ///
    /// Must be called without holding the graph lock.
    pub fn stop_at(&mut self, when: f64) -> TeardownReport {
        let mut report = TeardownReport::new();
        let Some(handle) = self.thread.take() else {
            return report;
        };

        if let Some(sender) = self.stop_sender.take() {
            let _ = sender.send(());
        }
        if handle.join().is_err() {
            report.record(
                "join equalizer loop",
                Err(EngineError::InvalidState("equalizer thread panicked".into())),
            );
        }

        let mut g = self.graph.lock();
        for &unit in &self.units {
            report.record(
                format!("release equalizer unit {}", unit),
                retire_unit(&mut g, unit, when),
            );
        }
        debug!("Equalizer stopped, {} units released", self.units.len());
        report
    }
}

impl Drop for EqualizerHandle {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop().log("dropped equalizer");
        }
    }
}
