//! Therapy Chains
//!
//! Builders for the sub-graphs the therapy protocols are made of. Each builder
//! either returns a handle owning every unit it created or, on failure,
//! releases whatever it had created so the graph is left as it was.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tinnitune_dsp::{
    harmonic_partials, pink_filters, white_noise_buffer, BandGapParams, HarmonicPartial,
    OscillatorShape, PeriodicWave, Waveform, DEFAULT_NOISE_SECONDS,
};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::graph::{AudioGraph, Endpoint, ParamKind, SourceState, UnitId};
use crate::sound::TeardownReport;

/// Generated material a band-gap session can be built on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TherapySource {
    White,
    Pink,
    Sine,
    Square,
    Triangle,
    Sawtooth,
}

impl TherapySource {
    pub const ALL: [TherapySource; 6] = [
        TherapySource::White,
        TherapySource::Pink,
        TherapySource::Sine,
        TherapySource::Square,
        TherapySource::Triangle,
        TherapySource::Sawtooth,
    ];

    /// Waveform of the harmonic-noise bank, `None` for the noise buffers
    pub fn waveform(&self) -> Option<Waveform> {
        match self {
            TherapySource::White | TherapySource::Pink => None,
            TherapySource::Sine => Some(Waveform::Sine),
            TherapySource::Square => Some(Waveform::Square),
            TherapySource::Triangle => Some(Waveform::Triangle),
            TherapySource::Sawtooth => Some(Waveform::Sawtooth),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TherapySource::White => "white",
            TherapySource::Pink => "pink",
            TherapySource::Sine => "sine",
            TherapySource::Square => "square",
            TherapySource::Triangle => "triangle",
            TherapySource::Sawtooth => "sawtooth",
        }
    }
}

impl fmt::Display for TherapySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TherapySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown therapy source '{}'", s))
    }
}

fn default_amplitude() -> f32 {
    1.0
}

fn default_modulation_hz() -> f32 {
    10.0
}

/// Ring-modulation settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModulationParams {
    pub carrier_hz: f32,
    #[serde(default = "default_amplitude")]
    pub carrier_amplitude: f32,
    #[serde(default = "default_modulation_hz")]
    pub modulation_hz: f32,
    #[serde(default = "default_amplitude")]
    pub modulation_depth: f32,
    /// Phase offset of the modulator in radians
    #[serde(default)]
    pub phase_radians: f32,
}

impl ModulationParams {
    /// Full-depth 10 Hz modulation of a unit-amplitude carrier
    pub fn new(carrier_hz: f32) -> Self {
        Self {
            carrier_hz,
            carrier_amplitude: default_amplitude(),
            modulation_hz: default_modulation_hz(),
            modulation_depth: default_amplitude(),
            phase_radians: 0.0,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let values = [
            self.carrier_hz,
            self.carrier_amplitude,
            self.modulation_hz,
            self.modulation_depth,
            self.phase_radians,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::InvalidParameter(format!(
                "modulation parameters must be finite: {:?}",
                self
            )));
        }
        if self.carrier_hz <= 0.0 || self.modulation_hz < 0.0 {
            return Err(EngineError::InvalidParameter(format!(
                "modulation frequencies out of range: carrier {} Hz, modulator {} Hz",
                self.carrier_hz, self.modulation_hz
            )));
        }
        Ok(())
    }
}

/// Release `id` now, or once the clock reaches `when`
pub(crate) fn retire_unit(graph: &mut AudioGraph, id: UnitId, when: f64) -> EngineResult<()> {
    if when <= graph.current_time() {
        graph.release(id)
    } else {
        graph.release_at(id, when)
    }
}

/// Tracks units created while building a chain
pub(crate) struct ChainBuilder<'g> {
    graph: &'g mut AudioGraph,
    units: Vec<UnitId>,
    sources: Vec<UnitId>,
}

impl<'g> ChainBuilder<'g> {
    pub(crate) fn new(graph: &'g mut AudioGraph) -> Self {
        Self {
            graph,
            units: Vec::new(),
            sources: Vec::new(),
        }
    }

    pub(crate) fn create(
        &mut self,
        make: impl FnOnce(&mut AudioGraph) -> EngineResult<UnitId>,
    ) -> EngineResult<UnitId> {
        let id = make(&mut *self.graph)?;
        self.units.push(id);
        Ok(id)
    }

    pub(crate) fn connect(&mut self, from: UnitId, to: Endpoint) -> EngineResult<()> {
        self.graph.connect(from, to)
    }

    /// Start a created source now
    pub(crate) fn start(&mut self, source: UnitId) -> EngineResult<()> {
        let now = self.graph.current_time();
        self.graph.start(source, now)?;
        self.sources.push(source);
        Ok(())
    }

    pub(crate) fn graph(&mut self) -> &mut AudioGraph {
        &mut *self.graph
    }

    pub(crate) fn into_parts(self) -> (Vec<UnitId>, Vec<UnitId>) {
        (self.units, self.sources)
    }

    /// Release everything created so far
    pub(crate) fn abort(self) -> TeardownReport {
        let mut report = TeardownReport::new();
        for &id in self.units.iter().rev() {
            report.record(format!("roll back unit {}", id), self.graph.release(id));
        }
        report
    }
}

/// Stop handle of a built chain
///
/// Owns the units the chain created. `stop_all` stops its sources and releases
/// its units; it runs at most once and also runs on drop.
pub struct ChainHandle {
    output: UnitId,
    sources: Vec<UnitId>,
    units: Vec<UnitId>,
    graph: Arc<Mutex<AudioGraph>>,
    stopped: bool,
}

impl ChainHandle {
    /// Build a chain under one graph lock. `build` returns the output unit.
    pub(crate) fn build<F>(graph: &Arc<Mutex<AudioGraph>>, build: F) -> EngineResult<Self>
    where
        F: FnOnce(&mut ChainBuilder<'_>) -> EngineResult<UnitId>,
    {
        let mut guard = graph.lock();
        let mut builder = ChainBuilder::new(&mut guard);
        match build(&mut builder) {
            Ok(output) => {
                let (units, sources) = builder.into_parts();
                debug!("Chain built: output {}, {} units", output, units.len());
                Ok(Self {
                    output,
                    sources,
                    units,
                    graph: Arc::clone(graph),
                    stopped: false,
                })
            }
            Err(e) => {
                builder.abort().log("chain build");
                Err(e)
            }
        }
    }

    /// Unit to connect downstream
    pub fn output(&self) -> UnitId {
        self.output
    }

    pub fn sources(&self) -> &[UnitId] {
        &self.sources
    }

    pub fn units(&self) -> &[UnitId] {
        &self.units
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stop and release everything immediately
    pub fn stop_all(&mut self) -> TeardownReport {
        let now = self.graph.lock().current_time();
        self.stop_all_at(now)
    }

    /// Stop sources and release units at `when` on the graph clock
    pub fn stop_all_at(&mut self, when: f64) -> TeardownReport {
        let mut report = TeardownReport::new();
        if self.stopped {
            return report;
        }
        self.stopped = true;

        let mut graph = self.graph.lock();
        for &source in &self.sources {
            match graph.source_state(source) {
                Ok(SourceState::Running) => {
                    report.record(format!("stop source {}", source), graph.stop(source, when))
                }
                Ok(_) => {}
                Err(e) => report.record(format!("stop source {}", source), Err(e)),
            }
        }
        for &unit in &self.units {
            report.record(
                format!("release unit {}", unit),
                retire_unit(&mut graph, unit, when),
            );
        }
        debug!("Chain {} stopped, {} units released", self.output, self.units.len());
        report
    }
}

impl Drop for ChainHandle {
    fn drop(&mut self) {
        if !self.stopped {
            self.stop_all().log("dropped chain");
        }
    }
}

/// Sample data of a generated source, prepared before the graph is locked
#[derive(Debug, Clone)]
pub(crate) enum SourceMaterial {
    /// Looping noise buffer at the graph rate, optionally coloured pink
    Noise { samples: Arc<[f32]>, pink: bool },
    /// Oscillator bank of one waveform
    Harmonic {
        waveform: Waveform,
        partials: Vec<HarmonicPartial>,
    },
}

impl SourceMaterial {
    pub(crate) fn generate<R: Rng + ?Sized>(
        kind: TherapySource,
        sample_rate: f32,
        rng: &mut R,
    ) -> Self {
        match kind.waveform() {
            Some(waveform) => SourceMaterial::Harmonic {
                waveform,
                partials: harmonic_partials(rng),
            },
            None => SourceMaterial::Noise {
                samples: white_noise_buffer(rng, sample_rate, DEFAULT_NOISE_SECONDS).into(),
                pink: kind == TherapySource::Pink,
            },
        }
    }
}

/// Build a generated therapy source and start it.
///
/// The noise buffer is generated before the graph lock is taken, so the
/// render callback is only held up by the unit insertions.
pub fn build_therapy_source<R: Rng + ?Sized>(
    graph: &Arc<Mutex<AudioGraph>>,
    kind: TherapySource,
    rng: &mut R,
) -> EngineResult<ChainHandle> {
    let sample_rate = graph.lock().sample_rate();
    let material = SourceMaterial::generate(kind, sample_rate, rng);
    build_source_chain(graph, material)
}

pub(crate) fn build_source_chain(
    graph: &Arc<Mutex<AudioGraph>>,
    material: SourceMaterial,
) -> EngineResult<ChainHandle> {
    ChainHandle::build(graph, |b| match material {
        SourceMaterial::Harmonic { waveform, partials } => harmonic_noise(b, waveform, &partials),
        SourceMaterial::Noise { samples, pink } => {
            let sample_rate = b.graph().sample_rate();
            let noise = b.create(|g| g.add_buffer_source(samples, sample_rate, true))?;

            let mut output = noise;
            if pink {
                for params in pink_filters() {
                    let stage = b.create(|g| g.add_filter(params))?;
                    b.connect(output, Endpoint::Input(stage))?;
                    output = stage;
                }
            }
            b.start(noise)?;
            Ok(output)
        }
    })
}

/// Detuned oscillator bank summed into one gain stage
fn harmonic_noise(
    b: &mut ChainBuilder<'_>,
    waveform: Waveform,
    partials: &[HarmonicPartial],
) -> EngineResult<UnitId> {
    let sum = b.create(|g| g.add_gain(1.0))?;
    for partial in partials {
        let oscillator = b.create(|g| g.add_oscillator(waveform, partial.frequency))?;
        let gain = b.create(|g| g.add_gain(partial.gain))?;
        b.connect(oscillator, Endpoint::Input(gain))?;
        b.connect(gain, Endpoint::Input(sum))?;
        b.start(oscillator)?;
    }
    Ok(sum)
}

/// Carrier ring-modulated by a phase-shifted low-frequency cosine
///
/// ```text
/// carrier ──▶ carrier gain ──▶ multiplier (gain 0) ──▶ output
/// modulator ──▶ depth gain ──────────▲ (gain param)
/// ```
pub fn build_modulation_chain(
    graph: &Arc<Mutex<AudioGraph>>,
    params: &ModulationParams,
) -> EngineResult<ChainHandle> {
    params.validate()?;
    let wave = PeriodicWave::phase_shifted_cosine(params.phase_radians, false)?;

    ChainHandle::build(graph, |b| {
        let carrier = b.create(|g| g.add_oscillator(Waveform::Sine, params.carrier_hz))?;
        let carrier_gain = b.create(|g| g.add_gain(params.carrier_amplitude))?;
        let multiplier = b.create(|g| g.add_gain(0.0))?;
        let modulator = b.create(|g| {
            g.add_oscillator(OscillatorShape::Custom(wave), params.modulation_hz)
        })?;
        let depth = b.create(|g| g.add_gain(params.modulation_depth))?;

        b.connect(carrier, Endpoint::Input(carrier_gain))?;
        b.connect(carrier_gain, Endpoint::Input(multiplier))?;
        b.connect(modulator, Endpoint::Input(depth))?;
        b.connect(depth, Endpoint::Param(multiplier, ParamKind::Gain))?;

        b.start(carrier)?;
        b.start(modulator)?;
        Ok(multiplier)
    })
}

/// The three band-gap filter stages of a notch/peak chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotchPeakFilters {
    pub notch: UnitId,
    pub low_peak: UnitId,
    pub high_peak: UnitId,
    pub params: BandGapParams,
}

impl NotchPeakFilters {
    pub fn units(&self) -> [UnitId; 3] {
        [self.notch, self.low_peak, self.high_peak]
    }

    /// Release the three stages at `when`, recording failures
    pub fn release_at(&self, graph: &mut AudioGraph, when: f64, report: &mut TeardownReport) {
        for unit in self.units() {
            report.record(
                format!("release filter {}", unit),
                retire_unit(graph, unit, when),
            );
        }
    }
}

/// Cascade `source → notch → low peak → high peak → output`
pub fn build_notch_peak_chain(
    graph: &mut AudioGraph,
    source: UnitId,
    target_hz: f32,
    output: Endpoint,
) -> EngineResult<NotchPeakFilters> {
    let params = BandGapParams::for_target(target_hz)?;
    let mut builder = ChainBuilder::new(graph);

    let result = (|| -> EngineResult<NotchPeakFilters> {
        let [notch_stage, low_stage, high_stage] = params.stages();
        let notch = builder.create(|g| g.add_filter(notch_stage))?;
        let low_peak = builder.create(|g| g.add_filter(low_stage))?;
        let high_peak = builder.create(|g| g.add_filter(high_stage))?;

        builder.connect(source, Endpoint::Input(notch))?;
        builder.connect(notch, Endpoint::Input(low_peak))?;
        builder.connect(low_peak, Endpoint::Input(high_peak))?;
        builder.connect(high_peak, output)?;
        Ok(NotchPeakFilters {
            notch,
            low_peak,
            high_peak,
            params,
        })
    })();

    if result.is_err() {
        builder.abort().log("notch/peak chain build");
    }
    result
}
