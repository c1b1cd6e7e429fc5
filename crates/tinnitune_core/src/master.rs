//! Master Output Chain
//!
//! ```text
//! limiter ──▶ master gain ──▶ analyser ──▶ destination
//! ```
//!
//! Built once per engine context. Every therapy chain ends at the limiter.

use tinnitune_dsp::{db_to_linear, NUM_BINS};
use tracing::debug;

use crate::config::MasterConfig;
use crate::error::EngineResult;
use crate::graph::{AudioGraph, Endpoint, ParamKind, UnitId};
use crate::sound::TeardownReport;

/// Ramp used when no explicit master ramp is given
pub const DEFAULT_GAIN_RAMP_SECONDS: f64 = 0.05;

/// Handles of the fixed master topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterChain {
    pub limiter: UnitId,
    pub gain: UnitId,
    pub analyser: UnitId,
}

impl MasterChain {
    pub fn build(graph: &mut AudioGraph, config: &MasterConfig) -> EngineResult<Self> {
        let mut created = Vec::with_capacity(3);
        let result = Self::build_units(graph, config, &mut created);
        if result.is_err() {
            let mut report = TeardownReport::new();
            for id in created {
                report.record(format!("roll back master unit {}", id), graph.release(id));
            }
            report.log("master chain build");
        }
        result
    }

    fn build_units(
        graph: &mut AudioGraph,
        config: &MasterConfig,
        created: &mut Vec<UnitId>,
    ) -> EngineResult<Self> {
        let limiter = graph.add_compressor(config.limiter)?;
        created.push(limiter);
        let gain = graph.add_gain(db_to_linear(config.default_gain_db))?;
        created.push(gain);
        let analyser = graph.add_analyser(config.analyser_window)?;
        created.push(analyser);

        graph.connect(limiter, Endpoint::Input(gain))?;
        graph.connect(gain, Endpoint::Input(analyser))?;
        graph.connect(analyser, Endpoint::Input(graph.destination()))?;

        debug!(
            "Master chain built: limiter {}, gain {}, analyser {}",
            limiter, gain, analyser
        );
        Ok(Self {
            limiter,
            gain,
            analyser,
        })
    }

    /// Where therapy chains connect
    pub fn input(&self) -> Endpoint {
        Endpoint::Input(self.limiter)
    }

    /// Exponential approach to `db`, time constant `ramp_seconds`.
    /// Pending automation (a running fade) is replaced.
    pub fn set_gain_db(&self, graph: &mut AudioGraph, db: f32, ramp_seconds: f64) -> EngineResult<()> {
        let now = graph.current_time();
        let timeline = graph.param_mut(self.gain, ParamKind::Gain)?;
        timeline.cancel_and_hold(now);
        timeline.set_target_at(db_to_linear(db), now, ramp_seconds);
        Ok(())
    }

    /// Linear fade from the current value to `target_db` over `duration_seconds`
    pub fn fade_gain(
        &self,
        graph: &mut AudioGraph,
        target_db: f32,
        duration_seconds: f64,
    ) -> EngineResult<()> {
        let now = graph.current_time();
        let timeline = graph.param_mut(self.gain, ParamKind::Gain)?;
        timeline.cancel_and_hold(now);
        timeline.linear_ramp_to(db_to_linear(target_db), now + duration_seconds.max(0.0));
        Ok(())
    }

    /// Current linear master gain
    pub fn gain(&self, graph: &AudioGraph) -> EngineResult<f32> {
        graph.param_value(self.gain, ParamKind::Gain)
    }

    pub fn spectrum(&self, graph: &mut AudioGraph) -> EngineResult<[f32; NUM_BINS]> {
        graph.analyser_spectrum(self.analyser)
    }

    pub fn rms(&self, graph: &AudioGraph) -> EngineResult<f32> {
        graph.analyser_rms(self.analyser)
    }
}
