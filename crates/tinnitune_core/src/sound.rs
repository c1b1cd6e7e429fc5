//! Active Sound and Teardown
//!
//! The engine plays at most one sound at a time. Tearing one down fades its
//! gain to zero over the declick window, schedules its sources to stop at the
//! end of the window and releases its units there. Every step is attempted
//! even when an earlier one fails.

use std::sync::Arc;

use parking_lot::Mutex;
use tinnitune_dsp::Waveform;
use tracing::warn;

use crate::chains::{retire_unit, ChainHandle, ModulationParams, NotchPeakFilters, TherapySource};
use crate::equalizer::EqualizerHandle;
use crate::error::{EngineError, EngineResult};
use crate::graph::{AudioGraph, ParamKind, SourceState, UnitId};
use crate::message::SoundKind;

/// Failures collected while tearing a sound down
#[derive(Debug, Default)]
pub struct TeardownReport {
    failures: Vec<(String, EngineError)>,
}

impl TeardownReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the error of a failed step
    pub fn record(&mut self, step: impl Into<String>, result: EngineResult<()>) {
        if let Err(e) = result {
            self.failures.push((step.into(), e));
        }
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[(String, EngineError)] {
        &self.failures
    }

    /// Warn about every failed step
    pub fn log(&self, context: &str) {
        for (step, err) in &self.failures {
            warn!("{}: {} failed: {}", context, step, err);
        }
    }
}

/// Generated protocol behind a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionProtocol {
    BandGap {
        source: TherapySource,
        target_hz: f32,
    },
    Modulation(ModulationParams),
}

/// The sound currently playing
pub enum ActiveSound {
    Tone {
        oscillator: UnitId,
        gain: UnitId,
        frequency: f32,
        waveform: Waveform,
    },
    File {
        source: UnitId,
        gain: UnitId,
        filters: NotchPeakFilters,
        equalizer: EqualizerHandle,
        duration: f64,
    },
    Session {
        protocol: SessionProtocol,
        chain: ChainHandle,
        gain: UnitId,
        filters: Option<NotchPeakFilters>,
    },
}

impl ActiveSound {
    pub fn kind(&self) -> SoundKind {
        match self {
            ActiveSound::Tone { .. } => SoundKind::Tone,
            ActiveSound::File { .. } => SoundKind::File,
            ActiveSound::Session {
                protocol: SessionProtocol::BandGap { .. },
                ..
            } => SoundKind::BandGap,
            ActiveSound::Session {
                protocol: SessionProtocol::Modulation(_),
                ..
            } => SoundKind::Modulation,
        }
    }

    /// Gain stage faded out on teardown
    pub fn gain(&self) -> UnitId {
        match self {
            ActiveSound::Tone { gain, .. }
            | ActiveSound::File { gain, .. }
            | ActiveSound::Session { gain, .. } => *gain,
        }
    }

    /// Fade out over `declick_seconds`, then stop and release every unit.
    ///
    /// Must be called without holding the graph lock.
    pub fn teardown(self, graph: &Arc<Mutex<AudioGraph>>, declick_seconds: f64) -> TeardownReport {
        let mut report = TeardownReport::new();
        let when = {
            let mut g = graph.lock();
            let now = g.current_time();
            let when = now + declick_seconds.max(0.0);
            report.record("fade out", fade_to_silence(&mut g, self.gain(), now, when));
            when
        };

        match self {
            ActiveSound::Tone {
                oscillator, gain, ..
            } => {
                let mut g = graph.lock();
                report.record("stop oscillator", stop_if_running(&mut g, oscillator, when));
                report.record("release oscillator", retire_unit(&mut g, oscillator, when));
                report.record("release tone gain", retire_unit(&mut g, gain, when));
            }
            ActiveSound::File {
                source,
                gain,
                filters,
                mut equalizer,
                ..
            } => {
                report.merge(equalizer.stop_at(when));
                let mut g = graph.lock();
                report.record("stop playback", stop_if_running(&mut g, source, when));
                report.record("release source", retire_unit(&mut g, source, when));
                report.record("release source gain", retire_unit(&mut g, gain, when));
                filters.release_at(&mut g, when, &mut report);
            }
            ActiveSound::Session {
                mut chain,
                gain,
                filters,
                ..
            } => {
                {
                    let mut g = graph.lock();
                    report.record("release session gain", retire_unit(&mut g, gain, when));
                    if let Some(filters) = filters {
                        filters.release_at(&mut g, when, &mut report);
                    }
                }
                report.merge(chain.stop_all_at(when));
            }
        }
        report
    }
}

fn fade_to_silence(graph: &mut AudioGraph, gain: UnitId, now: f64, when: f64) -> EngineResult<()> {
    let timeline = graph.param_mut(gain, ParamKind::Gain)?;
    timeline.cancel_and_hold(now);
    timeline.linear_ramp_to(0.0, when);
    Ok(())
}

/// Buffer sources may already have stopped on their own
fn stop_if_running(graph: &mut AudioGraph, source: UnitId, when: f64) -> EngineResult<()> {
    match graph.source_state(source)? {
        SourceState::Running => graph.stop(source, when),
        _ => Ok(()),
    }
}
