//! Audio Graph
//!
//! Directed graph of processing units rendered in fixed quanta. Control
//! operations (create, connect, schedule, release) run on the caller's
//! thread; `render` runs on the real-time thread. Both go through the same
//! `Mutex`, so mutations take effect at the next quantum boundary.
//!
//! # Render model
//!
//! ```text
//!  sources ──▶ filters/gains/analysers ──▶ destination ──▶ output
//!                  ▲
//!   modulators ────┘ (a-rate param inputs, summed into the intrinsic value)
//! ```
//!
//! The processing order is a topological plan rebuilt on every structural
//! mutation, never on the render thread. Every unit owns a preallocated
//! output block; rendering does not allocate.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tinnitune_dsp::{
    Analyser, AudioProcessor, BiquadFilter, Compressor, CompressorParams, FilterParams,
    Oscillator, OscillatorShape, ParamTimeline, ProcessContext, NUM_BINS,
};

use crate::error::{EngineError, EngineResult};
use crate::message::Event;

/// Frames per render quantum
pub const RENDER_QUANTUM: usize = 128;

/// Opaque handle to one unit in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub(crate) u64);

impl UnitId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capability tag of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Source,
    Filter,
    Gain,
    Analyser,
    Sink,
}

/// Automatable parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Gain,
    Frequency,
}

/// Where a connection lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Signal input, summed with other inputs
    Input(UnitId),
    /// Audio-rate modulation of a parameter
    Param(UnitId, ParamKind),
}

impl Endpoint {
    pub fn unit(&self) -> UnitId {
        match *self {
            Endpoint::Input(id) | Endpoint::Param(id, _) => id,
        }
    }
}

/// Playback state of a source unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceState {
    Initialized,
    Running,
    Stopped,
}

struct BufferPlayback {
    samples: Arc<[f32]>,
    /// Source frames advanced per output frame
    step: f64,
    position: f64,
    looping: bool,
}

impl BufferPlayback {
    /// Linearly interpolated read; `None` once a one-shot buffer is exhausted
    #[inline]
    fn next_sample(&mut self) -> Option<f32> {
        let len = self.samples.len();
        if len == 0 {
            return None;
        }
        if self.position >= len as f64 {
            if !self.looping {
                return None;
            }
            self.position %= len as f64;
        }

        let index = self.position as usize;
        let frac = (self.position - index as f64) as f32;
        let current = self.samples[index];
        let next = if index + 1 < len {
            self.samples[index + 1]
        } else if self.looping {
            self.samples[0]
        } else {
            current
        };

        self.position += self.step;
        Some(current + (next - current) * frac)
    }
}

enum Node {
    Oscillator {
        oscillator: Oscillator,
        frequency: ParamTimeline,
    },
    Buffer(BufferPlayback),
    Processor(Box<dyn AudioProcessor>),
    Gain(ParamTimeline),
    Analyser(Analyser),
    Destination,
}

#[derive(Debug, Clone, Copy)]
struct Schedule {
    state: SourceState,
    start_frame: Option<u64>,
    stop_frame: Option<u64>,
}

impl Schedule {
    fn new() -> Self {
        Self {
            state: SourceState::Initialized,
            start_frame: None,
            stop_frame: None,
        }
    }

    /// Frames of `[block_start, block_start + len)` during which the source plays
    fn active_range(&self, block_start: u64, len: usize) -> (usize, usize) {
        let block_end = block_start + len as u64;
        let Some(start) = self.start_frame else {
            return (0, 0);
        };
        let stop = self.stop_frame.unwrap_or(u64::MAX);
        let from = start.max(block_start).min(block_end);
        let to = stop.min(block_end).max(from);
        ((from - block_start) as usize, (to - block_start) as usize)
    }
}

struct Unit {
    kind: UnitKind,
    node: Node,
    schedule: Option<Schedule>,
    output: Vec<f32>,
    release_frame: Option<u64>,
    expired: bool,
}

impl Unit {
    fn new(kind: UnitKind, node: Node) -> Self {
        let schedule = (kind == UnitKind::Source).then(Schedule::new);
        Self {
            kind,
            node,
            schedule,
            output: vec![0.0; RENDER_QUANTUM],
            release_frame: None,
            expired: false,
        }
    }

    fn is_live(&self) -> bool {
        self.release_frame.is_none() && !self.expired
    }
}

/// Per-block input sums handed to a unit
struct RenderInputs<'a> {
    signal: &'a [f32],
    gain_mod: &'a [f32],
    frequency_mod: &'a [f32],
}

struct RenderClock<'a> {
    block_start: u64,
    sample_rate: f32,
    events: &'a Sender<Event>,
}

impl Unit {
    fn render(
        &mut self,
        id: UnitId,
        inputs: &RenderInputs<'_>,
        clock: &RenderClock<'_>,
        param_values: &mut [f32],
    ) {
        if self.expired {
            self.output.fill(0.0);
            return;
        }

        let block_time = clock.block_start as f64 / clock.sample_rate as f64;
        let context = ProcessContext::new(clock.sample_rate, RENDER_QUANTUM);
        let output = &mut self.output;

        match &mut self.node {
            Node::Oscillator {
                oscillator,
                frequency,
            } => {
                let (from, to) = self
                    .schedule
                    .map_or((0, 0), |s| s.active_range(clock.block_start, RENDER_QUANTUM));
                frequency.compact(block_time);
                frequency.fill(block_time, clock.sample_rate, param_values);
                output.fill(0.0);
                for i in from..to {
                    output[i] = oscillator.next_sample(param_values[i] + inputs.frequency_mod[i]);
                }
            }
            Node::Buffer(playback) => {
                let (from, to) = self
                    .schedule
                    .map_or((0, 0), |s| s.active_range(clock.block_start, RENDER_QUANTUM));
                output.fill(0.0);
                for i in from..to {
                    match playback.next_sample() {
                        Some(sample) => output[i] = sample,
                        None => {
                            if let Some(schedule) = self.schedule.as_mut() {
                                if schedule.state != SourceState::Stopped {
                                    schedule.state = SourceState::Stopped;
                                    let _ = clock.events.try_send(Event::SourceEnded { unit: id });
                                }
                            }
                            break;
                        }
                    }
                }
            }
            Node::Processor(processor) => {
                output.copy_from_slice(inputs.signal);
                processor.process(output, &context);
            }
            Node::Gain(gain) => {
                gain.compact(block_time);
                gain.fill(block_time, clock.sample_rate, param_values);
                for i in 0..RENDER_QUANTUM {
                    output[i] = inputs.signal[i] * (param_values[i] + inputs.gain_mod[i]);
                }
            }
            Node::Analyser(analyser) => {
                output.copy_from_slice(inputs.signal);
                analyser.push(output);
            }
            Node::Destination => {
                output.copy_from_slice(inputs.signal);
            }
        }

        // Scheduled stop reached within this block
        if let Some(schedule) = self.schedule.as_mut() {
            let block_end = clock.block_start + RENDER_QUANTUM as u64;
            if schedule.stop_frame.is_some_and(|stop| stop <= block_end) {
                schedule.state = SourceState::Stopped;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    from: UnitId,
    to: Endpoint,
}

/// One step of the render plan
struct PlanEntry {
    id: UnitId,
    signal: Vec<UnitId>,
    gain_mod: Vec<UnitId>,
    frequency_mod: Vec<UnitId>,
}

/// The render graph
pub struct AudioGraph {
    sample_rate: f32,
    frame: u64,
    next_id: u64,
    destination: UnitId,
    units: HashMap<UnitId, Unit>,
    edges: Vec<Edge>,
    plan: Vec<PlanEntry>,
    has_expired: bool,

    // Render scratch, sized once
    signal: Vec<f32>,
    gain_mod: Vec<f32>,
    frequency_mod: Vec<f32>,
    param_values: Vec<f32>,
    rendered: Vec<f32>,
    rendered_pos: usize,

    events: Sender<Event>,
}

impl AudioGraph {
    /// Create an empty graph holding only the destination unit
    pub fn new(sample_rate: f32, events: Sender<Event>) -> EngineResult<Self> {
        if !(sample_rate > 0.0) {
            return Err(EngineError::InvalidParameter(format!(
                "sample rate must be positive, got {}",
                sample_rate
            )));
        }

        let destination = UnitId(0);
        let mut units = HashMap::new();
        units.insert(destination, Unit::new(UnitKind::Sink, Node::Destination));

        let mut graph = Self {
            sample_rate,
            frame: 0,
            next_id: 1,
            destination,
            units,
            edges: Vec::new(),
            plan: Vec::new(),
            has_expired: false,
            signal: vec![0.0; RENDER_QUANTUM],
            gain_mod: vec![0.0; RENDER_QUANTUM],
            frequency_mod: vec![0.0; RENDER_QUANTUM],
            param_values: vec![0.0; RENDER_QUANTUM],
            rendered: vec![0.0; RENDER_QUANTUM],
            rendered_pos: RENDER_QUANTUM,
            events,
        };
        graph.rebuild_plan()?;
        Ok(graph)
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Frames rendered so far
    pub fn current_frame(&self) -> u64 {
        self.frame
    }

    /// Graph clock in seconds; scheduling at this time takes effect at the
    /// next quantum
    pub fn current_time(&self) -> f64 {
        self.frame as f64 / self.sample_rate as f64
    }

    /// The physical output
    pub fn destination(&self) -> UnitId {
        self.destination
    }

    /// Units that are neither released nor scheduled for release
    pub fn unit_count(&self) -> usize {
        self.units.values().filter(|u| u.is_live()).count()
    }

    pub fn contains(&self, id: UnitId) -> bool {
        self.units.contains_key(&id)
    }

    pub fn kind(&self, id: UnitId) -> EngineResult<UnitKind> {
        Ok(self.unit(id)?.kind)
    }

    fn unit(&self, id: UnitId) -> EngineResult<&Unit> {
        self.units.get(&id).ok_or(EngineError::UnknownUnit(id.0))
    }

    fn unit_mut(&mut self, id: UnitId) -> EngineResult<&mut Unit> {
        self.units.get_mut(&id).ok_or(EngineError::UnknownUnit(id.0))
    }

    fn insert(&mut self, kind: UnitKind, node: Node) -> EngineResult<UnitId> {
        self.sweep_expired()?;
        let id = UnitId(self.next_id);
        self.next_id += 1;
        self.units.insert(id, Unit::new(kind, node));
        self.rebuild_plan()?;
        Ok(id)
    }

    fn frame_at(&self, time: f64) -> u64 {
        let frame = (time.max(0.0) * self.sample_rate as f64).round() as u64;
        frame.max(self.frame)
    }

    // ---- unit creation -------------------------------------------------

    pub fn add_oscillator(
        &mut self,
        shape: impl Into<OscillatorShape>,
        frequency: f32,
    ) -> EngineResult<UnitId> {
        if !frequency.is_finite() {
            return Err(EngineError::InvalidParameter(format!(
                "oscillator frequency must be finite, got {}",
                frequency
            )));
        }
        let oscillator = Oscillator::new(shape, self.sample_rate)?;
        self.insert(
            UnitKind::Source,
            Node::Oscillator {
                oscillator,
                frequency: ParamTimeline::new(frequency),
            },
        )
    }

    /// Mono buffer player. `buffer_rate` is the rate the samples were
    /// recorded at; playback resamples linearly to the graph rate.
    pub fn add_buffer_source(
        &mut self,
        samples: Arc<[f32]>,
        buffer_rate: f32,
        looping: bool,
    ) -> EngineResult<UnitId> {
        if !(buffer_rate > 0.0) {
            return Err(EngineError::InvalidParameter(format!(
                "buffer sample rate must be positive, got {}",
                buffer_rate
            )));
        }
        let step = buffer_rate as f64 / self.sample_rate as f64;
        self.insert(
            UnitKind::Source,
            Node::Buffer(BufferPlayback {
                samples,
                step,
                position: 0.0,
                looping,
            }),
        )
    }

    pub fn add_filter(&mut self, params: FilterParams) -> EngineResult<UnitId> {
        let filter = BiquadFilter::new(params, self.sample_rate)?;
        self.insert(UnitKind::Filter, Node::Processor(Box::new(filter)))
    }

    pub fn add_compressor(&mut self, params: CompressorParams) -> EngineResult<UnitId> {
        let compressor = Compressor::new(params, self.sample_rate)?;
        self.insert(UnitKind::Filter, Node::Processor(Box::new(compressor)))
    }

    /// Gain stage with intrinsic linear gain `value`
    pub fn add_gain(&mut self, value: f32) -> EngineResult<UnitId> {
        self.insert(UnitKind::Gain, Node::Gain(ParamTimeline::new(value)))
    }

    pub fn add_analyser(&mut self, window: usize) -> EngineResult<UnitId> {
        let analyser = Analyser::new(window)?;
        self.insert(UnitKind::Analyser, Node::Analyser(analyser))
    }

    // ---- connections ---------------------------------------------------

    /// Connect `from`'s output to an input or parameter. Connecting the same
    /// pair twice is a no-op.
    pub fn connect(&mut self, from: UnitId, to: Endpoint) -> EngineResult<()> {
        self.sweep_expired()?;

        let source = self.unit(from)?;
        if source.kind == UnitKind::Sink {
            return Err(EngineError::InvalidConnection(format!(
                "{} is the destination and has no output",
                from
            )));
        }
        if source
            .schedule
            .is_some_and(|s| s.state == SourceState::Stopped)
        {
            return Err(EngineError::UnitStopped(from.0));
        }

        let target = self.unit(to.unit())?;
        match to {
            Endpoint::Input(_) if target.kind == UnitKind::Source => {
                return Err(EngineError::InvalidConnection(format!(
                    "source {} takes no input",
                    to.unit()
                )));
            }
            Endpoint::Param(_, ParamKind::Gain) if !matches!(target.node, Node::Gain(_)) => {
                return Err(EngineError::InvalidConnection(format!(
                    "{} has no gain parameter",
                    to.unit()
                )));
            }
            Endpoint::Param(_, ParamKind::Frequency)
                if !matches!(target.node, Node::Oscillator { .. }) =>
            {
                return Err(EngineError::InvalidConnection(format!(
                    "{} has no frequency parameter",
                    to.unit()
                )));
            }
            _ => {}
        }

        let edge = Edge { from, to };
        if self.edges.contains(&edge) {
            return Ok(());
        }
        self.edges.push(edge);
        if let Err(e) = self.rebuild_plan() {
            self.edges.pop();
            self.rebuild_plan()?;
            return Err(e);
        }
        Ok(())
    }

    /// Remove every outgoing connection of `from`
    pub fn disconnect(&mut self, from: UnitId) -> EngineResult<()> {
        self.unit(from)?;
        self.edges.retain(|e| e.from != from);
        self.rebuild_plan()
    }

    /// Remove one connection
    pub fn disconnect_from(&mut self, from: UnitId, to: Endpoint) -> EngineResult<()> {
        self.unit(from)?;
        let before = self.edges.len();
        self.edges.retain(|e| !(e.from == from && e.to == to));
        if self.edges.len() == before {
            return Err(EngineError::InvalidConnection(format!(
                "{} is not connected to {:?}",
                from, to
            )));
        }
        self.rebuild_plan()
    }

    /// Units fed by `from`
    pub fn outputs_of(&self, from: UnitId) -> Vec<Endpoint> {
        self.edges
            .iter()
            .filter(|e| e.from == from)
            .map(|e| e.to)
            .collect()
    }

    // ---- source scheduling ---------------------------------------------

    fn schedule_mut(&mut self, id: UnitId) -> EngineResult<&mut Schedule> {
        self.unit_mut(id)?
            .schedule
            .as_mut()
            .ok_or_else(|| EngineError::InvalidState(format!("{} is not a source", id)))
    }

    /// Start a source at `when` seconds (past times start immediately)
    pub fn start(&mut self, id: UnitId, when: f64) -> EngineResult<()> {
        let frame = self.frame_at(when);
        let schedule = self.schedule_mut(id)?;
        if schedule.state != SourceState::Initialized {
            return Err(EngineError::InvalidState(format!("{} was already started", id)));
        }
        schedule.start_frame = Some(frame);
        schedule.state = SourceState::Running;
        Ok(())
    }

    /// Stop a running source at `when` seconds
    pub fn stop(&mut self, id: UnitId, when: f64) -> EngineResult<()> {
        let frame = self.frame_at(when);
        let schedule = self.schedule_mut(id)?;
        match schedule.state {
            SourceState::Initialized => {
                Err(EngineError::InvalidState(format!("{} was never started", id)))
            }
            SourceState::Stopped => Err(EngineError::UnitStopped(id.0)),
            SourceState::Running if schedule.stop_frame.is_some() => {
                Err(EngineError::InvalidState(format!("{} already has a stop scheduled", id)))
            }
            SourceState::Running => {
                schedule.stop_frame = Some(frame.max(schedule.start_frame.unwrap_or(0)));
                Ok(())
            }
        }
    }

    pub fn source_state(&self, id: UnitId) -> EngineResult<SourceState> {
        self.unit(id)?
            .schedule
            .map(|s| s.state)
            .ok_or_else(|| EngineError::InvalidState(format!("{} is not a source", id)))
    }

    // ---- parameters ----------------------------------------------------

    /// Automation timeline of a unit parameter
    pub fn param_mut(&mut self, id: UnitId, param: ParamKind) -> EngineResult<&mut ParamTimeline> {
        let unit = self.unit_mut(id)?;
        match (&mut unit.node, param) {
            (Node::Gain(timeline), ParamKind::Gain) => Ok(timeline),
            (Node::Oscillator { frequency, .. }, ParamKind::Frequency) => Ok(frequency),
            _ => Err(EngineError::InvalidParameter(format!(
                "{} has no {:?} parameter",
                id, param
            ))),
        }
    }

    /// Intrinsic value of a parameter at the current time (modulation excluded)
    pub fn param_value(&self, id: UnitId, param: ParamKind) -> EngineResult<f32> {
        let now = self.current_time();
        let unit = self.unit(id)?;
        match (&unit.node, param) {
            (Node::Gain(timeline), ParamKind::Gain) => Ok(timeline.value_at(now)),
            (Node::Oscillator { frequency, .. }, ParamKind::Frequency) => {
                Ok(frequency.value_at(now))
            }
            _ => Err(EngineError::InvalidParameter(format!(
                "{} has no {:?} parameter",
                id, param
            ))),
        }
    }

    /// Replace any scheduled automation with `value`, effective now
    pub fn set_param_now(&mut self, id: UnitId, param: ParamKind, value: f32) -> EngineResult<()> {
        let now = self.current_time();
        let timeline = self.param_mut(id, param)?;
        timeline.cancel_scheduled(now);
        timeline.set_value_at(value, now);
        Ok(())
    }

    // ---- analysers -----------------------------------------------------

    fn analyser(&self, id: UnitId) -> EngineResult<&Analyser> {
        match &self.unit(id)?.node {
            Node::Analyser(analyser) => Ok(analyser),
            _ => Err(EngineError::InvalidParameter(format!("{} is not an analyser", id))),
        }
    }

    pub fn analyser_rms(&self, id: UnitId) -> EngineResult<f32> {
        Ok(self.analyser(id)?.rms())
    }

    pub fn analyser_time_domain(&self, id: UnitId, out: &mut [f32]) -> EngineResult<()> {
        Ok(self.analyser(id)?.time_domain(out)?)
    }

    pub fn analyser_spectrum(&mut self, id: UnitId) -> EngineResult<[f32; NUM_BINS]> {
        match &mut self.unit_mut(id)?.node {
            Node::Analyser(analyser) => Ok(analyser.spectrum()),
            _ => Err(EngineError::InvalidParameter(format!("{} is not an analyser", id))),
        }
    }

    // ---- release -------------------------------------------------------

    /// Remove a unit with all its incoming and outgoing connections
    pub fn release(&mut self, id: UnitId) -> EngineResult<()> {
        if id == self.destination {
            return Err(EngineError::InvalidState("the destination cannot be released".into()));
        }
        self.units
            .remove(&id)
            .ok_or(EngineError::UnknownUnit(id.0))?;
        self.edges.retain(|e| e.from != id && e.to.unit() != id);
        self.rebuild_plan()
    }

    /// Release a unit once the clock reaches `when`. The unit keeps rendering
    /// until then and no longer counts as live.
    pub fn release_at(&mut self, id: UnitId, when: f64) -> EngineResult<()> {
        if id == self.destination {
            return Err(EngineError::InvalidState("the destination cannot be released".into()));
        }
        let frame = self.frame_at(when);
        let unit = self.unit_mut(id)?;
        unit.release_frame = Some(unit.release_frame.map_or(frame, |f| f.min(frame)));
        Ok(())
    }

    /// Drop units whose scheduled release has passed
    pub fn sweep_expired(&mut self) -> EngineResult<()> {
        self.drop_expired();
        Ok(())
    }

    /// Prune expired units along with their edges and plan entries.
    /// Removing nodes keeps the plan topologically ordered, so this runs on
    /// the render thread without rebuilding the plan.
    fn drop_expired(&mut self) {
        if !self.has_expired {
            return;
        }
        self.has_expired = false;

        self.units.retain(|_, u| !u.expired);
        let units = &self.units;
        let live = |id: &UnitId| units.contains_key(id);
        self.edges.retain(|e| live(&e.from) && live(&e.to.unit()));
        self.plan.retain(|entry| live(&entry.id));
        for entry in &mut self.plan {
            entry.signal.retain(live);
            entry.gain_mod.retain(live);
            entry.frequency_mod.retain(live);
        }
    }

    // ---- planning ------------------------------------------------------

    /// Topological order over all units (Kahn's algorithm)
    fn rebuild_plan(&mut self) -> EngineResult<()> {
        let mut ids: Vec<UnitId> = self.units.keys().copied().collect();
        ids.sort_unstable();

        let mut indegree: HashMap<UnitId, usize> = ids.iter().map(|id| (*id, 0)).collect();
        for edge in &self.edges {
            if let Some(count) = indegree.get_mut(&edge.to.unit()) {
                *count += 1;
            }
        }

        let mut ready: Vec<UnitId> = ids
            .iter()
            .copied()
            .filter(|id| indegree[id] == 0)
            .rev()
            .collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(id) = ready.pop() {
            order.push(id);
            for edge in self.edges.iter().filter(|e| e.from == id) {
                let target = edge.to.unit();
                if let Some(count) = indegree.get_mut(&target) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(target);
                    }
                }
            }
        }

        if order.len() != ids.len() {
            return Err(EngineError::InvalidConnection(
                "connection would create a cycle".into(),
            ));
        }

        self.plan = order
            .into_iter()
            .map(|id| {
                let mut entry = PlanEntry {
                    id,
                    signal: Vec::new(),
                    gain_mod: Vec::new(),
                    frequency_mod: Vec::new(),
                };
                for edge in self.edges.iter().filter(|e| e.to.unit() == id) {
                    match edge.to {
                        Endpoint::Input(_) => entry.signal.push(edge.from),
                        Endpoint::Param(_, ParamKind::Gain) => entry.gain_mod.push(edge.from),
                        Endpoint::Param(_, ParamKind::Frequency) => {
                            entry.frequency_mod.push(edge.from)
                        }
                    }
                }
                entry
            })
            .collect();
        Ok(())
    }

    // ---- rendering -----------------------------------------------------

    /// Fill `out` with the next mono frames from the destination
    ///
    /// # Real-time Safety
    /// No allocations; O(units × frames).
    pub fn render(&mut self, out: &mut [f32]) {
        let mut written = 0;
        while written < out.len() {
            if self.rendered_pos >= RENDER_QUANTUM {
                self.render_quantum();
                self.rendered_pos = 0;
            }
            let n = (RENDER_QUANTUM - self.rendered_pos).min(out.len() - written);
            out[written..written + n]
                .copy_from_slice(&self.rendered[self.rendered_pos..self.rendered_pos + n]);
            self.rendered_pos += n;
            written += n;
        }
    }

    fn render_quantum(&mut self) {
        let clock = RenderClock {
            block_start: self.frame,
            sample_rate: self.sample_rate,
            events: &self.events,
        };

        for entry in &self.plan {
            sum_outputs(&self.units, &entry.signal, &mut self.signal);
            sum_outputs(&self.units, &entry.gain_mod, &mut self.gain_mod);
            sum_outputs(&self.units, &entry.frequency_mod, &mut self.frequency_mod);

            if let Some(unit) = self.units.get_mut(&entry.id) {
                let inputs = RenderInputs {
                    signal: &self.signal,
                    gain_mod: &self.gain_mod,
                    frequency_mod: &self.frequency_mod,
                };
                unit.render(entry.id, &inputs, &clock, &mut self.param_values);
            }
        }

        match self.units.get(&self.destination) {
            Some(destination) => self.rendered.copy_from_slice(&destination.output),
            None => self.rendered.fill(0.0),
        }

        self.frame += RENDER_QUANTUM as u64;

        // Scheduled releases that have come due
        let frame = self.frame;
        for unit in self.units.values_mut() {
            if !unit.expired && unit.release_frame.is_some_and(|f| f <= frame) {
                unit.expired = true;
                self.has_expired = true;
            }
        }
        self.drop_expired();
    }
}

/// Sum the outputs of `sources` into `dest`
#[inline]
fn sum_outputs(units: &HashMap<UnitId, Unit>, sources: &[UnitId], dest: &mut [f32]) {
    dest.fill(0.0);
    for id in sources {
        if let Some(unit) = units.get(id) {
            for (d, s) in dest.iter_mut().zip(unit.output.iter()) {
                *d += *s;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, Receiver};
    use tinnitune_dsp::Waveform;

    const SR: f32 = 48000.0;

    fn graph() -> (AudioGraph, Receiver<Event>) {
        let (tx, rx) = bounded(16);
        (AudioGraph::new(SR, tx).unwrap(), rx)
    }

    fn render(graph: &mut AudioGraph, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        graph.render(&mut out);
        out
    }

    fn peak(samples: &[f32]) -> f32 {
        samples.iter().fold(0.0_f32, |m, s| m.max(s.abs()))
    }

    #[test]
    fn test_empty_graph_is_silent() {
        let (mut g, _rx) = graph();
        assert_eq!(g.unit_count(), 1);
        assert!(render(&mut g, 512).iter().all(|&s| s == 0.0));
        assert_eq!(g.current_frame(), 512);
    }

    #[test]
    fn test_oscillator_through_gain() {
        let (mut g, _rx) = graph();
        let osc = g.add_oscillator(Waveform::Sine, 1000.0).unwrap();
        let gain = g.add_gain(0.5).unwrap();
        g.connect(osc, Endpoint::Input(gain)).unwrap();
        g.connect(gain, Endpoint::Input(g.destination())).unwrap();
        g.start(osc, 0.0).unwrap();

        let out = render(&mut g, 4800);
        assert!((peak(&out) - 0.5).abs() < 1e-3);
        // Quarter cycle of 1 kHz at 48 kHz
        assert!((out[12] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_unstarted_source_is_silent() {
        let (mut g, _rx) = graph();
        let osc = g.add_oscillator(Waveform::Square, 440.0).unwrap();
        g.connect(osc, Endpoint::Input(g.destination())).unwrap();
        assert_eq!(peak(&render(&mut g, 1024)), 0.0);
        assert_eq!(g.source_state(osc).unwrap(), SourceState::Initialized);
    }

    #[test]
    fn test_scheduled_start_and_stop_are_sample_accurate() {
        let (mut g, _rx) = graph();
        let src = g.add_buffer_source(vec![1.0; 48000].into(), SR, true).unwrap();
        g.connect(src, Endpoint::Input(g.destination())).unwrap();
        g.start(src, 100.0 / SR as f64).unwrap();
        g.stop(src, 300.0 / SR as f64).unwrap();

        let out = render(&mut g, 512);
        assert_eq!(out[99], 0.0);
        assert_eq!(out[100], 1.0);
        assert_eq!(out[299], 1.0);
        assert_eq!(out[300], 0.0);
        assert_eq!(g.source_state(src).unwrap(), SourceState::Stopped);
    }

    #[test]
    fn test_source_lifecycle_errors() {
        let (mut g, _rx) = graph();
        let osc = g.add_oscillator(Waveform::Sine, 440.0).unwrap();
        assert!(matches!(g.stop(osc, 0.0), Err(EngineError::InvalidState(_))));

        g.start(osc, 0.0).unwrap();
        assert!(matches!(g.start(osc, 0.0), Err(EngineError::InvalidState(_))));

        g.stop(osc, 0.0).unwrap();
        render(&mut g, RENDER_QUANTUM);
        assert_eq!(g.source_state(osc).unwrap(), SourceState::Stopped);
        assert!(matches!(g.stop(osc, 0.0), Err(EngineError::UnitStopped(_))));

        let gain = g.add_gain(1.0).unwrap();
        assert!(matches!(
            g.connect(osc, Endpoint::Input(gain)),
            Err(EngineError::UnitStopped(_))
        ));
        assert!(matches!(g.start(gain, 0.0), Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn test_invalid_connections() {
        let (mut g, _rx) = graph();
        let osc = g.add_oscillator(Waveform::Sine, 440.0).unwrap();
        let gain = g.add_gain(1.0).unwrap();
        let filter = g.add_filter(FilterParams::low_pass(1000.0, 0.7)).unwrap();
        let dest = g.destination();

        assert!(matches!(
            g.connect(gain, Endpoint::Input(osc)),
            Err(EngineError::InvalidConnection(_))
        ));
        assert!(matches!(
            g.connect(dest, Endpoint::Input(gain)),
            Err(EngineError::InvalidConnection(_))
        ));
        assert!(matches!(
            g.connect(osc, Endpoint::Param(filter, ParamKind::Gain)),
            Err(EngineError::InvalidConnection(_))
        ));
        assert!(matches!(
            g.connect(osc, Endpoint::Param(gain, ParamKind::Frequency)),
            Err(EngineError::InvalidConnection(_))
        ));
        assert!(matches!(
            g.connect(osc, Endpoint::Input(UnitId(999))),
            Err(EngineError::UnknownUnit(999))
        ));
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let (mut g, _rx) = graph();
        let a = g.add_gain(1.0).unwrap();
        let b = g.add_gain(1.0).unwrap();
        g.connect(a, Endpoint::Input(b)).unwrap();
        assert!(matches!(
            g.connect(b, Endpoint::Input(a)),
            Err(EngineError::InvalidConnection(_))
        ));
        assert_eq!(g.outputs_of(b), vec![]);
        assert_eq!(g.outputs_of(a), vec![Endpoint::Input(b)]);
    }

    #[test]
    fn test_duplicate_connection_is_noop() {
        let (mut g, _rx) = graph();
        let osc = g.add_oscillator(Waveform::Sine, 1000.0).unwrap();
        g.connect(osc, Endpoint::Input(g.destination())).unwrap();
        g.connect(osc, Endpoint::Input(g.destination())).unwrap();
        g.start(osc, 0.0).unwrap();
        assert!(peak(&render(&mut g, 4800)) <= 1.0 + 1e-4);
    }

    #[test]
    fn test_gain_param_modulation_sums_with_intrinsic() {
        let (mut g, _rx) = graph();
        let dc = g.add_buffer_source(vec![1.0; 1024].into(), SR, true).unwrap();
        let carrier = g.add_buffer_source(vec![0.5; 1024].into(), SR, true).unwrap();
        let vca = g.add_gain(0.25).unwrap();
        g.connect(carrier, Endpoint::Input(vca)).unwrap();
        g.connect(dc, Endpoint::Param(vca, ParamKind::Gain)).unwrap();
        g.connect(vca, Endpoint::Input(g.destination())).unwrap();
        g.start(dc, 0.0).unwrap();
        g.start(carrier, 0.0).unwrap();

        let out = render(&mut g, 256);
        // 0.5 × (0.25 + 1.0)
        assert!((out[200] - 0.625).abs() < 1e-6);
    }

    #[test]
    fn test_frequency_modulation() {
        let (mut g, _rx) = graph();
        let osc = g.add_oscillator(Waveform::Sine, 0.0).unwrap();
        let offset = g.add_buffer_source(vec![1000.0; 64].into(), SR, true).unwrap();
        g.connect(offset, Endpoint::Param(osc, ParamKind::Frequency)).unwrap();
        g.connect(osc, Endpoint::Input(g.destination())).unwrap();
        g.start(osc, 0.0).unwrap();
        g.start(offset, 0.0).unwrap();

        let out = render(&mut g, 48);
        assert!((out[12] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_gain_automation_ramp() {
        let (mut g, _rx) = graph();
        let src = g.add_buffer_source(vec![1.0; 4800].into(), SR, true).unwrap();
        let gain = g.add_gain(1.0).unwrap();
        g.connect(src, Endpoint::Input(gain)).unwrap();
        g.connect(gain, Endpoint::Input(g.destination())).unwrap();
        g.start(src, 0.0).unwrap();
        {
            let timeline = g.param_mut(gain, ParamKind::Gain).unwrap();
            timeline.set_value_at(1.0, 0.0);
            timeline.linear_ramp_to(0.0, 0.01);
        }

        let out = render(&mut g, 960);
        assert!((out[240] - 0.5).abs() < 1e-3);
        assert_eq!(out[959], 0.0);
        assert_eq!(g.param_value(gain, ParamKind::Gain).unwrap(), 0.0);
    }

    #[test]
    fn test_buffer_source_resamples() {
        let (mut g, _rx) = graph();
        // Ramp recorded at half the graph rate plays at half speed
        let ramp: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let src = g.add_buffer_source(ramp.into(), SR / 2.0, false).unwrap();
        g.connect(src, Endpoint::Input(g.destination())).unwrap();
        g.start(src, 0.0).unwrap();

        let out = render(&mut g, 8);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[4] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_one_shot_buffer_reports_end() {
        let (mut g, rx) = graph();
        let src = g.add_buffer_source(vec![0.5; 200].into(), SR, false).unwrap();
        g.connect(src, Endpoint::Input(g.destination())).unwrap();
        g.start(src, 0.0).unwrap();

        let out = render(&mut g, 512);
        assert_eq!(out[199], 0.5);
        assert_eq!(out[200], 0.0);
        assert_eq!(g.source_state(src).unwrap(), SourceState::Stopped);
        assert_eq!(rx.try_recv().unwrap(), Event::SourceEnded { unit: src });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_looping_buffer_wraps() {
        let (mut g, _rx) = graph();
        let src = g.add_buffer_source(vec![0.0, 1.0, 2.0, 3.0].into(), SR, true).unwrap();
        g.connect(src, Endpoint::Input(g.destination())).unwrap();
        g.start(src, 0.0).unwrap();

        let out = render(&mut g, 10);
        assert_eq!(&out[..10], &[0.0, 1.0, 2.0, 3.0, 0.0, 1.0, 2.0, 3.0, 0.0, 1.0]);
    }

    #[test]
    fn test_release_removes_unit_and_edges() {
        let (mut g, _rx) = graph();
        let before = g.unit_count();
        let osc = g.add_oscillator(Waveform::Sine, 440.0).unwrap();
        let gain = g.add_gain(1.0).unwrap();
        g.connect(osc, Endpoint::Input(gain)).unwrap();
        g.connect(gain, Endpoint::Input(g.destination())).unwrap();
        assert_eq!(g.unit_count(), before + 2);

        g.release(gain).unwrap();
        assert!(g.outputs_of(osc).is_empty());
        assert!(matches!(g.release(gain), Err(EngineError::UnknownUnit(_))));
        g.release(osc).unwrap();
        assert_eq!(g.unit_count(), before);
        assert!(g.release(g.destination()).is_err());
    }

    #[test]
    fn test_release_at_keeps_rendering_until_due() {
        let (mut g, _rx) = graph();
        let before = g.unit_count();
        let src = g.add_buffer_source(vec![1.0; 48].into(), SR, true).unwrap();
        g.connect(src, Endpoint::Input(g.destination())).unwrap();
        g.start(src, 0.0).unwrap();
        g.release_at(src, 256.0 / SR as f64).unwrap();

        // Pending releases no longer count as live
        assert_eq!(g.unit_count(), before);
        assert!(g.contains(src));

        let out = render(&mut g, 256);
        assert_eq!(out[255], 1.0);
        let out = render(&mut g, 128);
        assert_eq!(out[0], 0.0);

        g.sweep_expired().unwrap();
        assert!(!g.contains(src));
    }

    #[test]
    fn test_render_drops_due_releases_without_mutation() {
        let (mut g, _rx) = graph();
        let dest = g.destination();
        let src = g.add_buffer_source(vec![0.5; 48].into(), SR, true).unwrap();
        let gain = g.add_gain(1.0).unwrap();
        let lfo = g.add_oscillator(Waveform::Sine, 5.0).unwrap();
        g.connect(src, Endpoint::Input(gain)).unwrap();
        g.connect(lfo, Endpoint::Param(gain, ParamKind::Gain)).unwrap();
        g.connect(gain, Endpoint::Input(dest)).unwrap();
        g.start(src, 0.0).unwrap();
        g.start(lfo, 0.0).unwrap();

        g.release_at(lfo, 128.0 / SR as f64).unwrap();
        g.release_at(src, 512.0 / SR as f64).unwrap();

        render(&mut g, 256);
        assert!(!g.contains(lfo));
        assert!(g.contains(src));
        assert!(g.outputs_of(lfo).is_empty());

        // Remaining units keep rendering after the in-place removal
        let out = render(&mut g, 128);
        assert!((out[0] - 0.5).abs() < 1e-6);

        render(&mut g, 256);
        assert!(!g.contains(src));
        assert!(g.outputs_of(src).is_empty());
        assert!(g.contains(gain));
        let out = render(&mut g, 128);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_analyser_passes_and_measures() {
        let (mut g, _rx) = graph();
        let src = g.add_buffer_source(vec![0.5; 64].into(), SR, true).unwrap();
        let analyser = g.add_analyser(512).unwrap();
        g.connect(src, Endpoint::Input(analyser)).unwrap();
        g.connect(analyser, Endpoint::Input(g.destination())).unwrap();
        g.start(src, 0.0).unwrap();

        let out = render(&mut g, 1024);
        assert_eq!(out[1000], 0.5);
        assert!((g.analyser_rms(analyser).unwrap() - 0.5).abs() < 1e-6);

        let mut window = vec![0.0; 512];
        g.analyser_time_domain(analyser, &mut window).unwrap();
        assert!(window.iter().all(|&s| s == 0.5));
        assert!(g.analyser_rms(src).is_err());
    }

    #[test]
    fn test_render_in_odd_sized_chunks_is_continuous() {
        let (mut a, _rx_a) = graph();
        let (mut b, _rx_b) = graph();
        for g in [&mut a, &mut b] {
            let osc = g.add_oscillator(Waveform::Triangle, 333.0).unwrap();
            g.connect(osc, Endpoint::Input(g.destination())).unwrap();
            g.start(osc, 0.0).unwrap();
        }

        let whole = render(&mut a, 1000);
        let mut pieces = Vec::new();
        for size in [1, 77, 128, 300, 494] {
            pieces.extend(render(&mut b, size));
        }
        assert_eq!(whole, pieces);
    }

    #[test]
    fn test_rejects_bad_sample_rate() {
        let (tx, _rx) = bounded(1);
        assert!(AudioGraph::new(0.0, tx).is_err());
    }
}
