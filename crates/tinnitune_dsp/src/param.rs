//! Parameter Automation
//!
//! A timeline of scheduled value changes for one unit parameter (gain,
//! frequency). Times are in seconds on the graph clock.
//!
//! Evaluation rules:
//! - `SetValue` jumps to a value at its time.
//! - `LinearRamp` interpolates from the end of the previous event to its own
//!   value at its end time.
//! - `SetTarget` approaches its target exponentially,
//!   `v = target + (v0 − target)·e^{−(t − t0)/τ}`, until the next event starts.
//!   A ramp scheduled directly after a `SetTarget` replaces it and starts where
//!   the `SetTarget` would have started.

use serde::{Deserialize, Serialize};

/// One scheduled change
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationEvent {
    SetValue {
        value: f32,
        time: f64,
    },
    LinearRamp {
        value: f32,
        end_time: f64,
    },
    SetTarget {
        target: f32,
        start_time: f64,
        time_constant: f64,
    },
}

impl AutomationEvent {
    /// Time used to order the event on the timeline
    pub fn time(&self) -> f64 {
        match *self {
            AutomationEvent::SetValue { time, .. } => time,
            AutomationEvent::LinearRamp { end_time, .. } => end_time,
            AutomationEvent::SetTarget { start_time, .. } => start_time,
        }
    }
}

/// Scheduled values of one parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamTimeline {
    /// Value in effect before the first event
    anchor_value: f32,
    /// Time the anchor value took effect; ramps after it start here
    anchor_time: f64,
    events: Vec<AutomationEvent>,
}

impl ParamTimeline {
    pub fn new(value: f32) -> Self {
        Self {
            anchor_value: value,
            anchor_time: 0.0,
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[AutomationEvent] {
        &self.events
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    fn insert(&mut self, event: AutomationEvent) {
        let time = event.time();
        // Later insertions at equal times go after existing ones
        let index = self.events.partition_point(|e| e.time() <= time);
        self.events.insert(index, event);
    }

    pub fn set_value_at(&mut self, value: f32, time: f64) {
        self.insert(AutomationEvent::SetValue { value, time });
    }

    pub fn linear_ramp_to(&mut self, value: f32, end_time: f64) {
        self.insert(AutomationEvent::LinearRamp { value, end_time });
    }

    /// Exponential approach to `target`. A non-positive or NaN time constant
    /// jumps straight to the target.
    pub fn set_target_at(&mut self, target: f32, start_time: f64, time_constant: f64) {
        if !(time_constant > 0.0) {
            self.set_value_at(target, start_time);
        } else {
            self.insert(AutomationEvent::SetTarget {
                target,
                start_time,
                time_constant,
            });
        }
    }

    /// Remove every event scheduled at or after `from`
    pub fn cancel_scheduled(&mut self, from: f64) {
        self.events.retain(|e| e.time() < from);
    }

    /// Freeze the parameter at its value at `time` and drop later events
    pub fn cancel_and_hold(&mut self, time: f64) -> f32 {
        let held = self.value_at(time);
        self.cancel_scheduled(time);
        self.set_value_at(held, time);
        held
    }

    /// Parameter value at time `t`
    pub fn value_at(&self, t: f64) -> f32 {
        let mut value = self.anchor_value;
        let mut time = self.anchor_time;

        for (i, event) in self.events.iter().enumerate() {
            match *event {
                AutomationEvent::SetValue { value: v, time: at } => {
                    if at > t {
                        break;
                    }
                    value = v;
                    time = at;
                }
                AutomationEvent::LinearRamp { value: v, end_time } => {
                    if end_time > t {
                        if t <= time {
                            return value;
                        }
                        let frac = ((t - time) / (end_time - time)) as f32;
                        return value + (v - value) * frac;
                    }
                    value = v;
                    time = end_time;
                }
                AutomationEvent::SetTarget {
                    target,
                    start_time,
                    time_constant,
                } => {
                    if start_time > t {
                        break;
                    }
                    let next = self.events.get(i + 1);
                    if let Some(AutomationEvent::LinearRamp { .. }) = next {
                        time = start_time;
                        continue;
                    }
                    let next_start = next.map(|e| e.time()).filter(|&at| at <= t);
                    let end = next_start.unwrap_or(t);
                    value = approach(value, target, end - start_time, time_constant);
                    time = end;
                    if next_start.is_none() {
                        return value;
                    }
                }
            }
        }

        value
    }

    /// Fill `out` with the value at each frame, starting at `start_time`
    pub fn fill(&self, start_time: f64, sample_rate: f32, out: &mut [f32]) {
        if self.events.is_empty() {
            out.fill(self.anchor_value);
            return;
        }
        let dt = 1.0 / sample_rate as f64;
        for (i, sample) in out.iter_mut().enumerate() {
            *sample = self.value_at(start_time + i as f64 * dt);
        }
    }

    /// Fold events that finished before `time` into the anchor so the
    /// timeline stays short. Evaluation at or after `time` is unchanged.
    pub fn compact(&mut self, time: f64) {
        let started = self.events.partition_point(|e| e.time() <= time);
        if started == 0 {
            return;
        }

        // The last started event may still be evolving (target) or feeding a
        // following ramp, so fold everything before it and keep its effect.
        let last = self.events[started - 1];
        match last {
            AutomationEvent::SetTarget { start_time, .. } => {
                // Evaluating exactly at the start yields the value it departs from
                self.anchor_value = self.value_at(start_time);
                self.anchor_time = start_time;
                self.events.drain(..started - 1);
            }
            AutomationEvent::SetValue { value, time }
            | AutomationEvent::LinearRamp {
                value,
                end_time: time,
            } => {
                self.anchor_value = value;
                self.anchor_time = time;
                self.events.drain(..started);
            }
        }
    }
}

#[inline]
fn approach(from: f32, target: f32, elapsed: f64, time_constant: f64) -> f32 {
    let k = (-(elapsed / time_constant)).exp() as f32;
    target + (from - target) * k
}
