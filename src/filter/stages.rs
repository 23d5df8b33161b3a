//! Filter stages of the decision cascade
//!
//! Each stage examines one event and either decides its fate or passes it
//! on. The engine evaluates stages in a fixed order and stops at the first
//! definitive KEEP or DROP, so the override semantics live entirely in the
//! ordering plus each stage's precondition.

use crate::events::Event;
use crate::filter::context::state_hash;
use chrono::{Duration, Timelike};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Why an event was kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReason {
    /// Event type is in the always-keep set
    HighSignalType,
    /// Priority entity reported a changed state value inside active hours
    SignificantChange,
    /// Survived the random sampling stage
    Sampled,
    /// No stage produced a decision
    NoStageObjected,
}

impl KeepReason {
    pub fn label(&self) -> &'static str {
        match self {
            KeepReason::HighSignalType => "high-signal-type",
            KeepReason::SignificantChange => "significant-change",
            KeepReason::Sampled => "sampled",
            KeepReason::NoStageObjected => "no-stage-objected",
        }
    }
}

/// Why an event was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Entity exceeded the frequency threshold inside the window
    RateLimited,
    /// Priority entity's state value matches the last kept one
    StateUnchanged,
    /// Priority entity event outside the configured active hours
    OutsideActiveHours,
    /// Lost the random sampling draw
    NotSampled,
}

impl DropReason {
    pub fn label(&self) -> &'static str {
        match self {
            DropReason::RateLimited => "rate-limited",
            DropReason::StateUnchanged => "state-unchanged",
            DropReason::OutsideActiveHours => "outside-active-hours",
            DropReason::NotSampled => "not-sampled",
        }
    }
}

/// Outcome of one stage for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Keep(KeepReason),
    Drop(DropReason),
    /// No opinion; evaluation continues with the next stage
    Pass,
}

/// Evaluation state threaded through the stages for one event
///
/// Snapshotted from the entity's context before the stages run, so no
/// stage ever holds a context lock.
#[derive(Debug, Clone, Default)]
pub struct EvalState {
    /// Windowed arrival count including the current event
    pub recent_count: usize,
    /// Hash of the last kept state value; None for first-seen entities
    pub last_kept_state_hash: Option<u64>,
    /// Set by the significance check when the state value changed
    pub significant: bool,
}

/// One rule of the decision cascade
pub trait FilterStage: Send + Sync {
    /// Evaluate this stage against the given event
    fn evaluate(&self, event: &Event, eval: &mut EvalState) -> StageOutcome;

    /// Get a human-readable name for this stage
    fn name(&self) -> &str;
}

fn is_priority_entity(event: &Event, domains: &[String]) -> bool {
    event
        .entity_domain()
        .map(|domain| domains.iter().any(|d| d == domain))
        .unwrap_or(false)
}

/// Drops entities that exceed the frequency threshold within the window
///
/// High-signal event types are exempt so the type allow-list downstream
/// keeps them even during a burst.
pub struct FrequencyGate {
    /// Windowed events per entity tolerated before rate limiting
    pub threshold: usize,
}

impl FrequencyGate {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Create a frequency gate with the default threshold (10 per window)
    pub fn with_defaults() -> Self {
        Self::new(10)
    }
}

impl FilterStage for FrequencyGate {
    fn evaluate(&self, event: &Event, eval: &mut EvalState) -> StageOutcome {
        if eval.recent_count > self.threshold && !event.is_high_signal() {
            StageOutcome::Drop(DropReason::RateLimited)
        } else {
            StageOutcome::Pass
        }
    }

    fn name(&self) -> &str {
        "FrequencyGate"
    }
}

/// Keeps automation, script and scene events unconditionally
pub struct TypeAllowList;

impl TypeAllowList {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TypeAllowList {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterStage for TypeAllowList {
    fn evaluate(&self, event: &Event, _eval: &mut EvalState) -> StageOutcome {
        if event.is_high_signal() {
            StageOutcome::Keep(KeepReason::HighSignalType)
        } else {
            StageOutcome::Pass
        }
    }

    fn name(&self) -> &str {
        "TypeAllowList"
    }
}

/// Compares a priority entity's state value against its last kept one
///
/// An unchanged value drops immediately. A changed or first-seen value is
/// only marked significant; the active-hours gate downstream turns the
/// mark into a keep or vetoes it.
pub struct SignificanceCheck {
    /// Entity domains this check applies to
    pub priority_domains: Vec<String>,
}

impl SignificanceCheck {
    pub fn new(priority_domains: Vec<String>) -> Self {
        Self { priority_domains }
    }
}

impl FilterStage for SignificanceCheck {
    fn evaluate(&self, event: &Event, eval: &mut EvalState) -> StageOutcome {
        if !is_priority_entity(event, &self.priority_domains) {
            return StageOutcome::Pass;
        }
        match event.state_value() {
            None => StageOutcome::Pass,
            Some(value) => {
                let hash = state_hash(value);
                match eval.last_kept_state_hash {
                    Some(previous) if previous == hash => {
                        StageOutcome::Drop(DropReason::StateUnchanged)
                    }
                    _ => {
                        eval.significant = true;
                        StageOutcome::Pass
                    }
                }
            }
        }
    }

    fn name(&self) -> &str {
        "SignificanceCheck"
    }
}

/// Gates priority entities on the configured active window
///
/// Inside the window a significant event becomes a keep; outside it the
/// event drops regardless of significance. Non-priority entities bypass
/// this gate entirely and fall through to sampling.
pub struct ActiveHoursGate {
    /// Start of the active window, hour of day [0, 24]
    pub start_hour: u32,
    /// End of the active window, hour of day [0, 24]
    pub end_hour: u32,
    /// Offset applied to UTC timestamps before the hour check
    pub utc_offset_minutes: i32,
    /// Entity domains this gate applies to
    pub priority_domains: Vec<String>,
}

impl ActiveHoursGate {
    pub fn new(
        start_hour: u32,
        end_hour: u32,
        utc_offset_minutes: i32,
        priority_domains: Vec<String>,
    ) -> Self {
        Self {
            start_hour,
            end_hour,
            utc_offset_minutes,
            priority_domains,
        }
    }

    /// Whether the (offset-shifted) timestamp falls inside the window
    ///
    /// Equal start and end disable the gate; a start after the end wraps
    /// the window across midnight.
    fn in_active_window(&self, at: crate::events::Timestamp) -> bool {
        if self.start_hour == self.end_hour {
            return true;
        }
        let shifted = at + Duration::minutes(self.utc_offset_minutes as i64);
        let hour = shifted.hour();
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

impl FilterStage for ActiveHoursGate {
    fn evaluate(&self, event: &Event, eval: &mut EvalState) -> StageOutcome {
        if !is_priority_entity(event, &self.priority_domains) {
            return StageOutcome::Pass;
        }
        if self.in_active_window(event.received_at) {
            if eval.significant {
                StageOutcome::Keep(KeepReason::SignificantChange)
            } else {
                StageOutcome::Pass
            }
        } else {
            StageOutcome::Drop(DropReason::OutsideActiveHours)
        }
    }

    fn name(&self) -> &str {
        "ActiveHoursGate"
    }
}

/// Keeps a fixed fraction of whatever reaches the end of the cascade
///
/// The RNG is seedable so decisions are reproducible in tests.
pub struct RandomSampling {
    /// Probability of keeping an undecided event, in [0, 1]
    pub rate: f64,
    rng: Mutex<StdRng>,
}

impl RandomSampling {
    pub fn new(rate: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rate,
            rng: Mutex::new(rng),
        }
    }

    /// Create a sampling stage with the default rate (10%)
    pub fn with_defaults() -> Self {
        Self::new(0.1, None)
    }
}

impl FilterStage for RandomSampling {
    fn evaluate(&self, _event: &Event, _eval: &mut EvalState) -> StageOutcome {
        let draw: f64 = self.rng.lock().unwrap().gen();
        if draw < self.rate {
            StageOutcome::Keep(KeepReason::Sampled)
        } else {
            StageOutcome::Drop(DropReason::NotSampled)
        }
    }

    fn name(&self) -> &str {
        "RandomSampling"
    }
}
