//! Filter engine that runs the stage cascade over incoming events
//!
//! The engine owns the per-entity context map and a fixed, ordered list of
//! stages. For each event it snapshots the entity's context, walks the
//! stages until one decides, and records the keep back into the context so
//! later significance checks compare against the last kept state.

use crate::config::FilterConfig;
use crate::events::Event;
use crate::filter::context::{state_hash, ContextMap};
use crate::filter::stages::{
    ActiveHoursGate, DropReason, EvalState, FilterStage, FrequencyGate, KeepReason, RandomSampling,
    SignificanceCheck, StageOutcome, TypeAllowList,
};
use chrono::Duration;
use log::trace;

/// Final verdict for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Keep(KeepReason),
    Drop(DropReason),
}

impl FilterDecision {
    pub fn is_keep(&self) -> bool {
        matches!(self, FilterDecision::Keep(_))
    }

    /// Get a short label for logging and counters
    pub fn label(&self) -> &'static str {
        match self {
            FilterDecision::Keep(reason) => reason.label(),
            FilterDecision::Drop(reason) => reason.label(),
        }
    }
}

/// Ordered stage cascade with per-entity decision context
pub struct FilterEngine {
    stages: Vec<Box<dyn FilterStage>>,
    contexts: ContextMap,
    window: Duration,
}

impl FilterEngine {
    /// Create an engine with the standard stage order
    ///
    /// Frequency gating runs first so bursts are cut before anything else,
    /// the type allow-list rescues high-signal events, the significance and
    /// active-hours pair handles priority entities, and sampling decides
    /// whatever is left.
    pub fn new(config: &FilterConfig) -> Self {
        let stages: Vec<Box<dyn FilterStage>> = vec![
            Box::new(FrequencyGate::new(config.frequency_threshold)),
            Box::new(TypeAllowList::new()),
            Box::new(SignificanceCheck::new(config.priority_entity_domains.clone())),
            Box::new(ActiveHoursGate::new(
                config.active_hours_start,
                config.active_hours_end,
                config.active_hours_utc_offset_minutes,
                config.priority_entity_domains.clone(),
            )),
            Box::new(RandomSampling::new(config.sampling_rate, config.sampling_seed)),
        ];
        Self::with_stages(
            stages,
            config.context_cache_size,
            Duration::seconds(config.frequency_window_seconds as i64),
        )
    }

    /// Create an engine from an explicit stage list
    pub fn with_stages(
        stages: Vec<Box<dyn FilterStage>>,
        context_cache_size: usize,
        window: Duration,
    ) -> Self {
        Self {
            stages,
            contexts: ContextMap::new(context_cache_size),
            window,
        }
    }

    /// Evaluate one event against the cascade
    ///
    /// The first stage to return a keep or drop wins; an event no stage
    /// objects to is kept. Context updates happen outside the stage walk,
    /// so stages stay pure functions of the event and the snapshot.
    pub fn evaluate(&self, event: &Event) -> FilterDecision {
        let mut eval = match event.entity_id.as_deref() {
            Some(entity_id) => self.contexts.with_context(entity_id, |ctx| EvalState {
                recent_count: ctx.record_event(event.received_at, self.window),
                last_kept_state_hash: ctx.last_kept_state_hash,
                significant: false,
            }),
            // events without an entity count as their own single arrival
            None => EvalState {
                recent_count: 1,
                ..Default::default()
            },
        };

        let mut decision = FilterDecision::Keep(KeepReason::NoStageObjected);
        for stage in &self.stages {
            match stage.evaluate(event, &mut eval) {
                StageOutcome::Keep(reason) => {
                    decision = FilterDecision::Keep(reason);
                    break;
                }
                StageOutcome::Drop(reason) => {
                    decision = FilterDecision::Drop(reason);
                    break;
                }
                StageOutcome::Pass => continue,
            }
        }

        if decision.is_keep() {
            if let Some(entity_id) = event.entity_id.as_deref() {
                let hash = event.state_value().map(state_hash);
                self.contexts
                    .with_context(entity_id, |ctx| ctx.mark_kept(event.received_at, hash));
            }
        }

        trace!("Event {} decided: {}", event.id, decision.label());
        decision
    }

    /// Get the number of configured stages
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Get the number of entities currently tracked in the context map
    pub fn tracked_entities(&self) -> usize {
        self.contexts.len()
    }
}
