/// Filter engine, stage cascade and per-entity decision context
pub mod context;
pub mod engine;
pub mod stages;

pub use context::{ContextMap, EntityContext};
pub use engine::{FilterDecision, FilterEngine};
pub use stages::{DropReason, EvalState, FilterStage, KeepReason, StageOutcome};
