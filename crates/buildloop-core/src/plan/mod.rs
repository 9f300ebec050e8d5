//! Plan model: phases of typed steps, validated once at load time.
//!
//! A [`PlanSpec`] is the raw document handed over by the planning front-end.
//! [`Plan::load`] validates it and resolves the scheduling edges the
//! orchestrator relies on, producing an immutable [`Plan`].

mod load;
mod model;

pub use load::{normalize_path, Plan};
pub use model::{
    ExpectedOutcome, Phase, PhaseSpec, PlanSpec, Step, StepAction, StepKind, StepSpec,
};

/// Reasons a plan document is rejected before execution begins.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("plan contains no steps")]
    Empty,

    #[error("phase #{index} has an empty name")]
    EmptyPhaseName { index: usize },

    #[error("duplicate phase name: {0}")]
    DuplicatePhase(String),

    #[error("step #{position} of phase '{phase}' has an empty id")]
    EmptyStepId { phase: String, position: usize },

    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("step '{step}' has an empty target")]
    EmptyTarget { step: String },

    #[error("step '{step}' replaces an empty fragment")]
    EmptyFragment { step: String },

    #[error("step '{step}' depends on '{dependency}', which is declared after it")]
    ForwardDependency { step: String, dependency: String },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("verify step '{step}' inspects nothing")]
    EmptyInspection { step: String },

    #[error("verify step '{step}' inspects '{target}', which no earlier step produces")]
    UnknownInspection { step: String, target: String },

    #[error("plan document could not be parsed: {0}")]
    Parse(String),
}
