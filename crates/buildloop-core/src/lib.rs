//! buildloop core library
//!
//! Consumes a phased plan of file mutations and shell commands, drives it to
//! completion, and classifies and repairs failures within bounded budgets.
//! Everything that happened is recorded in an append-only audit trail.

pub mod audit;
pub mod cancel;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod digest;
pub mod error;
pub mod obs;
pub mod orchestrator;
pub mod plan;
pub mod repair;
pub mod state;
pub mod telemetry;
pub mod tools;

pub use audit::{
    read_audit_artifact, render_summary_md, write_audit_artifact, AbortMarker, AuditEntry,
    AuditOperation, AuditOutcome, AuditRecord, AuditTrail,
};
pub use cancel::StopHandle;
pub use checkpoint::RunCheckpoint;
pub use classify::{classify_failure, FailureBucket, FailureContext, StepFailure};
pub use config::EngineConfig;
pub use digest::ContentDigest;
pub use error::{EngineError, Result};
pub use orchestrator::{
    ExecutionResult, Orchestrator, PhaseReport, PlanOutcome, PlanReport, StepReport,
};
pub use plan::{Plan, PlanError, PlanSpec, Step, StepKind};
pub use repair::{
    NoRepairAdvisor, RepairAdvisor, RepairAttempt, RepairExhausted, RepairProposal,
    ScriptedAdvisor, ScriptedRepair,
};
pub use state::{StepMachine, StepState};
pub use telemetry::init_tracing;
pub use tools::{ToolInvocationError, ToolInvoker, ToolOutput, ToolRequest, Workspace};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
