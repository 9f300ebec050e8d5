//! Structured observability hooks for plan, phase and step lifecycle events.
//!
//! Events are emitted through `tracing` with a stable `event` field so they
//! can be filtered in JSON log pipelines (`RUST_LOG=buildloop_core=debug`).

use tracing::{debug, info, warn};

use crate::classify::FailureBucket;
use crate::state::StepState;

/// Span tagged with the plan name and run id. Attach it to the run future
/// with `tracing::Instrument` so it stays correct across await points.
pub fn plan_span(plan_name: &str, run_id: &str) -> tracing::Span {
    tracing::info_span!("buildloop.plan", plan = %plan_name, run_id = %run_id)
}

/// Span for one step task.
pub fn step_span(step_id: &str, phase: &str) -> tracing::Span {
    tracing::debug_span!("buildloop.step", step = %step_id, phase = %phase)
}

pub fn emit_plan_started(plan_name: &str, phases: usize, steps: usize) {
    info!(event = "plan.started", plan = %plan_name, phases, steps);
}

pub fn emit_plan_finished(plan_name: &str, duration_ms: u64, succeeded: bool) {
    info!(
        event = "plan.finished",
        plan = %plan_name,
        duration_ms,
        succeeded
    );
}

pub fn emit_phase_started(phase: &str, steps: usize, workers: usize) {
    info!(event = "phase.started", phase = %phase, steps, workers);
}

pub fn emit_phase_finished(phase: &str, succeeded: bool) {
    info!(event = "phase.finished", phase = %phase, succeeded);
}

/// Emit event: a step moved between lifecycle states.
pub fn emit_step_transition(step_id: &str, from: StepState, to: StepState) {
    debug!(event = "step.transition", step = %step_id, from = %from, to = %to);
}

/// Emit event: a step was restored from a checkpoint and will not run.
pub fn emit_step_skipped(step_id: &str) {
    debug!(event = "step.skipped", step = %step_id);
}

/// Emit event: a failure was classified into a repair bucket.
pub fn emit_failure_classified(step_id: &str, attempt: u32, bucket: FailureBucket) {
    info!(event = "step.classified", step = %step_id, attempt, bucket = %bucket);
}

/// Emit event: a repair proposal was obtained for a failing step.
pub fn emit_repair_proposed(step_id: &str, proposal: &str) {
    info!(event = "repair.proposed", step = %step_id, proposal = %proposal);
}

/// Emit event: a proposal was rejected before dispatch.
pub fn emit_repair_rejected(step_id: &str, reason: &dyn std::fmt::Display) {
    warn!(event = "repair.rejected", step = %step_id, reason = %reason);
}

/// Emit event: a step exhausted its budget and was aborted.
pub fn emit_step_aborted(step_id: &str, phase: &str, reason: &str) {
    warn!(event = "step.aborted", step = %step_id, phase = %phase, reason = %reason);
}
