use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditOperation;
use crate::plan::{Phase, Step, StepKind};
use crate::state::StepState;

/// Outcome of one invocation attempt of a step. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub step_id: String,
    pub attempt: u32,
    pub operation: AuditOperation,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub(crate) fn started(step_id: &str, attempt: u32, operation: AuditOperation) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.to_string(),
            attempt,
            operation,
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            diff: None,
            error: None,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }

    pub(crate) fn finish(&mut self, error: Option<String>) {
        self.finished_at = Utc::now();
        self.duration_ms = (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self.success = error.is_none();
        self.error = error;
    }

    /// Captured stdout followed by stderr.
    pub fn output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub id: String,
    pub kind: StepKind,
    pub state: StepState,
    pub attempts: u32,
    /// Restored from a checkpoint rather than executed.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub results: Vec<ExecutionResult>,
    /// Dependency acquisition steps inserted ahead of this one.
    #[serde(default)]
    pub dependency_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl StepReport {
    pub(crate) fn pending(step: &Step) -> Self {
        Self {
            id: step.id.clone(),
            kind: step.kind(),
            state: StepState::Pending,
            attempts: 0,
            skipped: false,
            results: Vec::new(),
            dependency_steps: Vec::new(),
            abort_reason: None,
        }
    }

    pub(crate) fn skipped(step: &Step) -> Self {
        Self {
            state: StepState::Succeeded,
            skipped: true,
            ..Self::pending(step)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub name: String,
    pub index: usize,
    pub steps: Vec<StepReport>,
}

impl PhaseReport {
    /// A phase is complete only when every step succeeded.
    pub fn succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.state == StepState::Succeeded)
    }

    pub fn has_aborted(&self) -> bool {
        self.steps.iter().any(|s| s.state == StepState::Aborted)
    }

    pub(crate) fn not_run(phase: &Phase, skippable: impl Fn(&Step) -> bool) -> Self {
        Self {
            name: phase.name.clone(),
            index: phase.index,
            steps: phase
                .steps
                .iter()
                .map(|s| {
                    if skippable(s) {
                        StepReport::skipped(s)
                    } else {
                        StepReport::pending(s)
                    }
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanOutcome {
    Succeeded,
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortedStep {
    pub step_id: String,
    pub phase: String,
}

/// Final result of running a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReport {
    pub run_id: String,
    pub plan_name: String,
    pub outcome: PlanOutcome,
    pub phases: Vec<PhaseReport>,
    pub first_aborted: Option<AbortedStep>,
    pub duration_ms: u64,
}

impl PlanReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == PlanOutcome::Succeeded
    }

    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.phases
            .iter()
            .flat_map(|p| p.steps.iter())
            .find(|s| s.id == id)
    }

    pub fn state_of(&self, id: &str) -> Option<StepState> {
        self.step(id).map(|s| s.state)
    }

    pub fn executed_steps(&self) -> usize {
        self.phases
            .iter()
            .flat_map(|p| p.steps.iter())
            .filter(|s| !s.skipped && s.attempts > 0)
            .count()
    }
}
