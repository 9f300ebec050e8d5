//! Step lifecycle state machine and per-bucket retry accounting.
//!
//! ```text
//! Pending -> Running -> Succeeded
//!               |
//!               v
//!            Failed -> Running (retry)
//!               |
//!               v
//!            Aborted
//! ```
//!
//! `Succeeded` and `Aborted` are terminal. Each step owns its own
//! [`StepMachine`]; nothing here is shared between concurrently running steps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::FailureBucket;
use crate::config::EngineConfig;

/// Lifecycle state of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Succeeded => "succeeded",
            StepState::Failed => "failed",
            StepState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Aborted)
    }

    fn allowed_transitions(&self) -> &'static [StepState] {
        match self {
            StepState::Pending => &[StepState::Running],
            StepState::Running => &[StepState::Succeeded, StepState::Failed],
            StepState::Failed => &[StepState::Running, StepState::Aborted],
            StepState::Succeeded | StepState::Aborted => &[],
        }
    }

    pub fn can_transition(&self, to: StepState) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timestamped state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: StepState,
    pub to: StepState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition for step '{step_id}': {from} -> {to}")]
pub struct InvalidTransition {
    pub step_id: String,
    pub from: StepState,
    pub to: StepState,
}

/// State machine for one step, keeping its full transition history.
#[derive(Debug, Clone)]
pub struct StepMachine {
    step_id: String,
    state: StepState,
    attempt: u32,
    history: Vec<Transition>,
}

impl StepMachine {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            state: StepState::Pending,
            attempt: 0,
            history: Vec::new(),
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    /// Number of times the step has entered `Running`.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// `Pending -> Running` or `Failed -> Running`.
    pub fn start(&mut self) -> Result<Transition, InvalidTransition> {
        let transition = self.transition(StepState::Running)?;
        self.attempt += 1;
        Ok(transition)
    }

    pub fn succeed(&mut self) -> Result<Transition, InvalidTransition> {
        self.transition(StepState::Succeeded)
    }

    pub fn fail(&mut self) -> Result<Transition, InvalidTransition> {
        self.transition(StepState::Failed)
    }

    pub fn abort(&mut self) -> Result<Transition, InvalidTransition> {
        self.transition(StepState::Aborted)
    }

    fn transition(&mut self, to: StepState) -> Result<Transition, InvalidTransition> {
        if !self.state.can_transition(to) {
            return Err(InvalidTransition {
                step_id: self.step_id.clone(),
                from: self.state,
                to,
            });
        }
        let transition = Transition {
            from: self.state,
            to,
            at: Utc::now(),
        };
        self.state = to;
        self.history.push(transition.clone());
        Ok(transition)
    }
}

/// Retries consumed per failure bucket for one step.
///
/// Content buckets draw from `retry_budget`; transient failures draw from the
/// separate, smaller `transient_budget`.
#[derive(Debug, Clone)]
pub struct RetryLedger {
    retry_budget: u32,
    transient_budget: u32,
    used: BTreeMap<FailureBucket, u32>,
}

impl RetryLedger {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            retry_budget: config.retry_budget,
            transient_budget: config.transient_budget,
            used: BTreeMap::new(),
        }
    }

    pub fn limit(&self, bucket: FailureBucket) -> u32 {
        if bucket.is_transient() {
            self.transient_budget
        } else {
            self.retry_budget
        }
    }

    pub fn used(&self, bucket: FailureBucket) -> u32 {
        self.used.get(&bucket).copied().unwrap_or(0)
    }

    /// Spend one retry from `bucket`. Returns `false` once it is exhausted.
    pub fn try_consume(&mut self, bucket: FailureBucket) -> bool {
        let limit = self.limit(bucket);
        let used = self.used.entry(bucket).or_insert(0);
        if *used >= limit {
            return false;
        }
        *used += 1;
        true
    }

    pub fn total_used(&self) -> u32 {
        self.used.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(StepState::Pending.can_transition(StepState::Running));
        assert!(StepState::Running.can_transition(StepState::Succeeded));
        assert!(StepState::Running.can_transition(StepState::Failed));
        assert!(StepState::Failed.can_transition(StepState::Running));
        assert!(StepState::Failed.can_transition(StepState::Aborted));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for to in [
            StepState::Pending,
            StepState::Running,
            StepState::Succeeded,
            StepState::Failed,
            StepState::Aborted,
        ] {
            assert!(!StepState::Succeeded.can_transition(to));
            assert!(!StepState::Aborted.can_transition(to));
        }
        assert!(!StepState::Pending.can_transition(StepState::Succeeded));
        assert!(!StepState::Running.can_transition(StepState::Aborted));
    }

    #[test]
    fn test_machine_records_history_and_attempts() {
        let mut m = StepMachine::new("a");
        m.start().unwrap();
        m.fail().unwrap();
        m.start().unwrap();
        m.succeed().unwrap();
        assert_eq!(m.attempt(), 2);
        assert_eq!(m.state(), StepState::Succeeded);
        assert_eq!(m.history().len(), 4);
        assert_eq!(m.history()[1].to, StepState::Failed);

        let err = m.start().unwrap_err();
        assert_eq!(err.from, StepState::Succeeded);
        assert!(err.to_string().contains("succeeded -> running"));
    }

    #[test]
    fn test_abort_is_final() {
        let mut m = StepMachine::new("a");
        m.start().unwrap();
        m.fail().unwrap();
        m.abort().unwrap();
        assert!(m.state().is_terminal());
        assert!(m.abort().is_err());
        assert!(m.start().is_err());
    }

    #[test]
    fn test_retry_ledger_budgets_per_bucket() {
        let config = EngineConfig {
            retry_budget: 2,
            transient_budget: 1,
            ..Default::default()
        };
        let mut ledger = RetryLedger::new(&config);
        assert!(ledger.try_consume(FailureBucket::Structural));
        assert!(ledger.try_consume(FailureBucket::Structural));
        assert!(!ledger.try_consume(FailureBucket::Structural));
        assert_eq!(ledger.used(FailureBucket::Structural), 2);

        assert!(ledger.try_consume(FailureBucket::Transient));
        assert!(!ledger.try_consume(FailureBucket::Transient));
        assert!(ledger.try_consume(FailureBucket::Assertion));
        assert_eq!(ledger.total_used(), 4);
    }
}
