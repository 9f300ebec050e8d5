//! Per-step driver: execute, classify, repair, retry or abort.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use super::report::{ExecutionResult, StepReport};
use super::RunContext;
use crate::audit::{AuditEntry, AuditOperation, AuditOutcome};
use crate::classify::{
    classify_failure, extract_location, extract_missing_name, FailureBucket, FailureContext,
    SourceLocation, StepFailure,
};
use crate::obs;
use crate::plan::{normalize_path, Step, StepAction, StepKind};
use crate::repair::{
    NoProgressGuard, RepairAttempt, RepairExhausted, RepairProposal, RepairRejection,
};
use crate::state::{RetryLedger, StepMachine, StepState, Transition};
use crate::tools::{FileSnapshot, ProcessOutput, ToolInvocationError, ToolOutput, ToolRequest};

/// Translate a step action into the tool request that carries it out.
/// `verify` steps without a command inspect files directly and have none.
pub(crate) fn step_request(action: &StepAction) -> Option<ToolRequest> {
    match action.clone() {
        StepAction::FileCreate {
            path,
            content,
            overwrite,
        } => Some(ToolRequest::Create {
            path,
            content,
            overwrite,
        }),
        StepAction::TextReplace { path, old, new } => Some(ToolRequest::Replace { path, old, new }),
        StepAction::Append { path, content } => Some(ToolRequest::Append { path, content }),
        StepAction::Command {
            command,
            workdir,
            timeout_secs,
            env,
        } => Some(ToolRequest::Execute {
            command,
            workdir,
            timeout_secs,
            env,
        }),
        StepAction::Verify {
            command: Some(command),
            workdir,
            timeout_secs,
            ..
        } => Some(ToolRequest::Execute {
            command,
            workdir,
            timeout_secs,
            env: BTreeMap::new(),
        }),
        StepAction::Verify { command: None, .. } => None,
    }
}

/// Decrements the phase halt counter when a failing `verify` step finishes.
struct HaltGuard(Arc<AtomicUsize>);

impl Drop for HaltGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Attempt {
    failure: Option<StepFailure>,
    output: String,
    request: Option<ToolRequest>,
}

enum Next {
    Retry,
    /// A repair edit performed the step's own mutation.
    Completed(ExecutionResult),
    Abort(RepairExhausted),
    Cancelled,
}

pub(crate) struct StepDriver<'a> {
    ctx: &'a RunContext,
    step: &'a Step,
    phase: &'a str,
    machine: StepMachine,
    ledger: RetryLedger,
    guard: NoProgressGuard,
    results: Vec<ExecutionResult>,
    dependency_steps: Vec<String>,
    halted: Arc<AtomicUsize>,
    halt: Option<HaltGuard>,
    abort_reason: Option<String>,
}

impl<'a> StepDriver<'a> {
    pub(crate) fn new(
        ctx: &'a RunContext,
        step: &'a Step,
        phase: &'a str,
        halted: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            ctx,
            step,
            phase,
            machine: StepMachine::new(&step.id),
            ledger: RetryLedger::new(&ctx.config),
            guard: NoProgressGuard::new(),
            results: Vec::new(),
            dependency_steps: Vec::new(),
            halted,
            halt: None,
            abort_reason: None,
        }
    }

    /// Run the step to a terminal state, or until the run is stopped.
    pub(crate) async fn drive(mut self) -> StepReport {
        loop {
            if self.ctx.stop.is_stopped() {
                if self.machine.state() == StepState::Failed {
                    self.record_cancelled("stopped before retry").await;
                }
                break;
            }

            self.enter(StepState::Running).await;
            let attempt = self.run_attempt().await;
            let Some(failure) = attempt.failure else {
                self.enter(StepState::Succeeded).await;
                break;
            };
            self.enter(StepState::Failed).await;

            if self.is_cancelled(&failure) {
                break;
            }
            if self.step.kind() == StepKind::Verify && self.halt.is_none() {
                self.halted.fetch_add(1, Ordering::SeqCst);
                self.halt = Some(HaltGuard(self.halted.clone()));
            }

            match self.recover(failure, attempt.output, attempt.request).await {
                Next::Retry => continue,
                Next::Completed(result) => {
                    self.enter(StepState::Running).await;
                    self.results.push(result);
                    self.enter(StepState::Succeeded).await;
                    break;
                }
                Next::Abort(exhausted) => {
                    self.abort_with(exhausted).await;
                    break;
                }
                Next::Cancelled => {
                    self.record_cancelled("stopped during repair").await;
                    break;
                }
            }
        }

        StepReport {
            id: self.step.id.clone(),
            kind: self.step.kind(),
            state: self.machine.state(),
            attempts: self.machine.attempt(),
            skipped: false,
            results: self.results,
            dependency_steps: self.dependency_steps,
            abort_reason: self.abort_reason,
        }
    }

    fn is_cancelled(&self, failure: &StepFailure) -> bool {
        matches!(
            failure,
            StepFailure::ToolInvocation(ToolInvocationError::Cancelled)
        ) || self.ctx.stop.is_stopped()
    }

    fn operation(&self, request: Option<&ToolRequest>) -> AuditOperation {
        match (self.step.kind(), request) {
            (StepKind::Verify, _) | (_, None) => AuditOperation::Verify,
            (_, Some(req)) => AuditOperation::from_op_name(req.op_name()),
        }
    }

    async fn run_attempt(&mut self) -> Attempt {
        let attempt = self.machine.attempt();
        let request = step_request(&self.step.action);
        let operation = self.operation(request.as_ref());
        let mut result = ExecutionResult::started(&self.step.id, attempt, operation);

        let failure = match &request {
            Some(req) => match self.ctx.invoker.invoke(req, &self.ctx.stop).await {
                Ok(ToolOutput::Mutated { diff, .. }) => {
                    result.diff = Some(diff);
                    None
                }
                Ok(ToolOutput::Content { .. }) => None,
                Ok(ToolOutput::Process(out)) => {
                    let failure = self.judge_process(&out);
                    result.exit_code = Some(out.exit_code);
                    result.stdout = out.stdout;
                    result.stderr = out.stderr;
                    failure
                }
                Err(err) => Some(StepFailure::from(err)),
            },
            None => self.check_inspected_files().await,
        };
        result.finish(failure.as_ref().map(ToString::to_string));

        let outcome = match &failure {
            None => AuditOutcome::Ok,
            Some(StepFailure::ToolInvocation(ToolInvocationError::Cancelled)) => {
                AuditOutcome::Cancelled
            }
            Some(_) => AuditOutcome::Failed,
        };
        let diagnostic = match &failure {
            Some(f) => f.to_string(),
            None => self.step.target(),
        };
        let entry = AuditEntry::new(&self.step.id, self.phase, attempt, operation, outcome)
            .with_diagnostic(diagnostic)
            .with_detail(json!({
                "exit_code": result.exit_code,
                "diff": result.diff,
                "duration_ms": result.duration_ms,
            }));
        self.audit(entry).await;

        let output = result.output();
        self.results.push(result);
        Attempt {
            failure,
            output,
            request,
        }
    }

    fn judge_process(&self, out: &ProcessOutput) -> Option<StepFailure> {
        match &self.step.action {
            StepAction::Verify { expect, .. } => expect
                .check_command(out.exit_code, &out.combined())
                .err()
                .map(|reason| StepFailure::VerificationFailure { reason }),
            _ if out.success() => None,
            _ => Some(StepFailure::CommandFailure {
                exit_code: out.exit_code,
            }),
        }
    }

    async fn check_inspected_files(&self) -> Option<StepFailure> {
        let StepAction::Verify { expect, .. } = &self.step.action else {
            return None;
        };
        for path in self.ctx.plan.inspected_files(self.step) {
            match self.ctx.invoker.snapshot(&path).await {
                Ok(Some(snapshot)) => {
                    if let Err(reason) = expect.check_content(&snapshot.content) {
                        return Some(StepFailure::VerificationFailure {
                            reason: format!("{path}: {reason}"),
                        });
                    }
                }
                Ok(None) => {
                    return Some(StepFailure::VerificationFailure {
                        reason: format!("{path} does not exist"),
                    })
                }
                Err(err) => return Some(err.into()),
            }
        }
        None
    }

    async fn recover(
        &mut self,
        failure: StepFailure,
        output: String,
        request: Option<ToolRequest>,
    ) -> Next {
        let kind = self.step.kind();
        let bucket = classify_failure(kind, &failure, &output);
        let attempt = self.machine.attempt();
        obs::emit_failure_classified(&self.step.id, attempt, bucket);

        if bucket == FailureBucket::MalformedInput {
            if let Some(req) = &request {
                self.guard.record_rejected(req);
            }
        }
        let mut context = self.failure_context(failure, output, bucket).await;
        let mut last = context.diagnostic();
        self.audit(
            AuditEntry::new(
                &self.step.id,
                self.phase,
                attempt,
                AuditOperation::Classify,
                AuditOutcome::Failed,
            )
            .with_bucket(bucket)
            .with_diagnostic(last.clone()),
        )
        .await;

        // Only the plan can change a command's arguments; retrying it would
        // repeat the rejected request verbatim.
        if bucket == FailureBucket::MalformedInput && !kind.is_mutation() {
            self.ledger.try_consume(bucket);
            self.record_rejection(bucket, &RepairRejection::NoProgress, None)
                .await;
            return Next::Abort(self.exhausted(bucket, last));
        }

        loop {
            if self.ctx.stop.is_stopped() {
                return Next::Cancelled;
            }
            if !self.ledger.try_consume(bucket) {
                return Next::Abort(self.exhausted(bucket, last));
            }

            let proposal = match bucket {
                FailureBucket::Transient => return Next::Retry,
                FailureBucket::MissingDependency => {
                    match self.declared_acquisition(context.missing_name.as_deref()) {
                        Some(command) => RepairProposal::AcquireDependency { command },
                        None => self.consult(&context).await,
                    }
                }
                _ => self.consult(&context).await,
            };
            obs::emit_repair_proposed(&self.step.id, &proposal.describe());

            match proposal {
                RepairProposal::NoRepairAvailable => {
                    self.audit(
                        AuditEntry::new(
                            &self.step.id,
                            self.phase,
                            attempt,
                            AuditOperation::Repair,
                            AuditOutcome::Rejected,
                        )
                        .with_bucket(bucket)
                        .with_diagnostic("no repair available"),
                    )
                    .await;
                    return Next::Abort(
                        self.exhausted(bucket, format!("{last}; no repair available")),
                    );
                }
                RepairProposal::AcquireDependency { command } => {
                    return if self.acquire_dependency(&command, bucket).await {
                        Next::Retry
                    } else {
                        Next::Abort(self.exhausted(
                            bucket,
                            format!("{last}; dependency acquisition `{command}` failed"),
                        ))
                    };
                }
                RepairProposal::Edit(repair) => match self.apply_edit(&repair, bucket).await {
                    Ok(result) => {
                        return if bucket == FailureBucket::MalformedInput && kind.is_mutation() {
                            Next::Completed(result)
                        } else {
                            self.results.push(result);
                            Next::Retry
                        };
                    }
                    Err(rejection @ RepairRejection::ReopensCompletedStep(_)) => {
                        return Next::Abort(self.exhausted(bucket, rejection.to_string()));
                    }
                    Err(rejection) => {
                        if matches!(rejection, RepairRejection::Stale { .. }) {
                            context.snapshots = self.collect_snapshots(context.location.as_ref()).await;
                        }
                        last = rejection.to_string();
                    }
                },
            }
        }
    }

    async fn failure_context(
        &self,
        failure: StepFailure,
        output: String,
        bucket: FailureBucket,
    ) -> FailureContext {
        let location = extract_location(&output);
        let missing_name = extract_missing_name(&output);
        let snapshots = self.collect_snapshots(location.as_ref()).await;
        let repair_targets = if self.step.kind() == StepKind::Verify {
            self.step.covers.clone()
        } else {
            vec![self.step.id.clone()]
        };
        FailureContext {
            step_id: self.step.id.clone(),
            phase: self.phase.to_string(),
            kind: self.step.kind(),
            target: self.step.target(),
            attempt: self.machine.attempt(),
            failure,
            output,
            bucket,
            location,
            missing_name,
            snapshots,
            repair_targets,
        }
    }

    /// Current content of every file this step is tied to.
    async fn collect_snapshots(
        &self,
        location: Option<&SourceLocation>,
    ) -> BTreeMap<String, FileSnapshot> {
        let mut paths = BTreeSet::new();
        if let Some(path) = self.step.action.file_path() {
            paths.insert(path.to_string());
        }
        if self.step.kind() == StepKind::Verify {
            paths.extend(self.ctx.plan.inspected_files(self.step));
        }
        if let Some(location) = location {
            paths.insert(location.path.clone());
        }

        let mut snapshots = BTreeMap::new();
        for path in paths {
            if let Ok(Some(snapshot)) = self.ctx.invoker.snapshot(&path).await {
                snapshots.insert(snapshot.path.clone(), snapshot);
            }
        }
        snapshots
    }

    fn declared_acquisition(&self, name: Option<&str>) -> Option<String> {
        let name = name?;
        let plan = &self.ctx.plan;
        plan.acquisition_for(name)
            .or_else(|| {
                name.split(|c: char| c == '.' || c == '/')
                    .next()
                    .and_then(|root| plan.acquisition_for(root))
            })
            .map(str::to_string)
    }

    async fn consult(&self, context: &FailureContext) -> RepairProposal {
        match self.ctx.advisor.classify(context).await {
            Ok(proposal) => proposal,
            Err(err) => {
                warn!(step = %self.step.id, error = %err, "repair advisor failed");
                RepairProposal::NoRepairAvailable
            }
        }
    }

    /// Refuse assertion repairs, and any edit proposed for a verify step, whose
    /// target is only produced by steps of an earlier, already completed phase.
    fn check_reopen(&self, target: &str) -> Result<(), RepairRejection> {
        let target = normalize_path(target);
        let producers: Vec<&Step> = self
            .ctx
            .plan
            .steps()
            .filter(|s| s.action.file_path() == Some(target.as_str()))
            .collect();
        match producers.last() {
            Some(last) if producers.iter().all(|s| s.phase < self.step.phase) => {
                Err(RepairRejection::ReopensCompletedStep(last.id.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn apply_edit(
        &mut self,
        repair: &RepairAttempt,
        bucket: FailureBucket,
    ) -> Result<ExecutionResult, RepairRejection> {
        let request = repair.to_request();
        let verifying = self.step.kind() == StepKind::Verify;
        let checked = if verifying || bucket == FailureBucket::Assertion {
            self.check_reopen(&repair.target)
        } else {
            Ok(())
        }
        .and_then(|_| self.guard.check(&request));
        if let Err(rejection) = checked {
            self.record_rejection(bucket, &rejection, Some(repair)).await;
            return Err(rejection);
        }

        let attempt = self.machine.attempt();
        let mut result = ExecutionResult::started(&self.step.id, attempt, AuditOperation::Repair);
        match self.ctx.invoker.apply_repair(repair).await {
            Ok(output) => {
                if let ToolOutput::Mutated { diff, .. } = output {
                    result.diff = Some(diff);
                }
                result.finish(None);
                self.audit(
                    AuditEntry::new(
                        &self.step.id,
                        self.phase,
                        attempt,
                        AuditOperation::Repair,
                        AuditOutcome::Ok,
                    )
                    .with_bucket(bucket)
                    .with_diagnostic(RepairProposal::Edit(repair.clone()).describe())
                    .with_detail(json!({ "repair": repair, "diff": result.diff })),
                )
                .await;
                Ok(result)
            }
            Err(err) => {
                if !matches!(err, ToolInvocationError::StaleSnapshot { .. }) {
                    self.guard.record_rejected(&request);
                }
                let rejection = RepairRejection::from(err);
                self.record_rejection(bucket, &rejection, Some(repair)).await;
                Err(rejection)
            }
        }
    }

    async fn record_rejection(
        &self,
        bucket: FailureBucket,
        rejection: &RepairRejection,
        repair: Option<&RepairAttempt>,
    ) {
        obs::emit_repair_rejected(&self.step.id, rejection);
        let mut entry = AuditEntry::new(
            &self.step.id,
            self.phase,
            self.machine.attempt(),
            AuditOperation::Repair,
            AuditOutcome::Rejected,
        )
        .with_bucket(bucket)
        .with_diagnostic(rejection.to_string());
        if let Some(repair) = repair {
            entry = entry.with_detail(json!({ "repair": repair }));
        }
        self.audit(entry).await;
    }

    /// Run an inserted dependency acquisition step. Returns whether it succeeded.
    async fn acquire_dependency(&mut self, command: &str, bucket: FailureBucket) -> bool {
        let dep_id = format!("{}+dep{}", self.step.id, self.dependency_steps.len() + 1);
        self.dependency_steps.push(dep_id.clone());
        let mut machine = StepMachine::new(&dep_id);

        if let Ok(t) = machine.start() {
            self.audit_transition(&dep_id, 1, &t).await;
        }
        let request = ToolRequest::Execute {
            command: command.to_string(),
            workdir: None,
            timeout_secs: None,
            env: BTreeMap::new(),
        };
        let mut result = ExecutionResult::started(&dep_id, 1, AuditOperation::AcquireDependency);
        let error = match self.ctx.invoker.invoke(&request, &self.ctx.stop).await {
            Ok(ToolOutput::Process(out)) => {
                let error = (!out.success()).then(|| {
                    StepFailure::CommandFailure {
                        exit_code: out.exit_code,
                    }
                    .to_string()
                });
                result.exit_code = Some(out.exit_code);
                result.stdout = out.stdout;
                result.stderr = out.stderr;
                error
            }
            Ok(_) => None,
            Err(err) => Some(err.to_string()),
        };
        let succeeded = error.is_none();
        result.finish(error.clone());

        self.audit(
            AuditEntry::new(
                &dep_id,
                self.phase,
                1,
                AuditOperation::AcquireDependency,
                if succeeded {
                    AuditOutcome::Ok
                } else {
                    AuditOutcome::Failed
                },
            )
            .with_bucket(bucket)
            .with_diagnostic(error.unwrap_or_else(|| command.to_string()))
            .with_detail(json!({ "for_step": self.step.id, "command": command })),
        )
        .await;
        self.results.push(result);

        let finished = if succeeded {
            machine.succeed()
        } else {
            machine.fail().and_then(|_| machine.abort())
        };
        if finished.is_ok() {
            for t in machine.history().iter().skip(1) {
                self.audit_transition(&dep_id, 1, t).await;
            }
        }
        succeeded
    }

    fn exhausted(&self, bucket: FailureBucket, last_diagnostic: String) -> RepairExhausted {
        RepairExhausted {
            step_id: self.step.id.clone(),
            bucket,
            attempts: self.ledger.used(bucket),
            last_diagnostic,
        }
    }

    async fn abort_with(&mut self, exhausted: RepairExhausted) {
        let reason = exhausted.to_string();
        match self.machine.abort() {
            Ok(t) => {
                obs::emit_step_transition(&self.step.id, t.from, t.to);
                let mut entry = AuditEntry::transition(&self.step.id, self.phase, self.machine.attempt(), &t)
                    .with_bucket(exhausted.bucket)
                    .with_diagnostic(reason.clone());
                entry.outcome = AuditOutcome::Exhausted;
                self.audit(entry).await;
            }
            Err(e) => warn!(error = %e, "abort rejected"),
        }
        obs::emit_step_aborted(&self.step.id, self.phase, &reason);
        self.abort_reason = Some(reason);
    }

    async fn enter(&mut self, to: StepState) {
        let changed = match to {
            StepState::Running => self.machine.start(),
            StepState::Succeeded => self.machine.succeed(),
            StepState::Failed => self.machine.fail(),
            StepState::Aborted => self.machine.abort(),
            StepState::Pending => return,
        };
        match changed {
            Ok(t) => {
                let attempt = self.machine.attempt();
                self.audit_transition(&self.step.id, attempt, &t).await;
            }
            Err(e) => warn!(error = %e, "step transition rejected"),
        }
    }

    async fn audit_transition(&self, step_id: &str, attempt: u32, t: &Transition) {
        obs::emit_step_transition(step_id, t.from, t.to);
        self.audit(AuditEntry::transition(step_id, self.phase, attempt, t))
            .await;
    }

    async fn record_cancelled(&self, why: &str) {
        let entry = AuditEntry::new(
            &self.step.id,
            self.phase,
            self.machine.attempt(),
            self.operation(step_request(&self.step.action).as_ref()),
            AuditOutcome::Cancelled,
        )
        .with_diagnostic(why);
        self.audit(entry).await;
    }

    async fn audit(&self, entry: AuditEntry) {
        self.ctx.audit.record(entry).await;
    }
}
