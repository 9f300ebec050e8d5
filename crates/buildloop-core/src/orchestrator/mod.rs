//! Execution orchestrator.
//!
//! Phases run strictly in declared order. Within a phase, steps whose
//! same-phase prerequisites have succeeded run concurrently on a bounded
//! worker pool. A failing `verify` step halts further scheduling in its phase
//! until its repair cycle ends, and the first aborted step stops the run.

mod report;
mod step;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, Instrument};
use uuid::Uuid;

pub use report::{
    AbortedStep, ExecutionResult, PhaseReport, PlanOutcome, PlanReport, StepReport,
};

use crate::audit::AuditTrail;
use crate::cancel::StopHandle;
use crate::checkpoint::RunCheckpoint;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::obs;
use crate::plan::Plan;
use crate::repair::RepairAdvisor;
use crate::state::StepState;
use crate::tools::{ExecLimits, ToolInvoker, Workspace};
use step::StepDriver;

/// Everything a step task needs, shared read-only for one run.
pub(crate) struct RunContext {
    pub(crate) plan: Arc<Plan>,
    pub(crate) config: EngineConfig,
    pub(crate) invoker: ToolInvoker,
    pub(crate) advisor: Arc<dyn RepairAdvisor>,
    pub(crate) audit: AuditTrail,
    pub(crate) stop: StopHandle,
}

/// Drives plans against one workspace.
pub struct Orchestrator {
    config: EngineConfig,
    invoker: ToolInvoker,
    advisor: Arc<dyn RepairAdvisor>,
    audit: AuditTrail,
    stop: StopHandle,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        workspace_root: &Path,
        advisor: Arc<dyn RepairAdvisor>,
        audit: AuditTrail,
    ) -> Result<Self> {
        config.validate()?;
        let workspace = Workspace::new(workspace_root)?;
        let invoker = ToolInvoker::new(workspace, ExecLimits::from_config(&config));
        Ok(Self {
            config,
            invoker,
            advisor,
            audit,
            stop: StopHandle::new(),
        })
    }

    /// External stop signal. Raising it cancels in-flight tool invocations
    /// and prevents further steps from starting.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn workspace(&self) -> &Workspace {
        self.invoker.workspace()
    }

    /// Run `plan` to completion or abort. Steps recorded as succeeded in
    /// `checkpoint` with an unchanged definition are skipped silently;
    /// newly succeeded steps are added to it.
    pub async fn run(&self, plan: Arc<Plan>, checkpoint: &mut RunCheckpoint) -> Result<PlanReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::plan_span(&plan.name, &run_id);
        self.run_inner(plan, checkpoint, run_id)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        plan: Arc<Plan>,
        checkpoint: &mut RunCheckpoint,
        run_id: String,
    ) -> Result<PlanReport> {
        let started = Instant::now();
        obs::emit_plan_started(&plan.name, plan.phases.len(), plan.step_count());

        let run_stop = StopHandle::new();
        let forward = {
            let external = self.stop.clone();
            let run_stop = run_stop.clone();
            tokio::spawn(async move {
                external.stopped().await;
                run_stop.stop();
            })
        };
        let ctx = Arc::new(RunContext {
            plan: plan.clone(),
            config: self.config.clone(),
            invoker: self.invoker.clone(),
            advisor: self.advisor.clone(),
            audit: self.audit.clone(),
            stop: run_stop.clone(),
        });

        let mut phases = Vec::with_capacity(plan.phases.len());
        let mut first_aborted: Option<AbortedStep> = None;
        let mut halted_early = false;

        for phase in &plan.phases {
            if halted_early || run_stop.is_stopped() {
                halted_early = true;
                phases.push(PhaseReport::not_run(phase, |s| checkpoint.is_succeeded(s)));
                continue;
            }

            let report = match run_phase(ctx.clone(), phase.index, checkpoint).await {
                Ok(report) => report,
                Err(e) => {
                    forward.abort();
                    return Err(e);
                }
            };
            for step_report in &report.steps {
                if step_report.state == StepState::Succeeded {
                    if let Some(step) = plan.step(&step_report.id) {
                        checkpoint.record(step, StepState::Succeeded);
                    }
                }
            }
            if first_aborted.is_none() {
                first_aborted = report
                    .steps
                    .iter()
                    .find(|s| s.state == StepState::Aborted)
                    .map(|s| AbortedStep {
                        step_id: s.id.clone(),
                        phase: phase.name.clone(),
                    });
            }
            let succeeded = report.succeeded();
            obs::emit_phase_finished(&phase.name, succeeded);
            phases.push(report);
            if !succeeded {
                halted_early = true;
            }
        }
        forward.abort();

        let outcome = if !halted_early {
            PlanOutcome::Succeeded
        } else {
            let reason = match &first_aborted {
                Some(aborted) => {
                    let detail = phases
                        .iter()
                        .flat_map(|p| p.steps.iter())
                        .find(|s| s.id == aborted.step_id)
                        .and_then(|s| s.abort_reason.clone())
                        .unwrap_or_default();
                    format!(
                        "step '{}' in phase '{}' aborted: {detail}",
                        aborted.step_id, aborted.phase
                    )
                }
                None => "stopped by external signal".to_string(),
            };
            PlanOutcome::Aborted { reason }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        obs::emit_plan_finished(&plan.name, duration_ms, outcome == PlanOutcome::Succeeded);
        Ok(PlanReport {
            run_id,
            plan_name: plan.name.clone(),
            outcome,
            phases,
            first_aborted,
            duration_ms,
        })
    }
}

/// Run one phase until every launchable step is terminal.
async fn run_phase(
    ctx: Arc<RunContext>,
    phase_index: usize,
    checkpoint: &RunCheckpoint,
) -> Result<PhaseReport> {
    let phase = &ctx.plan.phases[phase_index];

    let mut states: HashMap<String, StepState> = HashMap::new();
    let mut reports: HashMap<String, StepReport> = HashMap::new();
    for step in &phase.steps {
        if checkpoint.is_succeeded(step) {
            obs::emit_step_skipped(&step.id);
            states.insert(step.id.clone(), StepState::Succeeded);
            reports.insert(step.id.clone(), StepReport::skipped(step));
        } else {
            states.insert(step.id.clone(), StepState::Pending);
        }
    }

    let independent = phase
        .steps
        .iter()
        .filter(|s| states.get(&s.id) == Some(&StepState::Pending))
        .filter(|s| {
            s.waits_for
                .iter()
                .all(|d| states.get(d) == Some(&StepState::Succeeded))
        })
        .count();
    let workers = independent.clamp(1, ctx.config.max_workers);
    obs::emit_phase_started(&phase.name, phase.steps.len(), workers);

    let semaphore = Arc::new(Semaphore::new(workers));
    let halted = Arc::new(AtomicUsize::new(0));
    let mut launched: HashSet<String> = HashSet::new();
    let mut tasks: JoinSet<StepReport> = JoinSet::new();
    let mut aborted = false;

    loop {
        if !aborted && !ctx.stop.is_stopped() && halted.load(Ordering::SeqCst) == 0 {
            for (position, step) in phase.steps.iter().enumerate() {
                if launched.contains(&step.id)
                    || states.get(&step.id) != Some(&StepState::Pending)
                {
                    continue;
                }
                let ready = step
                    .waits_for
                    .iter()
                    .all(|d| states.get(d) == Some(&StepState::Succeeded));
                if !ready {
                    continue;
                }
                launched.insert(step.id.clone());

                let ctx = ctx.clone();
                let semaphore = semaphore.clone();
                let halted = halted.clone();
                let span = obs::step_span(&step.id, &phase.name);
                tasks.spawn(
                    async move {
                        let _permit = semaphore.acquire_owned().await.ok();
                        drive_step(ctx, phase_index, position, halted).await
                    }
                    .instrument(span),
                );
            }
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let report = joined.map_err(|e| EngineError::Worker(e.to_string()))?;
        if report.state == StepState::Aborted && !aborted {
            aborted = true;
            info!(step = %report.id, phase = %phase.name, "stopping run after abort");
            ctx.stop.stop();
        }
        states.insert(report.id.clone(), report.state);
        reports.insert(report.id.clone(), report);
    }

    let steps = phase
        .steps
        .iter()
        .map(|s| {
            reports
                .remove(&s.id)
                .unwrap_or_else(|| StepReport::pending(s))
        })
        .collect();
    Ok(PhaseReport {
        name: phase.name.clone(),
        index: phase.index,
        steps,
    })
}

async fn drive_step(
    ctx: Arc<RunContext>,
    phase_index: usize,
    position: usize,
    halted: Arc<AtomicUsize>,
) -> StepReport {
    let phase = &ctx.plan.phases[phase_index];
    let step = &phase.steps[position];
    if ctx.stop.is_stopped() {
        return StepReport::pending(step);
    }
    StepDriver::new(&ctx, step, &phase.name, halted)
        .drive()
        .await
}
