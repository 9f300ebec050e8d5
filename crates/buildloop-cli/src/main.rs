//! buildloop - autonomous build-plan runner
//!
//! ## Commands
//!
//! - `run`: execute a plan against a workspace, repairing failures within budget
//! - `validate`: load a plan and report its shape without running it
//! - `report`: verify and print the audit artifact of a previous run

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn, Level};

use buildloop_core::{
    read_audit_artifact, render_summary_md, write_audit_artifact, AuditRecord, AuditTrail,
    EngineConfig, EngineError, NoRepairAdvisor, Orchestrator, Plan, PlanReport, RepairAdvisor,
    RunCheckpoint, ScriptedAdvisor, StepState,
};

const AUDIT_LOG: &str = "audit.jsonl";
const CHECKPOINT: &str = "checkpoint.json";
const REPORT: &str = "report.json";
const SUMMARY: &str = "summary.md";

#[derive(Parser)]
#[command(name = "buildloop")]
#[command(version = buildloop_core::VERSION)]
#[command(about = "Drive a phased build plan to completion", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan document against a workspace
    Run(RunArgs),

    /// Load a plan document and print its phases without running it
    Validate {
        /// Path to the plan document (JSON)
        plan: PathBuf,
    },

    /// Verify and print the audit artifact written by a previous run
    Report {
        /// Output directory of the run
        out: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Path to the plan document (JSON)
    plan: PathBuf,

    /// Workspace root all paths and commands are confined to
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Directory for the audit trail, checkpoint and summary
    #[arg(short, long, default_value = ".buildloop")]
    out: PathBuf,

    /// Repair attempts per step and failure bucket
    #[arg(long)]
    retry_budget: Option<u32>,

    /// Retries per step for transient failures
    #[arg(long)]
    transient_budget: Option<u32>,

    /// Upper bound on concurrently running steps within a phase
    #[arg(long)]
    max_workers: Option<usize>,

    /// Default timeout for commands, in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Skip steps recorded as succeeded in the output directory's checkpoint
    #[arg(long)]
    resume: bool,

    /// Scripted repair answers (JSON array) used instead of giving up
    #[arg(long)]
    repairs: Option<PathBuf>,
}

impl RunArgs {
    fn config(&self) -> Result<EngineConfig> {
        let mut config =
            EngineConfig::from_env().context("Invalid BUILDLOOP_* environment configuration")?;
        if let Some(v) = self.retry_budget {
            config.retry_budget = v;
        }
        if let Some(v) = self.transient_budget {
            config.transient_budget = v;
        }
        if let Some(v) = self.max_workers {
            config.max_workers = v;
        }
        if let Some(v) = self.timeout_secs {
            config.command_timeout_secs = v;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    buildloop_core::init_tracing(cli.json, level);

    let outcome = match cli.command {
        Commands::Run(args) => cmd_run(&args).await,
        Commands::Validate { plan } => cmd_validate(&plan),
        Commands::Report { out } => cmd_report(&out),
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// Malformed input exits with 2; every other error with 1.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::MalformedPlan(_)) | Some(EngineError::InvalidConfig(_)) => 2,
        _ => 1,
    }
}

fn load_plan(path: &Path) -> Result<Plan> {
    Plan::from_path(path).with_context(|| format!("Failed to load plan {:?}", path))
}

fn load_advisor(path: Option<&Path>) -> Result<Arc<dyn RepairAdvisor>> {
    let Some(path) = path else {
        return Ok(Arc::new(NoRepairAdvisor));
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read repair script {:?}", path))?;
    let advisor = ScriptedAdvisor::from_json_str(&json)
        .with_context(|| format!("Repair script is not valid JSON: {:?}", path))?;
    Ok(Arc::new(advisor))
}

/// Run a plan. Returns whether it succeeded.
async fn cmd_run(args: &RunArgs) -> Result<bool> {
    let plan = load_plan(&args.plan)?;
    let config = args.config()?;
    let advisor = load_advisor(args.repairs.as_deref())?;

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("Failed to create output directory {:?}", args.out))?;
    let checkpoint_path = args.out.join(CHECKPOINT);
    let mut checkpoint = if args.resume {
        RunCheckpoint::load(&checkpoint_path)
            .with_context(|| format!("Failed to read checkpoint {:?}", checkpoint_path))?
    } else {
        RunCheckpoint::new()
    };

    let log_path = args.out.join(AUDIT_LOG);
    if log_path.exists() {
        std::fs::remove_file(&log_path)
            .with_context(|| format!("Failed to reset audit log {:?}", log_path))?;
    }
    let trail = AuditTrail::with_jsonl(&log_path)
        .with_context(|| format!("Failed to open audit log {:?}", log_path))?;

    let orchestrator = Orchestrator::new(config, &args.workspace, advisor, trail.clone())
        .with_context(|| format!("Failed to open workspace {:?}", args.workspace))?;

    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping run");
            stop.stop();
        }
    });

    info!(plan = %plan.name, workspace = ?args.workspace, "starting run");
    let report = orchestrator
        .run(Arc::new(plan), &mut checkpoint)
        .await
        .context("Run failed")?;

    checkpoint
        .save(&checkpoint_path)
        .with_context(|| format!("Failed to write checkpoint {:?}", checkpoint_path))?;
    let record = AuditRecord::new(
        &report.run_id,
        &report.plan_name,
        report.succeeded(),
        trail.entries().await,
    );
    let artifact =
        write_audit_artifact(&record, &args.out).context("Failed to write audit artifact")?;
    std::fs::write(args.out.join(SUMMARY), render_summary_md(&record))
        .context("Failed to write summary")?;
    std::fs::write(
        args.out.join(REPORT),
        serde_json::to_vec_pretty(&report).context("Failed to serialise report")?,
    )
    .context("Failed to write report")?;

    print_report(&report);
    let lost = trail.sink_failures().await;
    if lost > 0 {
        anyhow::bail!(
            "{lost} audit entries were not written to {:?}; {:?} holds the full trail",
            log_path,
            artifact
        );
    }
    Ok(report.succeeded())
}

fn print_report(report: &PlanReport) {
    println!("Run ID: {}", report.run_id);
    println!(
        "Status: {}",
        if report.succeeded() {
            "✓ SUCCEEDED"
        } else {
            "✗ ABORTED"
        }
    );
    println!("Duration: {}ms", report.duration_ms);
    println!();

    for phase in &report.phases {
        println!("Phase {}:", phase.name);
        for step in &phase.steps {
            let mark = match step.state {
                StepState::Succeeded => "✓",
                StepState::Pending => "·",
                _ => "✗",
            };
            let note = if step.skipped { " (from checkpoint)" } else { "" };
            println!(
                "  {} {} [{}] {} after {} attempt(s){}",
                mark, step.id, step.kind, step.state, step.attempts, note
            );
        }
    }

    if let buildloop_core::PlanOutcome::Aborted { reason } = &report.outcome {
        println!();
        println!("Aborted: {}", reason);
    }
}

/// Validate a plan. Always succeeds when the plan loads.
fn cmd_validate(path: &Path) -> Result<bool> {
    let plan = load_plan(path)?;
    println!("Plan: {}", plan.name);
    for phase in &plan.phases {
        println!(
            "  {} ({} step(s), {} independent)",
            phase.name,
            phase.steps.len(),
            phase.independent_steps()
        );
    }
    println!("✓ {} step(s) valid", plan.step_count());
    Ok(true)
}

/// Print the verified summary of a previous run. Returns whether it succeeded.
fn cmd_report(out: &Path) -> Result<bool> {
    let record = read_audit_artifact(out)
        .with_context(|| format!("Failed to read audit artifact in {:?}", out))?;
    print!("{}", render_summary_md(&record));
    Ok(record.succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(plan: PathBuf, workspace: &Path, out: PathBuf) -> RunArgs {
        RunArgs {
            plan,
            workspace: workspace.to_path_buf(),
            out,
            retry_budget: None,
            transient_budget: None,
            max_workers: None,
            timeout_secs: None,
            resume: false,
            repairs: None,
        }
    }

    const PLAN: &str = r#"{
        "name": "hello",
        "phases": [{"name": "write", "steps": [
            {"id": "create", "kind": "file-create", "path": "hello.txt", "content": "hi\n"},
            {"id": "check", "kind": "verify", "inspects": ["hello.txt"], "expect": {"contains": "hi"}}
        ]}]
    }"#;

    #[tokio::test]
    async fn test_run_writes_artifacts_and_report_reads_them_back() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(&workspace).unwrap();
        let plan_path = dir.path().join("plan.json");
        std::fs::write(&plan_path, PLAN).unwrap();
        let out = dir.path().join("out");

        let ok = cmd_run(&run_args(plan_path, &workspace, out.clone()))
            .await
            .unwrap();
        assert!(ok);
        for name in [AUDIT_LOG, CHECKPOINT, REPORT, SUMMARY, "audit.json", "audit.digest"] {
            assert!(out.join(name).exists(), "missing {name}");
        }
        assert_eq!(
            std::fs::read_to_string(workspace.join("hello.txt")).unwrap(),
            "hi\n"
        );
        assert!(cmd_report(&out).unwrap());
    }

    #[tokio::test]
    async fn test_resume_skips_completed_steps() {
        let dir = tempfile::tempdir().unwrap();
        let plan_path = dir.path().join("plan.json");
        std::fs::write(&plan_path, PLAN).unwrap();
        let out = dir.path().join("out");
        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(&workspace).unwrap();

        let mut args = run_args(plan_path, &workspace, out.clone());
        assert!(cmd_run(&args).await.unwrap());
        args.resume = true;
        // A second create would fail with AlreadyExists if it were re-run.
        assert!(cmd_run(&args).await.unwrap());

        let record = read_audit_artifact(&out).unwrap();
        assert!(record.entries.is_empty());
    }

    #[test]
    fn test_malformed_plan_maps_to_exit_code_two() {
        let dir = tempfile::tempdir().unwrap();
        let plan_path = dir.path().join("plan.json");
        std::fs::write(&plan_path, r#"{"name": "x", "phases": []}"#).unwrap();

        let err = cmd_validate(&plan_path).unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_tampered_audit_artifact_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let record = AuditRecord::new("run-1", "plan", true, Vec::new());
        write_audit_artifact(&record, dir.path()).unwrap();
        std::fs::write(dir.path().join("audit.digest"), "0000").unwrap();

        let err = cmd_report(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::DigestMismatch { .. })
        ));
        assert_eq!(exit_code_for(&err), 1);
    }
}
