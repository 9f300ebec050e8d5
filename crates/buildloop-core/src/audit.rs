//! Append-only audit trail of every attempted action and its outcome.
//!
//! Entries are numbered in the order they are recorded and optionally
//! mirrored to a JSON-lines sink as they happen. At the end of a run the
//! trail is frozen into an [`AuditRecord`] artifact with a digest sidecar.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::classify::FailureBucket;
use crate::digest::ContentDigest;
use crate::error::{EngineError, Result};
use crate::state::{StepState, Transition};

pub const AUDIT_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Create,
    Replace,
    Append,
    Read,
    Execute,
    Verify,
    Transition,
    Classify,
    Repair,
    AcquireDependency,
}

impl AuditOperation {
    pub fn from_op_name(name: &str) -> Self {
        match name {
            "create" => AuditOperation::Create,
            "replace" => AuditOperation::Replace,
            "append" => AuditOperation::Append,
            "read" => AuditOperation::Read,
            _ => AuditOperation::Execute,
        }
    }

    /// Operations that changed the file tree or ran a process.
    pub fn is_effect(&self) -> bool {
        matches!(
            self,
            AuditOperation::Create
                | AuditOperation::Replace
                | AuditOperation::Append
                | AuditOperation::Execute
                | AuditOperation::Verify
                | AuditOperation::Repair
                | AuditOperation::AcquireDependency
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Ok,
    Failed,
    Rejected,
    Exhausted,
    Cancelled,
}

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub step_id: String,
    pub phase: String,
    pub attempt: u32,
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub diagnostic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<FailureBucket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<StepState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state: Option<StepState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl AuditEntry {
    /// Start an entry; `seq` and `timestamp` are assigned when recorded.
    pub fn new(
        step_id: &str,
        phase: &str,
        attempt: u32,
        operation: AuditOperation,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            seq: 0,
            step_id: step_id.to_string(),
            phase: phase.to_string(),
            attempt,
            operation,
            outcome,
            timestamp: Utc::now(),
            diagnostic: String::new(),
            bucket: None,
            from_state: None,
            to_state: None,
            detail: None,
        }
    }

    pub fn transition(step_id: &str, phase: &str, attempt: u32, transition: &Transition) -> Self {
        let mut entry = Self::new(
            step_id,
            phase,
            attempt,
            AuditOperation::Transition,
            AuditOutcome::Ok,
        );
        entry.from_state = Some(transition.from);
        entry.to_state = Some(transition.to);
        entry.diagnostic = format!("{} -> {}", transition.from, transition.to);
        entry
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = diagnostic.into();
        self
    }

    pub fn with_bucket(mut self, bucket: FailureBucket) -> Self {
        self.bucket = Some(bucket);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[derive(Debug)]
struct TrailInner {
    entries: Vec<AuditEntry>,
    next_seq: u64,
    sink: Option<File>,
    sink_failures: u64,
}

/// Shared, append-only audit trail. Cloning yields another handle to the
/// same trail.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    inner: Arc<Mutex<TrailInner>>,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrail {
    /// In-memory trail.
    pub fn new() -> Self {
        Self::from_parts(None)
    }

    /// Trail mirrored line by line to `path` (appending if it exists).
    pub fn with_jsonl(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_parts(Some(file)))
    }

    fn from_parts(sink: Option<File>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrailInner {
                entries: Vec::new(),
                next_seq: 1,
                sink,
                sink_failures: 0,
            })),
        }
    }

    /// Append an entry, stamping its sequence number and time.
    pub async fn record(&self, mut entry: AuditEntry) -> u64 {
        let mut inner = self.inner.lock().await;
        entry.seq = inner.next_seq;
        entry.timestamp = Utc::now();
        inner.next_seq += 1;

        if let Some(sink) = inner.sink.as_mut() {
            let written = serde_json::to_vec(&entry)
                .map_err(std::io::Error::from)
                .and_then(|mut line| {
                    line.push(b'\n');
                    sink.write_all(&line)
                });
            if let Err(e) = written {
                warn!(error = %e, seq = entry.seq, "failed to mirror audit entry");
                inner.sink_failures += 1;
            }
        }
        let seq = entry.seq;
        inner.entries.push(entry);
        seq
    }

    /// Entries that reached memory but not the JSON-lines sink.
    pub async fn sink_failures(&self) -> u64 {
        self.inner.lock().await.sink_failures
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().await.entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// The first step that was aborted and the classification history behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortMarker {
    pub step_id: String,
    pub phase: String,
    pub history: Vec<AuditEntry>,
}

impl AbortMarker {
    /// Locate the first `-> aborted` transition in `entries`.
    pub fn locate(entries: &[AuditEntry]) -> Option<Self> {
        let aborted = entries.iter().find(|e| {
            e.operation == AuditOperation::Transition && e.to_state == Some(StepState::Aborted)
        })?;
        let history = entries
            .iter()
            .filter(|e| e.step_id == aborted.step_id)
            .filter(|e| {
                e.bucket.is_some()
                    || matches!(
                        e.operation,
                        AuditOperation::Classify
                            | AuditOperation::Repair
                            | AuditOperation::AcquireDependency
                    )
            })
            .cloned()
            .collect();
        Some(Self {
            step_id: aborted.step_id.clone(),
            phase: aborted.phase.clone(),
            history,
        })
    }
}

/// Frozen audit trail of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub schema_version: String,
    pub run_id: String,
    pub plan_name: String,
    pub succeeded: bool,
    pub first_aborted: Option<AbortMarker>,
    pub entries: Vec<AuditEntry>,
}

impl AuditRecord {
    pub fn new(run_id: &str, plan_name: &str, succeeded: bool, entries: Vec<AuditEntry>) -> Self {
        Self {
            schema_version: AUDIT_SCHEMA_VERSION.to_string(),
            run_id: run_id.to_string(),
            plan_name: plan_name.to_string(),
            succeeded,
            first_aborted: AbortMarker::locate(&entries),
            entries,
        }
    }

    /// Last recorded state per step, in order of first appearance.
    pub fn final_states(&self) -> Vec<(String, String, StepState, u32)> {
        let mut out: Vec<(String, String, StepState, u32)> = Vec::new();
        for entry in &self.entries {
            let Some(to) = entry.to_state else { continue };
            match out.iter_mut().find(|(id, ..)| *id == entry.step_id) {
                Some(row) => {
                    row.2 = to;
                    row.3 = row.3.max(entry.attempt);
                }
                None => out.push((entry.step_id.clone(), entry.phase.clone(), to, entry.attempt)),
            }
        }
        out
    }
}

/// Write `<dir>/audit.json` and its `<dir>/audit.digest` sidecar.
pub fn write_audit_artifact(record: &AuditRecord, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let artifact_path = dir.join("audit.json");
    let digest_path = dir.join("audit.digest");
    let json = serde_json::to_vec_pretty(record)?;
    let digest = ContentDigest::from_bytes(&json);

    std::fs::write(&artifact_path, &json)?;
    std::fs::write(&digest_path, digest.as_str().as_bytes())?;

    Ok(artifact_path)
}

/// Read `<dir>/audit.json` and verify it against its digest sidecar.
pub fn read_audit_artifact(dir: &Path) -> Result<AuditRecord> {
    let json = std::fs::read(dir.join("audit.json"))?;
    let expected = std::fs::read_to_string(dir.join("audit.digest"))?;
    let actual = ContentDigest::from_bytes(&json);
    if expected.trim() != actual.as_str() {
        return Err(EngineError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(serde_json::from_slice(&json)?)
}

/// Render a Markdown summary of a run.
pub fn render_summary_md(record: &AuditRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Build Run: {}\n\n", record.plan_name));
    out.push_str(&format!("- Run: `{}`\n", record.run_id));
    out.push_str(&format!(
        "- Outcome: **{}**\n",
        if record.succeeded { "SUCCEEDED" } else { "ABORTED" }
    ));
    out.push_str(&format!("- Audit entries: {}\n\n", record.entries.len()));

    let states = record.final_states();
    if states.is_empty() {
        out.push_str("No steps were executed.\n");
    } else {
        let mut current_phase: Option<&str> = None;
        for (step_id, phase, state, attempts) in &states {
            if current_phase != Some(phase.as_str()) {
                out.push_str(&format!("## Phase `{phase}`\n\n"));
                out.push_str("| Step | State | Attempts |\n|---|---|---|\n");
                current_phase = Some(phase.as_str());
            }
            out.push_str(&format!("| `{step_id}` | {state} | {attempts} |\n"));
        }
        out.push('\n');
    }

    if let Some(marker) = &record.first_aborted {
        out.push_str("## First Aborted Step\n\n");
        out.push_str(&format!(
            "Step `{}` in phase `{}`.\n\n",
            marker.step_id, marker.phase
        ));
        if !marker.history.is_empty() {
            out.push_str("| Seq | Attempt | Operation | Bucket | Outcome | Diagnostic |\n");
            out.push_str("|---|---|---|---|---|---|\n");
            for e in &marker.history {
                out.push_str(&format!(
                    "| {} | {} | {:?} | {} | {:?} | {} |\n",
                    e.seq,
                    e.attempt,
                    e.operation,
                    e.bucket.map(|b| b.to_string()).unwrap_or_default(),
                    e.outcome,
                    e.diagnostic.replace('|', "\\|").replace('\n', " ")
                ));
            }
        }
    }
    out
}
