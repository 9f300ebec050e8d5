//! Repair proposals and the collaborator contract that produces them.
//!
//! The engine never assumes how a proposal is computed. A [`RepairAdvisor`]
//! may be a remote service, a scripted queue or nothing at all; an advisor
//! error is treated like [`RepairProposal::NoRepairAvailable`].

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::classify::{FailureBucket, FailureContext};
use crate::digest::ContentDigest;
use crate::plan::normalize_path;
use crate::tools::{ToolInvocationError, ToolRequest};

/// A corrective edit, valid only against the snapshot it was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub target: String,
    pub old: String,
    pub new: String,
    pub snapshot_digest: ContentDigest,
}

impl RepairAttempt {
    pub fn to_request(&self) -> ToolRequest {
        ToolRequest::Replace {
            path: normalize_path(&self.target),
            old: self.old.clone(),
            new: self.new.clone(),
        }
    }
}

/// What the advisor suggests for one failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "proposal", rename_all = "snake_case")]
pub enum RepairProposal {
    Edit(RepairAttempt),
    AcquireDependency { command: String },
    NoRepairAvailable,
}

impl RepairProposal {
    pub fn describe(&self) -> String {
        match self {
            RepairProposal::Edit(attempt) => format!(
                "replace {:?} with {:?} in {}",
                attempt.old, attempt.new, attempt.target
            ),
            RepairProposal::AcquireDependency { command } => format!("acquire via `{command}`"),
            RepairProposal::NoRepairAvailable => "no repair available".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("repair advisor unavailable: {0}")]
pub struct AdvisorError(pub String);

/// External collaborator that turns a classified failure into a proposal.
#[async_trait]
pub trait RepairAdvisor: Send + Sync {
    async fn classify(&self, context: &FailureContext) -> Result<RepairProposal, AdvisorError>;
}

/// Advisor that never proposes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRepairAdvisor;

#[async_trait]
impl RepairAdvisor for NoRepairAdvisor {
    async fn classify(&self, _context: &FailureContext) -> Result<RepairProposal, AdvisorError> {
        Ok(RepairProposal::NoRepairAvailable)
    }
}

/// One queued answer for [`ScriptedAdvisor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScriptedRepair {
    Replace { path: String, old: String, new: String },
    Dependency { command: String },
    Nothing,
}

/// Advisor that replays a fixed queue of answers in order.
///
/// Edits are bound to the snapshot carried in the failure context, so a
/// scripted edit goes through the same staleness check as any other.
#[derive(Debug, Default)]
pub struct ScriptedAdvisor {
    queue: Mutex<VecDeque<ScriptedRepair>>,
    consulted: AtomicUsize,
}

impl ScriptedAdvisor {
    pub fn new(script: impl IntoIterator<Item = ScriptedRepair>) -> Self {
        Self {
            queue: Mutex::new(script.into_iter().collect()),
            consulted: AtomicUsize::new(0),
        }
    }

    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        let script: Vec<ScriptedRepair> = serde_json::from_str(json)?;
        Ok(Self::new(script))
    }

    /// How many times the engine asked for a proposal.
    pub fn consultations(&self) -> usize {
        self.consulted.load(Ordering::SeqCst)
    }

    pub async fn remaining(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait]
impl RepairAdvisor for ScriptedAdvisor {
    async fn classify(&self, context: &FailureContext) -> Result<RepairProposal, AdvisorError> {
        self.consulted.fetch_add(1, Ordering::SeqCst);
        let next = self.queue.lock().await.pop_front();
        match next {
            None | Some(ScriptedRepair::Nothing) => Ok(RepairProposal::NoRepairAvailable),
            Some(ScriptedRepair::Dependency { command }) => {
                Ok(RepairProposal::AcquireDependency { command })
            }
            Some(ScriptedRepair::Replace { path, old, new }) => {
                let snapshot = context.snapshot(&path).ok_or_else(|| {
                    AdvisorError(format!("no snapshot of {path} for step {}", context.step_id))
                })?;
                Ok(RepairProposal::Edit(RepairAttempt {
                    target: snapshot.path.clone(),
                    old,
                    new,
                    snapshot_digest: snapshot.digest.clone(),
                }))
            }
        }
    }
}

/// Why a proposal was not applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepairRejection {
    #[error("stale repair for {path}: computed against {expected}, file is now {actual}")]
    Stale {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("no progress: identical request was already rejected")]
    NoProgress,

    #[error("repair edit failed: {0}")]
    Failed(ToolInvocationError),

    #[error("repair would reopen completed step '{0}'")]
    ReopensCompletedStep(String),
}

impl From<ToolInvocationError> for RepairRejection {
    fn from(err: ToolInvocationError) -> Self {
        match err {
            ToolInvocationError::StaleSnapshot {
                path,
                expected,
                actual,
            } => RepairRejection::Stale {
                path,
                expected,
                actual,
            },
            other => RepairRejection::Failed(other),
        }
    }
}

/// A step spent its retry budget for one failure bucket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("repair exhausted for step '{step_id}' after {attempts} {bucket} attempt(s): {last_diagnostic}")]
pub struct RepairExhausted {
    pub step_id: String,
    pub bucket: FailureBucket,
    pub attempts: u32,
    pub last_diagnostic: String,
}

/// Remembers rejected requests for one step so identical retries are refused
/// without being dispatched again.
#[derive(Debug, Clone, Default)]
pub struct NoProgressGuard {
    rejected: HashSet<ContentDigest>,
}

impl NoProgressGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rejected(&mut self, request: &ToolRequest) {
        self.rejected.insert(request.fingerprint());
    }

    pub fn check(&self, request: &ToolRequest) -> Result<(), RepairRejection> {
        if self.rejected.contains(&request.fingerprint()) {
            return Err(RepairRejection::NoProgress);
        }
        Ok(())
    }
}
