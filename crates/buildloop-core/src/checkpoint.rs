//! Run checkpoints: which steps already succeeded, keyed by definition digest.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;
use crate::error::Result;
use crate::plan::Step;
use crate::state::StepState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub state: StepState,
    pub fingerprint: ContentDigest,
}

/// Terminal step states carried between runs of the same plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    #[serde(default)]
    pub steps: BTreeMap<String, CheckpointEntry>,
}

impl RunCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a checkpoint, or an empty one if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Whether `step` already succeeded with an identical definition.
    pub fn is_succeeded(&self, step: &Step) -> bool {
        self.steps
            .get(&step.id)
            .is_some_and(|e| e.state == StepState::Succeeded && e.fingerprint == step.fingerprint)
    }

    pub fn record(&mut self, step: &Step, state: StepState) {
        self.steps.insert(
            step.id.clone(),
            CheckpointEntry {
                state,
                fingerprint: step.fingerprint.clone(),
            },
        );
    }

    pub fn succeeded_count(&self) -> usize {
        self.steps
            .values()
            .filter(|e| e.state == StepState::Succeeded)
            .count()
    }
}
