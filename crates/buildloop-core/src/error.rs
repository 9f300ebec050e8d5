//! Engine-level error taxonomy.
//!
//! Step failures (tool rejections, command failures, verification mismatches)
//! are never surfaced here: they flow through the classifier and end up in the
//! audit trail. Only conditions that stop the engine before or outside a step
//! are modelled as [`EngineError`].

use crate::plan::PlanError;

/// Errors that escape to the caller of the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed plan: {0}")]
    MalformedPlan(#[from] PlanError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid workspace: {0}")]
    InvalidWorkspace(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_plan_display() {
        let err = EngineError::from(PlanError::DuplicateStep("a".to_string()));
        let msg = err.to_string();
        assert!(msg.contains("malformed plan"));
        assert!(msg.contains("duplicate step id: a"));
    }

    #[test]
    fn test_digest_mismatch_error() {
        let err = EngineError::DigestMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("def456"));
    }
}
