//! Failure taxonomy and first-match classification into repair buckets.
//!
//! Buckets are tried in order: malformed input, missing dependency,
//! syntax/structural, assertion, environment/transient. The first match wins.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::plan::{normalize_path, StepKind};
use crate::tools::{FileSnapshot, ToolInvocationError};

/// Repair bucket a failure is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureBucket {
    MalformedInput,
    MissingDependency,
    Structural,
    Assertion,
    Transient,
}

impl FailureBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureBucket::MalformedInput => "malformed-input",
            FailureBucket::MissingDependency => "missing-dependency",
            FailureBucket::Structural => "structural",
            FailureBucket::Assertion => "assertion",
            FailureBucket::Transient => "transient",
        }
    }

    /// Transient failures are retried unchanged under their own budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureBucket::Transient)
    }
}

impl std::fmt::Display for FailureBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why one execution attempt of a step failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepFailure {
    #[error(transparent)]
    ToolInvocation(#[from] ToolInvocationError),

    #[error("command exited with code {exit_code}")]
    CommandFailure { exit_code: i32 },

    #[error("verification failed: {reason}")]
    VerificationFailure { reason: String },
}

/// A `path:line` reference pulled out of tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub path: String,
    pub line: usize,
}

const MISSING_DEPENDENCY: &[&str] = &[
    r"No module named '?([\w.\-]+)'?",
    r"ModuleNotFoundError",
    r"(?m)([\w.+\-]+): command not found",
    r"(?m)^(?:\S+: )?(?:\d+: )?([\w.+\-]+): not found$",
    r"(?i)cannot find module '([^']+)'",
    r"unresolved import `([^`]+)`",
    r#"(?i)could not find package "?([\w./\-]+)"?"#,
];

const STRUCTURAL: &[&str] = &[
    r#"File "([^"]+)", line (\d+)"#,
    r"(?m)([\w./\-]+\.\w+):(\d+)(?::\d+)?",
    r"SyntaxError",
    r"IndentationError",
    r"error\[E\d+\]",
];

const TRANSIENT: &[&str] = &[
    r"Timeout",
    r"(?i)resource temporarily unavailable",
    r"(?i)out of memory",
    r"(?i)too many open files",
    r"(?i)connection reset",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

fn missing_dependency_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| compile(MISSING_DEPENDENCY))
}

fn structural_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| compile(STRUCTURAL))
}

fn transient_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| compile(TRANSIENT))
}

fn any_match(patterns: &[Regex], output: &str) -> bool {
    patterns.iter().any(|re| re.is_match(output))
}

/// Classify a failed attempt. `output` is the captured stdout/stderr.
pub fn classify_failure(kind: StepKind, failure: &StepFailure, output: &str) -> FailureBucket {
    if let StepFailure::ToolInvocation(err) = failure {
        return match err {
            ToolInvocationError::AlreadyExists { .. }
            | ToolInvocationError::NotFound { .. }
            | ToolInvocationError::Ambiguous { .. }
            | ToolInvocationError::OutsideWorkspace { .. }
            | ToolInvocationError::InvalidRequest(_)
            | ToolInvocationError::StaleSnapshot { .. } => FailureBucket::MalformedInput,
            ToolInvocationError::Timeout { .. }
            | ToolInvocationError::Launch(_)
            | ToolInvocationError::Io { .. }
            | ToolInvocationError::Cancelled => FailureBucket::Transient,
        };
    }

    if any_match(missing_dependency_patterns(), output) {
        return FailureBucket::MissingDependency;
    }
    if any_match(structural_patterns(), output) {
        return FailureBucket::Structural;
    }
    if matches!(failure, StepFailure::VerificationFailure { .. }) {
        return FailureBucket::Assertion;
    }
    if any_match(transient_patterns(), output) {
        return FailureBucket::Transient;
    }
    if kind == StepKind::Verify {
        FailureBucket::Assertion
    } else {
        FailureBucket::Structural
    }
}

/// First `path:line` location mentioned in `output`.
pub fn extract_location(output: &str) -> Option<SourceLocation> {
    structural_patterns().iter().find_map(|re| {
        let caps = re.captures(output)?;
        let path = caps.get(1)?.as_str();
        let line = caps.get(2)?.as_str().parse().ok()?;
        Some(SourceLocation {
            path: normalize_path(path),
            line,
        })
    })
}

/// Name of the unresolved external dependency mentioned in `output`.
pub fn extract_missing_name(output: &str) -> Option<String> {
    missing_dependency_patterns().iter().find_map(|re| {
        re.captures(output)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// Everything the repair collaborator is shown about one failure.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub step_id: String,
    pub phase: String,
    pub kind: StepKind,
    pub target: String,
    pub attempt: u32,
    pub failure: StepFailure,
    pub output: String,
    pub bucket: FailureBucket,
    pub location: Option<SourceLocation>,
    pub missing_name: Option<String>,
    /// Current content of every file the failing step is tied to, by path.
    pub snapshots: BTreeMap<String, FileSnapshot>,
    /// Steps whose artifacts a repair may edit.
    pub repair_targets: Vec<String>,
}

impl FailureContext {
    pub fn snapshot(&self, path: &str) -> Option<&FileSnapshot> {
        self.snapshots.get(&normalize_path(path))
    }

    /// Short human-readable diagnostic for audit entries.
    pub fn diagnostic(&self) -> String {
        let mut msg = self.failure.to_string();
        if let Some(location) = &self.location {
            msg.push_str(&format!(" at {}:{}", location.path, location.line));
        }
        if let Some(name) = &self.missing_name {
            msg.push_str(&format!(" (missing '{name}')"));
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_failure() -> StepFailure {
        StepFailure::CommandFailure { exit_code: 1 }
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(missing_dependency_patterns().len(), MISSING_DEPENDENCY.len());
        assert_eq!(structural_patterns().len(), STRUCTURAL.len());
        assert_eq!(transient_patterns().len(), TRANSIENT.len());
    }

    #[test]
    fn test_tool_rejections_are_malformed_input() {
        let err = ToolInvocationError::Ambiguous {
            path: "a".into(),
            occurrences: 2,
            lines: vec![1, 2],
        };
        let bucket = classify_failure(StepKind::TextReplace, &err.into(), "");
        assert_eq!(bucket, FailureBucket::MalformedInput);
    }

    #[test]
    fn test_timeout_is_transient() {
        let failure = StepFailure::from(ToolInvocationError::Timeout { timeout_secs: 1 });
        assert_eq!(
            classify_failure(StepKind::Command, &failure, ""),
            FailureBucket::Transient
        );
        assert_eq!(
            classify_failure(StepKind::Command, &command_failure(), "Too many open files"),
            FailureBucket::Transient
        );
    }

    #[test]
    fn test_missing_dependency_wins_over_location() {
        let out = "Traceback:\n  File \"app.py\", line 1\nModuleNotFoundError: No module named 'requests'";
        assert_eq!(
            classify_failure(StepKind::Command, &command_failure(), out),
            FailureBucket::MissingDependency
        );
        assert_eq!(extract_missing_name(out).as_deref(), Some("requests"));

        let out = "sh: 1: frobnicate: not found";
        assert_eq!(extract_missing_name(out).as_deref(), Some("frobnicate"));
        let out = "bash: line 1: frob: command not found";
        assert_eq!(extract_missing_name(out).as_deref(), Some("frob"));
    }

    #[test]
    fn test_structural_location_extraction() {
        let out = "  File \"src/main.py\", line 12\n    def f(\nSyntaxError: invalid syntax";
        assert_eq!(
            classify_failure(StepKind::Command, &command_failure(), out),
            FailureBucket::Structural
        );
        assert_eq!(
            extract_location(out),
            Some(SourceLocation {
                path: "src/main.py".into(),
                line: 12
            })
        );
        assert_eq!(
            extract_location("./lib/util.rs:40:7: expected `;`"),
            Some(SourceLocation {
                path: "lib/util.rs".into(),
                line: 40
            })
        );
    }

    #[test]
    fn test_verify_mismatch_is_assertion() {
        let failure = StepFailure::VerificationFailure {
            reason: "expected exit code 0, got 1".into(),
        };
        assert_eq!(
            classify_failure(StepKind::Verify, &failure, "x is 1"),
            FailureBucket::Assertion
        );
    }

    #[test]
    fn test_unmatched_command_failure_defaults_to_structural() {
        assert_eq!(
            classify_failure(StepKind::Command, &command_failure(), "it broke"),
            FailureBucket::Structural
        );
    }
}
