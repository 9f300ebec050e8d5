//! Tool invocation layer: the fixed set of file and process primitives.
//!
//! Every request is a tagged [`ToolRequest`] validated at the boundary before
//! dispatch. File mutations are atomic per file; `execute` always yields a
//! [`ProcessOutput`] unless the process cannot be launched, times out or is
//! cancelled.

mod exec;
mod fs;
mod invoker;
mod locks;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;

pub use exec::{run_command, ExecLimits};
pub use fs::{count_occurrences, render_diff, Workspace};
pub use invoker::ToolInvoker;
pub use locks::PathLocks;

/// 1-indexed inclusive line range for `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineWindow {
    pub start: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
}

/// One call into the tool layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ToolRequest {
    Create {
        path: String,
        content: String,
        #[serde(default)]
        overwrite: bool,
    },
    Replace {
        path: String,
        old: String,
        new: String,
    },
    Append {
        path: String,
        content: String,
    },
    Read {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lines: Option<LineWindow>,
    },
    Execute {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workdir: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
}

impl ToolRequest {
    pub fn op_name(&self) -> &'static str {
        match self {
            ToolRequest::Create { .. } => "create",
            ToolRequest::Replace { .. } => "replace",
            ToolRequest::Append { .. } => "append",
            ToolRequest::Read { .. } => "read",
            ToolRequest::Execute { .. } => "execute",
        }
    }

    /// Target file of a file operation.
    pub fn path(&self) -> Option<&str> {
        match self {
            ToolRequest::Create { path, .. }
            | ToolRequest::Replace { path, .. }
            | ToolRequest::Append { path, .. }
            | ToolRequest::Read { path, .. } => Some(path.as_str()),
            ToolRequest::Execute { .. } => None,
        }
    }

    /// Reject requests that can never succeed regardless of workspace state.
    pub fn validate(&self) -> Result<(), ToolInvocationError> {
        let invalid = |msg: &str| Err(ToolInvocationError::InvalidRequest(msg.to_string()));
        if let Some(path) = self.path() {
            if path.trim().is_empty() {
                return invalid("path must not be empty");
            }
        }
        match self {
            ToolRequest::Replace { old, .. } if old.is_empty() => {
                invalid("replace needs a non-empty old fragment")
            }
            ToolRequest::Read {
                lines: Some(window),
                ..
            } => {
                if window.start == 0 {
                    return invalid("line windows are 1-indexed");
                }
                match window.end {
                    Some(end) if end < window.start => invalid("line window ends before it starts"),
                    _ => Ok(()),
                }
            }
            ToolRequest::Execute {
                command,
                timeout_secs,
                ..
            } => {
                if command.trim().is_empty() {
                    return invalid("command must not be empty");
                }
                if *timeout_secs == Some(0) {
                    return invalid("timeout must be at least one second");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Stable digest of the request, used by the no-progress guard.
    pub fn fingerprint(&self) -> ContentDigest {
        ContentDigest::of_json(self)
            .unwrap_or_else(|_| ContentDigest::from_bytes(format!("{self:?}").as_bytes()))
    }
}

/// Captured result of one subprocess run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Bytes dropped from stdout beyond the capture limit.
    #[serde(default)]
    pub stdout_truncated: usize,
    #[serde(default)]
    pub stderr_truncated: usize,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Successful tool response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutput {
    Mutated {
        path: String,
        bytes: usize,
        diff: String,
    },
    Content {
        path: String,
        content: String,
        total_lines: usize,
    },
    Process(ProcessOutput),
}

/// Current content of a file together with its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub path: String,
    pub content: String,
    pub digest: ContentDigest,
}

impl FileSnapshot {
    pub fn new(path: impl Into<String>, content: String) -> Self {
        let digest = ContentDigest::from_bytes(content.as_bytes());
        Self {
            path: path.into(),
            content,
            digest,
        }
    }

    /// Snapshot of raw file bytes. The digest covers the bytes as stored;
    /// `content` is a lossy text view for display.
    pub fn from_bytes(path: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            path: path.into(),
            content: String::from_utf8_lossy(bytes).into_owned(),
            digest: ContentDigest::from_bytes(bytes),
        }
    }
}

/// Rejections and failures raised by the tool layer itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolInvocationError {
    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    #[error("not found: {path} ({detail})")]
    NotFound { path: String, detail: String },

    #[error("ambiguous: fragment occurs {occurrences} times in {path} (lines {lines:?})")]
    Ambiguous {
        path: String,
        occurrences: usize,
        lines: Vec<usize>,
    },

    #[error("Timeout after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("path escapes the workspace: {path}")]
    OutsideWorkspace { path: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("stale snapshot for {path}: expected {expected}, found {actual}")]
    StaleSnapshot {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("failed to launch process: {0}")]
    Launch(String),

    #[error("io error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req: ToolRequest = serde_json::from_str(
            r#"{"op": "replace", "path": "a.txt", "old": "x=1", "new": "x=2"}"#,
        )
        .unwrap();
        assert_eq!(req.op_name(), "replace");
        assert_eq!(req.path(), Some("a.txt"));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_degenerate_requests() {
        let cases = [
            ToolRequest::Replace {
                path: "a".into(),
                old: String::new(),
                new: "x".into(),
            },
            ToolRequest::Create {
                path: " ".into(),
                content: String::new(),
                overwrite: false,
            },
            ToolRequest::Read {
                path: "a".into(),
                lines: Some(LineWindow {
                    start: 3,
                    end: Some(2),
                }),
            },
            ToolRequest::Execute {
                command: "ls".into(),
                workdir: None,
                timeout_secs: Some(0),
                env: BTreeMap::new(),
            },
        ];
        for req in cases {
            assert!(
                matches!(req.validate(), Err(ToolInvocationError::InvalidRequest(_))),
                "{req:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_fingerprint_distinguishes_arguments() {
        let a = ToolRequest::Append {
            path: "a".into(),
            content: "1".into(),
        };
        let b = ToolRequest::Append {
            path: "a".into(),
            content: "2".into(),
        };
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_process_output_combined() {
        let out = ProcessOutput {
            stdout: "out".into(),
            stderr: "err".into(),
            ..Default::default()
        };
        assert_eq!(out.combined(), "out\nerr");
        assert!(out.success());
    }
}
