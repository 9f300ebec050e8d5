//! Plan, phase and step types.
//!
//! [`StepSpec`] is the wire shape a planning front-end produces; [`Step`] is
//! the validated form with scheduling edges resolved by [`Plan::load`].
//!
//! [`Plan::load`]: super::Plan::load

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;

/// The five step kinds a plan may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    FileCreate,
    TextReplace,
    Append,
    Command,
    Verify,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::FileCreate => "file-create",
            StepKind::TextReplace => "text-replace",
            StepKind::Append => "append",
            StepKind::Command => "command",
            StepKind::Verify => "verify",
        }
    }

    /// Whether steps of this kind mutate a file in the workspace.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            StepKind::FileCreate | StepKind::TextReplace | StepKind::Append
        )
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a `verify` step expects from the artifact it inspects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    /// Expected exit code of the verify command (0 when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Substring that must appear in the command output or inspected file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
}

impl ExpectedOutcome {
    /// Compare a finished command against the expectation.
    pub fn check_command(&self, exit_code: i32, output: &str) -> Result<(), String> {
        let expected = self.exit_code.unwrap_or(0);
        if exit_code != expected {
            return Err(format!("expected exit code {expected}, got {exit_code}"));
        }
        self.check_content(output)
    }

    /// Compare file or output content against the substring expectation.
    pub fn check_content(&self, content: &str) -> Result<(), String> {
        match &self.contains {
            Some(needle) if !content.contains(needle.as_str()) => {
                Err(format!("expected output to contain {needle:?}"))
            }
            _ => Ok(()),
        }
    }
}

/// The action a step performs, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepAction {
    FileCreate {
        path: String,
        content: String,
        #[serde(default)]
        overwrite: bool,
    },
    TextReplace {
        path: String,
        old: String,
        new: String,
    },
    Append {
        path: String,
        content: String,
    },
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workdir: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    Verify {
        inspects: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workdir: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default)]
        expect: ExpectedOutcome,
    },
}

impl StepAction {
    pub fn kind(&self) -> StepKind {
        match self {
            StepAction::FileCreate { .. } => StepKind::FileCreate,
            StepAction::TextReplace { .. } => StepKind::TextReplace,
            StepAction::Append { .. } => StepKind::Append,
            StepAction::Command { .. } => StepKind::Command,
            StepAction::Verify { .. } => StepKind::Verify,
        }
    }

    /// File path for mutations, command line for commands and checks.
    pub fn target(&self) -> String {
        match self {
            StepAction::FileCreate { path, .. }
            | StepAction::TextReplace { path, .. }
            | StepAction::Append { path, .. } => path.clone(),
            StepAction::Command { command, .. } => command.clone(),
            StepAction::Verify {
                command: Some(command),
                ..
            } => command.clone(),
            StepAction::Verify { inspects, .. } => inspects.join(", "),
        }
    }

    /// The file this step mutates, if any.
    pub fn file_path(&self) -> Option<&str> {
        match self {
            StepAction::FileCreate { path, .. }
            | StepAction::TextReplace { path, .. }
            | StepAction::Append { path, .. } => Some(path.as_str()),
            _ => None,
        }
    }
}

/// One step as declared in a plan document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// One phase as declared in a plan document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// A plan document as produced by the planning front-end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSpec {
    #[serde(default)]
    pub name: String,
    /// Dependency acquisition commands keyed by the name they provide.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub phases: Vec<PhaseSpec>,
}

/// A validated step with its scheduling edges resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: String,
    /// Index of the owning phase.
    pub phase: usize,
    pub action: StepAction,
    pub depends_on: Vec<String>,
    /// Same-phase steps that must be terminal before this step may start.
    pub waits_for: Vec<String>,
    /// Prior steps whose targets a `verify` step inspects.
    pub covers: Vec<String>,
    /// Digest of the step definition, used for checkpoint matching.
    pub fingerprint: ContentDigest,
}

impl Step {
    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }

    pub fn target(&self) -> String {
        self.action.target()
    }
}

/// A named group of steps; all reach a terminal state before the next phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub name: String,
    pub index: usize,
    pub steps: Vec<Step>,
}

impl Phase {
    /// Steps that can start as soon as the phase begins.
    pub fn independent_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.waits_for.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_spec_parses_each_kind() {
        let json = r#"[
            {"id": "a", "kind": "file-create", "path": "a.txt", "content": "x=1"},
            {"id": "b", "kind": "text-replace", "path": "a.txt", "old": "x=1", "new": "x=2"},
            {"id": "c", "kind": "append", "path": "a.txt", "content": "y"},
            {"id": "d", "kind": "command", "command": "make", "depends_on": ["a"]},
            {"id": "e", "kind": "verify", "inspects": ["a.txt"], "expect": {"contains": "x=2"}}
        ]"#;
        let steps: Vec<StepSpec> = serde_json::from_str(json).unwrap();
        let kinds: Vec<StepKind> = steps.iter().map(|s| s.action.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::FileCreate,
                StepKind::TextReplace,
                StepKind::Append,
                StepKind::Command,
                StepKind::Verify,
            ]
        );
        assert_eq!(steps[3].depends_on, vec!["a".to_string()]);
        assert!(matches!(
            &steps[0].action,
            StepAction::FileCreate { overwrite: false, .. }
        ));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let json = r#"{"id": "x", "kind": "delete", "path": "a"}"#;
        assert!(serde_json::from_str::<StepSpec>(json).is_err());
    }

    #[test]
    fn test_expected_outcome_defaults_to_exit_zero() {
        let expect = ExpectedOutcome::default();
        assert!(expect.check_command(0, "").is_ok());
        let err = expect.check_command(1, "").unwrap_err();
        assert!(err.contains("expected exit code 0, got 1"));
    }

    #[test]
    fn test_expected_outcome_substring() {
        let expect = ExpectedOutcome {
            exit_code: None,
            contains: Some("ok".to_string()),
        };
        assert!(expect.check_command(0, "all ok\n").is_ok());
        assert!(expect.check_command(0, "nope").is_err());
        assert!(expect.check_content("ok").is_ok());
    }

    #[test]
    fn test_target_per_kind() {
        let verify = StepAction::Verify {
            inspects: vec!["a.txt".into(), "b.txt".into()],
            command: None,
            workdir: None,
            timeout_secs: None,
            expect: ExpectedOutcome::default(),
        };
        assert_eq!(verify.target(), "a.txt, b.txt");
        assert!(verify.file_path().is_none());
        assert!(StepKind::Append.is_mutation());
        assert!(!StepKind::Verify.is_mutation());
    }
}
