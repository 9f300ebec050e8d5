use std::collections::BTreeMap;

use buildloop_core::tools::{ExecLimits, ToolInvoker};
use buildloop_core::{
    ContentDigest, EngineConfig, StopHandle, ToolInvocationError, ToolOutput, ToolRequest,
    Workspace,
};
use tempfile::tempdir;

fn replace(path: &str, old: &str, new: &str) -> ToolRequest {
    ToolRequest::Replace {
        path: path.into(),
        old: old.into(),
        new: new.into(),
    }
}

#[test]
fn replace_with_single_occurrence_rewrites_file() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.py"), "x = 1\ny = 2\n").unwrap();
    let ws = Workspace::new(dir.path()).unwrap();

    let out = ws.apply(&replace("a.py", "x = 1", "x = 3"), None).unwrap();
    match out {
        ToolOutput::Mutated { path, diff, .. } => {
            assert_eq!(path, "a.py");
            assert!(diff.contains("-x = 1"));
            assert!(diff.contains("+x = 3"));
        }
        other => panic!("unexpected output {other:?}"),
    }
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.py")).unwrap(),
        "x = 3\ny = 2\n"
    );
}

#[test]
fn replace_with_zero_occurrences_leaves_file_untouched() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
    let ws = Workspace::new(dir.path()).unwrap();

    let err = ws.apply(&replace("a.py", "z = 9", "z = 0"), None).unwrap_err();
    assert!(matches!(err, ToolInvocationError::NotFound { .. }));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.py")).unwrap(),
        "x = 1\n"
    );
}

#[test]
fn replace_with_whitespace_mismatch_reports_hint() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.py"), "    x = 1\n").unwrap();
    let ws = Workspace::new(dir.path()).unwrap();

    let err = ws
        .apply(&replace("a.py", "x = 1   \n  ", "x = 2"), None)
        .unwrap_err();
    match err {
        ToolInvocationError::NotFound { detail, .. } => {
            assert!(detail.contains("whitespace"), "{detail}")
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn replace_with_many_occurrences_is_ambiguous_and_untouched() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.py"), "x = 1\nx = 1\nok\nx = 1\n").unwrap();
    let ws = Workspace::new(dir.path()).unwrap();

    let err = ws.apply(&replace("a.py", "x = 1", "x = 2"), None).unwrap_err();
    match err {
        ToolInvocationError::Ambiguous {
            occurrences, lines, ..
        } => {
            assert_eq!(occurrences, 3);
            assert_eq!(lines, vec![1, 2, 4]);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.py")).unwrap(),
        "x = 1\nx = 1\nok\nx = 1\n"
    );
}

#[test]
fn replace_against_stale_digest_is_rejected() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
    let ws = Workspace::new(dir.path()).unwrap();
    let stale = ContentDigest::from_bytes(b"x = 0\n");

    let err = ws
        .apply(&replace("a.py", "x = 1", "x = 2"), Some(&stale))
        .unwrap_err();
    assert!(matches!(err, ToolInvocationError::StaleSnapshot { .. }));
}

#[test]
fn create_refuses_existing_file_without_overwrite() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path()).unwrap();
    let req = ToolRequest::Create {
        path: "new.txt".into(),
        content: "one".into(),
        overwrite: false,
    };

    ws.apply(&req, None).unwrap();
    let err = ws.apply(&req, None).unwrap_err();
    assert!(matches!(err, ToolInvocationError::AlreadyExists { .. }));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("new.txt")).unwrap(),
        "one"
    );
}

#[test]
fn paths_outside_workspace_are_refused() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path()).unwrap();
    let req = ToolRequest::Create {
        path: "../escape.txt".into(),
        content: "no".into(),
        overwrite: false,
    };

    let err = ws.apply(&req, None).unwrap_err();
    assert!(matches!(err, ToolInvocationError::OutsideWorkspace { .. }));
}

#[test]
fn read_returns_requested_line_window() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("f.txt"), "a\nb\nc\nd\n").unwrap();
    let ws = Workspace::new(dir.path()).unwrap();
    let req: ToolRequest =
        serde_json::from_str(r#"{"op":"read","path":"f.txt","lines":{"start":2,"end":3}}"#)
            .unwrap();

    match ws.apply(&req, None).unwrap() {
        ToolOutput::Content {
            content,
            total_lines,
            ..
        } => {
            assert_eq!(content, "b\nc");
            assert_eq!(total_lines, 4);
        }
        other => panic!("unexpected output {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn execute_captures_exit_code_and_streams() {
    let dir = tempdir().unwrap();
    let invoker = ToolInvoker::new(
        Workspace::new(dir.path()).unwrap(),
        ExecLimits::from_config(&EngineConfig::default()),
    );
    let req = ToolRequest::Execute {
        command: "echo out; echo err >&2; exit 3".into(),
        workdir: None,
        timeout_secs: None,
        env: BTreeMap::new(),
    };

    match invoker.invoke(&req, &StopHandle::new()).await.unwrap() {
        ToolOutput::Process(out) => {
            assert_eq!(out.exit_code, 3);
            assert_eq!(out.stdout.trim(), "out");
            assert_eq!(out.stderr.trim(), "err");
            assert!(!out.success());
        }
        other => panic!("unexpected output {other:?}"),
    }
}
