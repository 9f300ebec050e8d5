use buildloop_core::{EngineError, Plan, PlanError, StepKind};
use tempfile::tempdir;

const PLAN: &str = r##"{
    "name": "web-app",
    "dependencies": {"requests": "pip install requests"},
    "phases": [
        {"name": "scaffold", "steps": [
            {"id": "init", "kind": "file-create", "path": "./src//app.py", "content": "x = 1\n"},
            {"id": "readme", "kind": "file-create", "path": "README.md", "content": "# app\n"}
        ]},
        {"name": "build", "steps": [
            {"id": "patch", "kind": "text-replace", "path": "src/app.py", "old": "x = 1", "new": "x = 2"},
            {"id": "install", "kind": "command", "command": "true", "timeout_secs": 30},
            {"id": "check", "kind": "verify", "inspects": ["src/app.py"], "expect": {"contains": "x = 2"}}
        ]}
    ]
}"##;

#[test]
fn plan_document_loads_with_normalised_paths() {
    let plan = Plan::from_json_str(PLAN).unwrap();

    assert_eq!(plan.name, "web-app");
    assert_eq!(plan.phases.len(), 2);
    assert_eq!(plan.step_count(), 5);
    assert_eq!(plan.step("init").unwrap().action.file_path(), Some("src/app.py"));
    assert_eq!(plan.step("install").unwrap().kind(), StepKind::Command);
    assert_eq!(plan.acquisition_for("requests"), Some("pip install requests"));
}

#[test]
fn verify_step_covers_every_producer_of_inspected_path() {
    let plan = Plan::from_json_str(PLAN).unwrap();
    let check = plan.step("check").unwrap();

    assert_eq!(check.covers, vec!["init".to_string(), "patch".to_string()]);
    // Only same-phase producers gate scheduling.
    assert_eq!(check.waits_for, vec!["patch".to_string()]);
    assert_eq!(plan.inspected_files(check), vec!["src/app.py".to_string()]);
}

#[test]
fn fingerprints_change_only_with_definition() {
    let a = Plan::from_json_str(PLAN).unwrap();
    let b = Plan::from_json_str(PLAN).unwrap();
    let c = Plan::from_json_str(&PLAN.replace(r#""contains": "x = 2""#, r#""contains": "x = 3""#)).unwrap();

    assert_eq!(a.step("init").unwrap().fingerprint, b.step("init").unwrap().fingerprint);
    assert_eq!(a.step("patch").unwrap().fingerprint, c.step("patch").unwrap().fingerprint);
    assert_ne!(a.step("check").unwrap().fingerprint, c.step("check").unwrap().fingerprint);
}

#[test]
fn duplicate_step_ids_are_rejected() {
    let doc = r#"{"name": "dup", "phases": [
        {"name": "a", "steps": [{"id": "s", "kind": "command", "command": "true"}]},
        {"name": "b", "steps": [{"id": "s", "kind": "command", "command": "true"}]}
    ]}"#;
    let err = Plan::from_json_str(doc).unwrap_err();
    assert_eq!(err, PlanError::DuplicateStep("s".to_string()));
}

#[test]
fn empty_plan_and_empty_targets_are_rejected() {
    assert_eq!(
        Plan::from_json_str(r#"{"name": "none", "phases": []}"#).unwrap_err(),
        PlanError::Empty
    );

    let doc = r#"{"name": "blank", "phases": [
        {"name": "a", "steps": [{"id": "s", "kind": "append", "path": "  ", "content": "x"}]}
    ]}"#;
    assert!(matches!(
        Plan::from_json_str(doc).unwrap_err(),
        PlanError::EmptyTarget { .. }
    ));
}

#[test]
fn dependencies_must_point_backwards() {
    let doc = r#"{"name": "fwd", "phases": [
        {"name": "a", "steps": [
            {"id": "first", "kind": "command", "command": "true", "depends_on": ["second"]},
            {"id": "second", "kind": "command", "command": "true"}
        ]}
    ]}"#;
    assert!(matches!(
        Plan::from_json_str(doc).unwrap_err(),
        PlanError::ForwardDependency { .. }
    ));

    let doc = r#"{"name": "unknown", "phases": [
        {"name": "a", "steps": [
            {"id": "only", "kind": "command", "command": "true", "depends_on": ["ghost"]}
        ]}
    ]}"#;
    assert!(matches!(
        Plan::from_json_str(doc).unwrap_err(),
        PlanError::UnknownDependency { .. }
    ));
}

#[test]
fn unparseable_plan_file_surfaces_as_malformed_plan() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("plan.json");
    std::fs::write(&path, "{not json").unwrap();

    let err = Plan::from_path(&path).unwrap_err();
    assert!(matches!(err, EngineError::MalformedPlan(PlanError::Parse(_))));
}
