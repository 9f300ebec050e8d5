use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use super::model::{Phase, PlanSpec, Step, StepAction, StepSpec};
use super::PlanError;
use crate::digest::ContentDigest;

/// An immutable, validated plan. Shared read-only by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub name: String,
    pub phases: Vec<Phase>,
    /// Dependency acquisition commands keyed by the name they provide.
    pub dependencies: BTreeMap<String, String>,
    index: HashMap<String, (usize, usize)>,
}

/// Lexically tidy a workspace-relative path: trim whitespace, drop leading
/// `./` segments and unify separators.
pub fn normalize_path(raw: &str) -> String {
    let mut path = raw.trim().replace('\\', "/");
    while let Some(rest) = path.strip_prefix("./") {
        path = rest.to_string();
    }
    while path.contains("//") {
        path = path.replace("//", "/");
    }
    path
}

impl Plan {
    /// Validate a plan document and resolve its scheduling edges.
    pub fn load(spec: PlanSpec) -> Result<Self, PlanError> {
        if spec.phases.iter().all(|p| p.steps.is_empty()) {
            return Err(PlanError::Empty);
        }

        let mut phase_names = HashSet::new();
        let mut declared_at: HashMap<String, usize> = HashMap::new();
        let mut position = 0usize;
        for (index, phase) in spec.phases.iter().enumerate() {
            let name = phase.name.trim();
            if name.is_empty() {
                return Err(PlanError::EmptyPhaseName { index });
            }
            if !phase_names.insert(name.to_string()) {
                return Err(PlanError::DuplicatePhase(name.to_string()));
            }
            for (pos, step) in phase.steps.iter().enumerate() {
                let id = step.id.trim();
                if id.is_empty() {
                    return Err(PlanError::EmptyStepId {
                        phase: name.to_string(),
                        position: pos,
                    });
                }
                if declared_at.insert(id.to_string(), position).is_some() {
                    return Err(PlanError::DuplicateStep(id.to_string()));
                }
                position += 1;
            }
        }

        // Targets produced by steps seen so far, keyed by normalised target.
        let mut producers: HashMap<String, Vec<(String, usize)>> = HashMap::new();
        let mut phases = Vec::with_capacity(spec.phases.len());
        let mut index = HashMap::new();
        let mut position = 0usize;

        for (phase_index, raw_phase) in spec.phases.into_iter().enumerate() {
            let mut last_writer: HashMap<String, String> = HashMap::new();
            let mut steps: Vec<Step> = Vec::with_capacity(raw_phase.steps.len());

            for raw in raw_phase.steps {
                let StepSpec {
                    id,
                    action,
                    depends_on,
                } = raw;
                let id = id.trim().to_string();
                let action = normalize_action(&id, action)?;
                let depends_on: Vec<String> =
                    depends_on.iter().map(|d| d.trim().to_string()).collect();

                for dep in &depends_on {
                    match declared_at.get(dep) {
                        None => {
                            return Err(PlanError::UnknownDependency {
                                step: id.clone(),
                                dependency: dep.clone(),
                            })
                        }
                        Some(at) if *at >= position => {
                            return Err(PlanError::ForwardDependency {
                                step: id.clone(),
                                dependency: dep.clone(),
                            })
                        }
                        Some(_) => {}
                    }
                }

                let same_phase = |other: &str| steps.iter().any(|s| s.id == other);
                let mut waits_for: Vec<String> = depends_on
                    .iter()
                    .filter(|d| same_phase(d.as_str()))
                    .cloned()
                    .collect();

                if let Some(path) = action.file_path() {
                    if let Some(prev) = last_writer.get(path) {
                        waits_for.push(prev.clone());
                    }
                }

                let mut covers = Vec::new();
                if let StepAction::Verify { inspects, .. } = &action {
                    for target in inspects {
                        let found = producers
                            .get(&normalize_path(target))
                            .or_else(|| producers.get(target.trim()));
                        let Some(found) = found else {
                            return Err(PlanError::UnknownInspection {
                                step: id.clone(),
                                target: target.clone(),
                            });
                        };
                        for (producer, producer_phase) in found {
                            covers.push(producer.clone());
                            if *producer_phase == phase_index {
                                waits_for.push(producer.clone());
                            }
                        }
                    }
                }
                dedup_in_order(&mut waits_for);
                dedup_in_order(&mut covers);

                let fingerprint = ContentDigest::of_json(&(&id, &action, &depends_on))
                    .map_err(|e| PlanError::Parse(e.to_string()))?;

                if let Some(path) = action.file_path() {
                    last_writer.insert(path.to_string(), id.clone());
                }
                if !matches!(action, StepAction::Verify { .. }) {
                    let key = match action.file_path() {
                        Some(path) => path.to_string(),
                        None => action.target().trim().to_string(),
                    };
                    producers
                        .entry(key)
                        .or_default()
                        .push((id.clone(), phase_index));
                }

                index.insert(id.clone(), (phase_index, steps.len()));
                steps.push(Step {
                    id,
                    phase: phase_index,
                    action,
                    depends_on,
                    waits_for,
                    covers,
                    fingerprint,
                });
                position += 1;
            }

            phases.push(Phase {
                name: raw_phase.name.trim().to_string(),
                index: phase_index,
                steps,
            });
        }

        Ok(Self {
            name: spec.name,
            phases,
            dependencies: spec.dependencies,
            index,
        })
    }

    /// Parse and validate a JSON plan document.
    pub fn from_json_str(json: &str) -> Result<Self, PlanError> {
        let spec: PlanSpec =
            serde_json::from_str(json).map_err(|e| PlanError::Parse(e.to_string()))?;
        Self::load(spec)
    }

    /// Read, parse and validate a JSON plan document from disk.
    pub fn from_path(path: &Path) -> crate::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::from_json_str(&json)?)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        let (phase, pos) = self.index.get(id)?;
        self.phases.get(*phase)?.steps.get(*pos)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.phases.iter().flat_map(|p| p.steps.iter())
    }

    pub fn step_count(&self) -> usize {
        self.index.len()
    }

    /// Declared acquisition command for an external name, if any.
    pub fn acquisition_for(&self, name: &str) -> Option<&str> {
        self.dependencies.get(name).map(String::as_str)
    }

    /// Files a `verify` step inspects, resolved through the steps it covers.
    pub fn inspected_files(&self, step: &Step) -> Vec<String> {
        let mut files: Vec<String> = step
            .covers
            .iter()
            .filter_map(|id| self.step(id))
            .filter_map(|s| s.action.file_path().map(str::to_string))
            .collect();
        dedup_in_order(&mut files);
        files
    }
}

fn normalize_action(id: &str, action: StepAction) -> Result<StepAction, PlanError> {
    let empty_target = || PlanError::EmptyTarget {
        step: id.to_string(),
    };
    let action = match action {
        StepAction::FileCreate {
            path,
            content,
            overwrite,
        } => StepAction::FileCreate {
            path: normalize_path(&path),
            content,
            overwrite,
        },
        StepAction::TextReplace { path, old, new } => {
            if old.is_empty() {
                return Err(PlanError::EmptyFragment {
                    step: id.to_string(),
                });
            }
            StepAction::TextReplace {
                path: normalize_path(&path),
                old,
                new,
            }
        }
        StepAction::Append { path, content } => StepAction::Append {
            path: normalize_path(&path),
            content,
        },
        StepAction::Command {
            command,
            workdir,
            timeout_secs,
            env,
        } => StepAction::Command {
            command: command.trim().to_string(),
            workdir: workdir.map(|w| normalize_path(&w)),
            timeout_secs,
            env,
        },
        StepAction::Verify {
            inspects,
            command,
            workdir,
            timeout_secs,
            expect,
        } => {
            if inspects.iter().all(|t| t.trim().is_empty()) {
                return Err(PlanError::EmptyInspection {
                    step: id.to_string(),
                });
            }
            let command = match command {
                Some(c) if c.trim().is_empty() => return Err(empty_target()),
                other => other.map(|c| c.trim().to_string()),
            };
            StepAction::Verify {
                inspects: inspects
                    .into_iter()
                    .filter(|t| !t.trim().is_empty())
                    .collect(),
                command,
                workdir: workdir.map(|w| normalize_path(&w)),
                timeout_secs,
                expect,
            }
        }
    };
    if action.target().is_empty() {
        return Err(empty_target());
    }
    Ok(action)
}

fn dedup_in_order(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(json: &str) -> Result<Plan, PlanError> {
        Plan::from_json_str(json)
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(" ./src//main.py "), "src/main.py");
        assert_eq!(normalize_path("././a"), "a");
        assert_eq!(normalize_path("dir\\file"), "dir/file");
    }

    #[test]
    fn test_load_resolves_same_path_and_verify_edges() {
        let p = plan(
            r#"{"name": "demo", "phases": [{"name": "one", "steps": [
                {"id": "a", "kind": "file-create", "path": "./a.txt", "content": "x=1"},
                {"id": "b", "kind": "append", "path": "a.txt", "content": "y"},
                {"id": "c", "kind": "command", "command": "true"},
                {"id": "v", "kind": "verify", "inspects": ["a.txt"]}
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(p.step_count(), 4);
        assert!(p.step("a").unwrap().waits_for.is_empty());
        assert_eq!(p.step("b").unwrap().waits_for, vec!["a".to_string()]);
        assert!(p.step("c").unwrap().waits_for.is_empty());
        let v = p.step("v").unwrap();
        assert_eq!(v.covers, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(v.waits_for, v.covers);
        assert_eq!(p.inspected_files(v), vec!["a.txt".to_string()]);
        assert_eq!(p.phases[0].independent_steps(), 2);
    }

    #[test]
    fn test_verify_of_earlier_phase_does_not_wait() {
        let p = plan(
            r#"{"phases": [
                {"name": "build", "steps": [{"id": "a", "kind": "command", "command": "make"}]},
                {"name": "check", "steps": [{"id": "v", "kind": "verify", "inspects": ["make"]}]}
            ]}"#,
        )
        .unwrap();
        let v = p.step("v").unwrap();
        assert_eq!(v.covers, vec!["a".to_string()]);
        assert!(v.waits_for.is_empty());
        assert!(p.inspected_files(v).is_empty());
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let err = plan(
            r#"{"phases": [
                {"name": "a", "steps": [{"id": "s", "kind": "command", "command": "x"}]},
                {"name": "b", "steps": [{"id": "s", "kind": "command", "command": "y"}]}
            ]}"#,
        )
        .unwrap_err();
        assert_eq!(err, PlanError::DuplicateStep("s".to_string()));
    }

    #[test]
    fn test_forward_and_unknown_dependencies_rejected() {
        let err = plan(
            r#"{"phases": [{"name": "a", "steps": [
                {"id": "s1", "kind": "command", "command": "x", "depends_on": ["s2"]},
                {"id": "s2", "kind": "command", "command": "y"}
            ]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::ForwardDependency { .. }));

        let err = plan(
            r#"{"phases": [{"name": "a", "steps": [
                {"id": "s1", "kind": "command", "command": "x", "depends_on": ["ghost"]}
            ]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));
    }

    #[test]
    fn test_verify_must_reference_prior_target() {
        let err = plan(
            r#"{"phases": [{"name": "a", "steps": [
                {"id": "v", "kind": "verify", "inspects": ["later.txt"]},
                {"id": "c", "kind": "file-create", "path": "later.txt", "content": ""}
            ]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnknownInspection { .. }));
    }

    #[test]
    fn test_structural_rejections() {
        assert_eq!(plan(r#"{"phases": []}"#).unwrap_err(), PlanError::Empty);
        assert!(matches!(
            plan(r#"{"phases": [{"name": " ", "steps": [{"id": "a", "kind": "command", "command": "x"}]}]}"#)
                .unwrap_err(),
            PlanError::EmptyPhaseName { index: 0 }
        ));
        assert!(matches!(
            plan(r#"{"phases": [{"name": "p", "steps": [{"id": "a", "kind": "text-replace", "path": "f", "old": "", "new": "x"}]}]}"#)
                .unwrap_err(),
            PlanError::EmptyFragment { .. }
        ));
        assert!(matches!(
            plan(r#"{"phases": [{"name": "p", "steps": [{"id": "a", "kind": "command", "command": "  "}]}]}"#)
                .unwrap_err(),
            PlanError::EmptyTarget { .. }
        ));
        assert!(matches!(
            plan(r#"{"phases": [{"name": "p", "steps": [{"id": "a", "kind": "verify", "inspects": []}]}]}"#)
                .unwrap_err(),
            PlanError::EmptyInspection { .. }
        ));
        assert!(matches!(plan("not json").unwrap_err(), PlanError::Parse(_)));
    }

    #[test]
    fn test_fingerprint_tracks_definition() {
        let a = plan(r#"{"phases": [{"name": "p", "steps": [{"id": "a", "kind": "command", "command": "x"}]}]}"#)
            .unwrap();
        let b = plan(r#"{"phases": [{"name": "p", "steps": [{"id": "a", "kind": "command", "command": "y"}]}]}"#)
            .unwrap();
        assert_ne!(
            a.step("a").unwrap().fingerprint,
            b.step("a").unwrap().fingerprint
        );
    }
}
