use std::path::PathBuf;

use tracing::debug;

use super::exec::{run_command, ExecLimits};
use super::fs::Workspace;
use super::locks::PathLocks;
use super::{FileSnapshot, ToolInvocationError, ToolOutput, ToolRequest};
use crate::cancel::StopHandle;
use crate::digest::ContentDigest;
use crate::repair::RepairAttempt;

/// Dispatches validated requests against one workspace.
///
/// File operations hold the per-path lock for exactly one call and run on the
/// blocking pool. `execute` is not path-locked.
#[derive(Debug, Clone)]
pub struct ToolInvoker {
    workspace: Workspace,
    locks: PathLocks,
    limits: ExecLimits,
}

impl ToolInvoker {
    pub fn new(workspace: Workspace, limits: ExecLimits) -> Self {
        Self {
            workspace,
            locks: PathLocks::new(),
            limits,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub async fn invoke(
        &self,
        request: &ToolRequest,
        stop: &StopHandle,
    ) -> Result<ToolOutput, ToolInvocationError> {
        request.validate()?;
        if stop.is_stopped() {
            return Err(ToolInvocationError::Cancelled);
        }
        debug!(op = request.op_name(), path = ?request.path(), "tool invoked");

        match request {
            ToolRequest::Execute {
                command,
                workdir,
                timeout_secs,
                env,
            } => {
                let dir = match workdir {
                    Some(dir) => self.workspace.resolve(dir)?,
                    None => self.workspace.root().to_path_buf(),
                };
                let limits = self.limits.with_timeout_secs(*timeout_secs);
                run_command(command, &dir, env, limits, stop)
                    .await
                    .map(ToolOutput::Process)
            }
            _ => self.locked_file_op(request.clone(), None).await,
        }
    }

    /// Apply a repair edit, rejecting it if the file changed since the
    /// snapshot it was computed from.
    pub async fn apply_repair(
        &self,
        repair: &RepairAttempt,
    ) -> Result<ToolOutput, ToolInvocationError> {
        let request = repair.to_request();
        request.validate()?;
        self.locked_file_op(request, Some(repair.snapshot_digest.clone()))
            .await
    }

    /// Read the current content of `path` under its lock.
    pub async fn snapshot(&self, path: &str) -> Result<Option<FileSnapshot>, ToolInvocationError> {
        let resolved = self.workspace.resolve(path)?;
        let _guard = self.locks.acquire(&resolved).await;
        let workspace = self.workspace.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || workspace.snapshot(&path))
            .await
            .map_err(|e| join_error(resolved, e))?
    }

    async fn locked_file_op(
        &self,
        request: ToolRequest,
        expected: Option<ContentDigest>,
    ) -> Result<ToolOutput, ToolInvocationError> {
        let raw = request.path().unwrap_or_default();
        let resolved = self.workspace.resolve(raw)?;
        let _guard = self.locks.acquire(&resolved).await;
        let workspace = self.workspace.clone();
        tokio::task::spawn_blocking(move || workspace.apply(&request, expected.as_ref()))
            .await
            .map_err(|e| join_error(resolved, e))?
    }
}

fn join_error(path: PathBuf, err: tokio::task::JoinError) -> ToolInvocationError {
    ToolInvocationError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn invoker() -> (tempfile::TempDir, ToolInvoker) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let limits = ExecLimits::from_config(&EngineConfig::default());
        (dir, ToolInvoker::new(ws, limits))
    }

    #[tokio::test]
    async fn test_invoke_file_ops() {
        let (_dir, inv) = invoker();
        let stop = StopHandle::new();
        inv.invoke(
            &ToolRequest::Create {
                path: "a.txt".into(),
                content: "x=1".into(),
                overwrite: false,
            },
            &stop,
        )
        .await
        .unwrap();
        let out = inv
            .invoke(
                &ToolRequest::Read {
                    path: "a.txt".into(),
                    lines: None,
                },
                &stop,
            )
            .await
            .unwrap();
        assert!(matches!(out, ToolOutput::Content { ref content, .. } if content == "x=1"));
    }

    #[tokio::test]
    async fn test_stopped_handle_cancels_before_dispatch() {
        let (_dir, inv) = invoker();
        let stop = StopHandle::new();
        stop.stop();
        let err = inv
            .invoke(
                &ToolRequest::Create {
                    path: "a.txt".into(),
                    content: String::new(),
                    overwrite: false,
                },
                &stop,
            )
            .await
            .unwrap_err();
        assert_eq!(err, ToolInvocationError::Cancelled);
        assert!(inv.snapshot("a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_repair_checks_snapshot() {
        let (_dir, inv) = invoker();
        inv.workspace().create("a.txt", "x=1", false).unwrap();
        let snap = inv.snapshot("a.txt").await.unwrap().unwrap();
        let repair = RepairAttempt {
            target: "a.txt".into(),
            old: "x=1".into(),
            new: "x=2".into(),
            snapshot_digest: snap.digest.clone(),
        };
        inv.workspace().append("a.txt", "y").unwrap();
        let err = inv.apply_repair(&repair).await.unwrap_err();
        assert!(matches!(err, ToolInvocationError::StaleSnapshot { .. }));
    }
}
