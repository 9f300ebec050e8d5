use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;

use super::{FileSnapshot, LineWindow, ToolInvocationError, ToolOutput, ToolRequest};
use crate::digest::ContentDigest;
use crate::error::{EngineError, Result};

const MAX_REPORTED_LINES: usize = 10;

/// A directory tree that all file operations are confined to.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open (creating if needed) the workspace rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        if !root.is_dir() {
            return Err(EngineError::InvalidWorkspace(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative path lexically, rejecting escapes.
    pub fn resolve(&self, raw: &str) -> std::result::Result<PathBuf, ToolInvocationError> {
        let outside = || ToolInvocationError::OutsideWorkspace {
            path: raw.to_string(),
        };
        let candidate = Path::new(raw.trim());
        let relative = if candidate.is_absolute() {
            candidate.strip_prefix(&self.root).map_err(|_| outside())?
        } else {
            candidate
        };

        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in relative.components() {
            match component {
                Component::CurDir => {}
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(outside());
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => return Err(outside()),
            }
        }
        Ok(resolved)
    }

    fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Apply a file request synchronously. `expected` guards against a file
    /// that changed since a snapshot was taken.
    pub fn apply(
        &self,
        request: &ToolRequest,
        expected: Option<&ContentDigest>,
    ) -> std::result::Result<ToolOutput, ToolInvocationError> {
        match request {
            ToolRequest::Create {
                path,
                content,
                overwrite,
            } => self.create(path, content, *overwrite),
            ToolRequest::Replace { path, old, new } => self.replace(path, old, new, expected),
            ToolRequest::Append { path, content } => self.append(path, content),
            ToolRequest::Read { path, lines } => self.read(path, *lines),
            ToolRequest::Execute { .. } => Err(ToolInvocationError::InvalidRequest(
                "execute is not a file operation".to_string(),
            )),
        }
    }

    pub fn create(
        &self,
        path: &str,
        content: &str,
        overwrite: bool,
    ) -> std::result::Result<ToolOutput, ToolInvocationError> {
        let target = self.resolve(path)?;
        let shown = self.display_path(&target);
        let previous = match fs::read(&target) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_error(&shown, e)),
        };
        if previous.is_some() && !overwrite {
            return Err(ToolInvocationError::AlreadyExists { path: shown });
        }
        write_atomic(&target, content.as_bytes()).map_err(|e| io_error(&shown, e))?;
        Ok(ToolOutput::Mutated {
            diff: render_diff(&shown, &lossy(previous.as_deref().unwrap_or_default()), content),
            bytes: content.len(),
            path: shown,
        })
    }

    pub fn replace(
        &self,
        path: &str,
        old: &str,
        new: &str,
        expected: Option<&ContentDigest>,
    ) -> std::result::Result<ToolOutput, ToolInvocationError> {
        let target = self.resolve(path)?;
        let shown = self.display_path(&target);
        let current = read_existing(&target, &shown)?;

        if let Some(expected) = expected {
            let actual = ContentDigest::from_bytes(&current);
            if &actual != expected {
                return Err(ToolInvocationError::StaleSnapshot {
                    path: shown,
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        let positions = occurrence_positions(&current, old.as_bytes());
        match positions.len() {
            0 => {
                let trimmed = old.trim();
                let detail = if trimmed != old
                    && !trimmed.is_empty()
                    && find_bytes(&current, trimmed.as_bytes()).is_some()
                {
                    "fragment not present; it matches only after trimming whitespace"
                } else {
                    "fragment not present"
                };
                Err(ToolInvocationError::NotFound {
                    path: shown,
                    detail: detail.to_string(),
                })
            }
            1 => {
                let at = positions[0];
                let mut updated = Vec::with_capacity(current.len() + new.len());
                updated.extend_from_slice(&current[..at]);
                updated.extend_from_slice(new.as_bytes());
                updated.extend_from_slice(&current[at + old.len()..]);
                write_atomic(&target, &updated).map_err(|e| io_error(&shown, e))?;
                Ok(ToolOutput::Mutated {
                    diff: render_diff(&shown, &lossy(&current), &lossy(&updated)),
                    bytes: updated.len(),
                    path: shown,
                })
            }
            occurrences => Err(ToolInvocationError::Ambiguous {
                lines: positions
                    .iter()
                    .take(MAX_REPORTED_LINES)
                    .map(|pos| line_of(&current, *pos))
                    .collect(),
                occurrences,
                path: shown,
            }),
        }
    }

    pub fn append(
        &self,
        path: &str,
        content: &str,
    ) -> std::result::Result<ToolOutput, ToolInvocationError> {
        let target = self.resolve(path)?;
        let shown = self.display_path(&target);
        let current = read_existing(&target, &shown)?;
        let mut updated = current.clone();
        if !updated.is_empty() && updated.last() != Some(&b'\n') && !content.is_empty() {
            updated.push(b'\n');
        }
        updated.extend_from_slice(content.as_bytes());
        write_atomic(&target, &updated).map_err(|e| io_error(&shown, e))?;
        Ok(ToolOutput::Mutated {
            diff: render_diff(&shown, &lossy(&current), &lossy(&updated)),
            bytes: updated.len(),
            path: shown,
        })
    }

    pub fn read(
        &self,
        path: &str,
        window: Option<LineWindow>,
    ) -> std::result::Result<ToolOutput, ToolInvocationError> {
        let target = self.resolve(path)?;
        let shown = self.display_path(&target);
        let content = lossy(&read_existing(&target, &shown)?);
        let total_lines = content.lines().count();
        let content = match window {
            None => content,
            Some(LineWindow { start, end }) => {
                let take = end.map_or(usize::MAX, |end| {
                    end.saturating_sub(start).saturating_add(1)
                });
                content
                    .lines()
                    .skip(start.saturating_sub(1))
                    .take(take)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };
        Ok(ToolOutput::Content {
            path: shown,
            content,
            total_lines,
        })
    }

    /// Current content of `path`, or `None` when it does not exist.
    pub fn snapshot(&self, path: &str) -> std::result::Result<Option<FileSnapshot>, ToolInvocationError> {
        let target = self.resolve(path)?;
        let shown = self.display_path(&target);
        match fs::read(&target) {
            Ok(bytes) => Ok(Some(FileSnapshot::from_bytes(shown, &bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&shown, e)),
        }
    }
}

fn read_existing(target: &Path, shown: &str) -> std::result::Result<Vec<u8>, ToolInvocationError> {
    match fs::read(target) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ToolInvocationError::NotFound {
            path: shown.to_string(),
            detail: "file does not exist".to_string(),
        }),
        Err(e) => Err(io_error(shown, e)),
    }
}

fn io_error(shown: &str, err: std::io::Error) -> ToolInvocationError {
    ToolInvocationError::Io {
        path: shown.to_string(),
        message: err.to_string(),
    }
}

/// Write via a temp file in the same directory, then rename over the target.
fn write_atomic(target: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    match fs::metadata(target) {
        Ok(meta) => tmp.as_file().set_permissions(meta.permissions())?,
        Err(_) => default_permissions(tmp.as_file())?,
    }
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(unix)]
fn default_permissions(file: &fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn default_permissions(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Byte offsets of every non-overlapping occurrence of `needle`.
fn occurrence_positions(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut from = 0;
    while let Some(found) = find_bytes(&haystack[from..], needle) {
        let at = from + found;
        positions.push(at);
        from = at + needle.len();
    }
    positions
}

/// Number of non-overlapping occurrences of `needle` in `haystack`.
pub fn count_occurrences(haystack: &str, needle: &str) -> usize {
    occurrence_positions(haystack.as_bytes(), needle.as_bytes()).len()
}

fn line_of(content: &[u8], byte_offset: usize) -> usize {
    content[..byte_offset].iter().filter(|&&b| b == b'\n').count() + 1
}

/// Minimal unified-style diff: shared leading and trailing lines are elided.
pub fn render_diff(path: &str, before: &str, after: &str) -> String {
    let old: Vec<&str> = before.lines().collect();
    let new: Vec<&str> = after.lines().collect();

    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = format!("--- a/{path}\n+++ b/{path}\n@@ -{} +{} @@\n", prefix + 1, prefix + 1);
    for line in &old[prefix..old.len() - suffix] {
        out.push('-');
        out.push_str(line);
        out.push('\n');
    }
    for line in &new[prefix..new.len() - suffix] {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    out
}
