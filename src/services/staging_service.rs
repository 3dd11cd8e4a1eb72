//! Conflict resolution and partial staging
//!
//! Every call holds the per-path locks for the paths it touches, so calls on
//! disjoint paths run side by side while calls on the same path serialize.
//! Hunk-level changes are computed against the full file content and written
//! back with a single backend call.

use std::path::Path;
use std::sync::Arc;

use super::context::RepositoryContext;
use crate::backend::IndexUpdate;
use crate::conflict::HunkChoice;
use crate::error::{Result, WorkcopyError};
use crate::models::{
    DiffHunk, DiffLine, DiffLineOrigin, FileHunks, ResolutionSide, ResolutionStatus, StageTarget,
};

/// Applies resolution and staging actions for one repository
#[derive(Clone)]
pub struct DiffStagingEngine {
    context: Arc<RepositoryContext>,
}

/// Line range of a hunk on each side, as 0-based start and length
#[derive(Debug, Clone, Copy)]
struct HunkSpan {
    old_start: usize,
    old_len: usize,
    new_start: usize,
    new_len: usize,
}

impl HunkSpan {
    fn from_hunk(hunk: &DiffHunk) -> Self {
        // An empty side reports the line before the insertion point
        let start = |start: u32, len: u32| {
            if len == 0 {
                start as usize
            } else {
                start.saturating_sub(1) as usize
            }
        };
        Self {
            old_start: start(hunk.old_start, hunk.old_lines),
            old_len: hunk.old_lines as usize,
            new_start: start(hunk.new_start, hunk.new_lines),
            new_len: hunk.new_lines as usize,
        }
    }
}

fn split_lines(content: &[u8]) -> Vec<&[u8]> {
    content.split_inclusive(|b| *b == b'\n').collect()
}

/// `base` with one hunk span replaced by the matching lines of `source`
fn splice(
    base: &[u8],
    base_start: usize,
    base_len: usize,
    source: &[u8],
    source_start: usize,
    source_len: usize,
) -> Result<Vec<u8>> {
    let base_lines = split_lines(base);
    let source_lines = split_lines(source);
    if base_start + base_len > base_lines.len() || source_start + source_len > source_lines.len()
    {
        return Err(WorkcopyError::OperationConflict(
            "hunk no longer matches the file".to_string(),
        ));
    }

    let mut out = Vec::with_capacity(base.len() + source.len());
    for line in &base_lines[..base_start] {
        out.extend_from_slice(line);
    }
    for line in &source_lines[source_start..source_start + source_len] {
        out.extend_from_slice(line);
    }
    for line in &base_lines[base_start + base_len..] {
        out.extend_from_slice(line);
    }
    Ok(out)
}

/// Structured hunks between two versions of `path`
fn diff_hunks(path: &str, old: &[u8], new: &[u8]) -> Result<(Vec<DiffHunk>, usize, usize)> {
    let mut opts = git2::DiffOptions::new();
    opts.context_lines(3);
    let patch = git2::Patch::from_buffers(
        old,
        Some(Path::new(path)),
        new,
        Some(Path::new(path)),
        Some(&mut opts),
    )?;

    let mut hunks = Vec::new();
    let mut additions = 0;
    let mut deletions = 0;
    for hunk_idx in 0..patch.num_hunks() {
        let (hunk, num_lines) = patch.hunk(hunk_idx)?;
        let mut lines = Vec::with_capacity(num_lines);
        for line_idx in 0..num_lines {
            let line = patch.line_in_hunk(hunk_idx, line_idx)?;
            let Some(origin) = DiffLineOrigin::from_git(line.origin()) else {
                continue;
            };
            match origin {
                DiffLineOrigin::Addition => additions += 1,
                DiffLineOrigin::Deletion => deletions += 1,
                _ => {}
            }
            lines.push(DiffLine {
                content: String::from_utf8_lossy(line.content()).to_string(),
                origin,
                old_line_no: line.old_lineno(),
                new_line_no: line.new_lineno(),
            });
        }
        hunks.push(DiffHunk {
            header: String::from_utf8_lossy(hunk.header()).trim().to_string(),
            old_start: hunk.old_start(),
            old_lines: hunk.old_lines(),
            new_start: hunk.new_start(),
            new_lines: hunk.new_lines(),
            lines,
        });
    }
    Ok((hunks, additions, deletions))
}

impl DiffStagingEngine {
    pub fn new(context: Arc<RepositoryContext>) -> Self {
        Self { context }
    }

    /// Apply one side (or replacement text for `Manual`) to a conflict hunk
    /// and re-render the file into the working tree
    pub fn resolve_hunk(
        &self,
        path: &str,
        hunk_index: usize,
        side: ResolutionSide,
        text: Option<String>,
    ) -> Result<ResolutionStatus> {
        let choice = match (side, text) {
            (ResolutionSide::Ours, _) => HunkChoice::Ours,
            (ResolutionSide::Theirs, _) => HunkChoice::Theirs,
            (ResolutionSide::Manual, Some(text)) => HunkChoice::Manual(text),
            (ResolutionSide::Manual, None) => {
                return Err(WorkcopyError::OperationConflict(
                    "manual resolution needs replacement text".to_string(),
                ))
            }
        };

        let _guard = self.context.locks().acquire(&[path]);
        let backend = self.context.backend();
        let status = self.context.conflicts_mut()?.resolve_hunk(
            path,
            hunk_index,
            choice,
            |rendered| backend.write_workdir(path, rendered.as_bytes()),
        )?;
        tracing::debug!("Resolved hunk {} of {}: {:?}", hunk_index, path, status);

        self.context.refresh();
        Ok(status)
    }

    /// Take the whole Ours or Theirs version of a conflicted file. A side
    /// that deleted the file removes it from the working tree.
    pub fn resolve_file(&self, path: &str, side: ResolutionSide) -> Result<()> {
        let _guard = self.context.locks().acquire(&[path]);
        let mut conflicts = self.context.conflicts_mut()?;
        if !conflicts.is_unresolved(path) {
            return Err(WorkcopyError::OperationConflict(format!(
                "{} has no unresolved conflict",
                path
            )));
        }

        let backend = self.context.backend();
        let file = backend.conflict_file(path)?;
        let blob = match side {
            ResolutionSide::Ours => file.ours,
            ResolutionSide::Theirs => file.theirs,
            ResolutionSide::Manual => {
                return Err(WorkcopyError::OperationConflict(
                    "use mark_resolved for manual edits".to_string(),
                ))
            }
        };
        match blob {
            Some(blob) => backend.write_workdir(path, &blob.content)?,
            None => backend.remove_workdir(path)?,
        }
        conflicts.resolve_file(path, side)?;
        drop(conflicts);

        tracing::debug!("Resolved {} with {:?}", path, side);
        self.context.refresh();
        Ok(())
    }

    /// Accept the working file as edited outside the engine
    pub fn mark_resolved(&self, path: &str) -> Result<()> {
        let _guard = self.context.locks().acquire(&[path]);
        let content = self.context.backend().read_workdir(path)?;
        let text = content.and_then(|bytes| String::from_utf8(bytes).ok());
        self.context
            .conflicts_mut()?
            .mark_resolved(path, text.as_deref())?;

        self.context.refresh();
        Ok(())
    }

    /// Hunks of `path`: HEAD to index when `staged`, index to working tree otherwise
    pub fn file_hunks(&self, path: &str, staged: bool) -> Result<FileHunks> {
        let (old, new) = self.versions(path, staged)?;
        let (hunks, additions, deletions) = diff_hunks(path, &old, &new)?;
        Ok(FileHunks {
            path: path.to_string(),
            staged,
            hunks,
            additions,
            deletions,
        })
    }

    fn versions(&self, path: &str, staged: bool) -> Result<(Vec<u8>, Vec<u8>)> {
        let backend = self.context.backend();
        let (old, new) = if staged {
            (backend.read_head(path)?, backend.read_index(path)?)
        } else {
            (backend.read_index(path)?, backend.read_workdir(path)?)
        };
        Ok((old.unwrap_or_default(), new.unwrap_or_default()))
    }

    fn hunk(&self, path: &str, index: usize, staged: bool) -> Result<(HunkSpan, Vec<u8>, Vec<u8>)> {
        let (old, new) = self.versions(path, staged)?;
        let (hunks, _, _) = diff_hunks(path, &old, &new)?;
        let hunk = hunks.get(index).ok_or_else(|| {
            WorkcopyError::OperationConflict(format!(
                "hunk {} out of range for {} ({} hunks)",
                index,
                path,
                hunks.len()
            ))
        })?;
        Ok((HunkSpan::from_hunk(hunk), old, new))
    }

    fn check_target(&self, target: &StageTarget) -> Result<()> {
        let conflicts = self.context.conflicts()?;
        match target {
            StageTarget::Hunk { path, .. } if conflicts.contains(path) => {
                Err(WorkcopyError::OperationConflict(format!(
                    "{} is conflicted; resolve it before staging hunks",
                    path
                )))
            }
            StageTarget::Files { paths } => {
                match paths.iter().find(|p| conflicts.is_unresolved(p)) {
                    Some(path) => Err(WorkcopyError::OperationConflict(format!(
                        "{} has unresolved conflicts",
                        path
                    ))),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Copy the target from the working tree into the index. Every file of
    /// a `Files` target is read first and the index is written once.
    pub fn stage(&self, target: &StageTarget) -> Result<()> {
        let paths = target.paths();
        let _guard = self.context.locks().acquire(&paths);
        self.check_target(target)?;

        let backend = self.context.backend();
        match target {
            StageTarget::Files { paths } => {
                let updates = paths
                    .iter()
                    .map(|path| {
                        Ok(IndexUpdate {
                            path: path.clone(),
                            content: backend.read_workdir(path)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                backend.write_index_entries(&updates)?;
            }
            StageTarget::Hunk { path, index } => {
                let (span, index_content, workdir) = self.hunk(path, *index, false)?;
                let staged = splice(
                    &index_content,
                    span.old_start,
                    span.old_len,
                    &workdir,
                    span.new_start,
                    span.new_len,
                )?;
                backend.write_index(path, Some(&staged))?;
            }
        }
        tracing::debug!("Staged {:?}", target);
        self.context.refresh();
        Ok(())
    }

    /// Return the target's index content to HEAD. For hunks, `index`
    /// addresses the staged (HEAD to index) hunk list.
    pub fn unstage(&self, target: &StageTarget) -> Result<()> {
        let paths = target.paths();
        let _guard = self.context.locks().acquire(&paths);
        self.check_target(target)?;

        let backend = self.context.backend();
        match target {
            StageTarget::Files { paths } => {
                let updates = paths
                    .iter()
                    .map(|path| {
                        Ok(IndexUpdate {
                            path: path.clone(),
                            content: backend.read_head(path)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                backend.write_index_entries(&updates)?;
            }
            StageTarget::Hunk { path, index } => {
                let (span, head, index_content) = self.hunk(path, *index, true)?;
                let restored = splice(
                    &index_content,
                    span.new_start,
                    span.new_len,
                    &head,
                    span.old_start,
                    span.old_len,
                )?;
                backend.write_index(path, Some(&restored))?;
            }
        }
        tracing::debug!("Unstaged {:?}", target);
        self.context.refresh();
        Ok(())
    }

    /// Drop working-tree changes for the target. Cannot be undone.
    pub fn discard(&self, target: &StageTarget) -> Result<()> {
        let paths = target.paths();
        let _guard = self.context.locks().acquire(&paths);
        {
            let conflicts = self.context.conflicts()?;
            if let Some(path) = paths.iter().find(|p| conflicts.contains(p)) {
                return Err(WorkcopyError::OperationConflict(format!(
                    "{} is conflicted; abort the operation to discard it",
                    path
                )));
            }
        }

        let backend = self.context.backend();
        match target {
            StageTarget::Files { paths } => {
                for path in paths {
                    backend.discard_path(path)?;
                }
            }
            StageTarget::Hunk { path, index } => {
                let (span, index_content, workdir) = self.hunk(path, *index, false)?;
                let reverted = splice(
                    &workdir,
                    span.new_start,
                    span.new_len,
                    &index_content,
                    span.old_start,
                    span.old_len,
                )?;
                backend.write_workdir(path, &reverted)?;
            }
        }
        tracing::info!("Discarded {:?}", target);
        self.context.refresh();
        Ok(())
    }
}
