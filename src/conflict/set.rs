//! Per-path conflict resolution tracking

use std::collections::BTreeMap;

use super::markers::{contains_conflict_markers, ConflictDocument, HunkChoice};
use crate::error::{Result, WorkcopyError};
use crate::models::{ConflictEntry, HunkResolution, ResolutionSide, ResolutionStatus};

#[derive(Debug, Clone)]
struct ConflictRecord {
    entry: ConflictEntry,
    document: ConflictDocument,
    choices: Vec<Option<HunkChoice>>,
}

/// Conflicted paths of the paused operation, keyed by repository-relative path
#[derive(Debug, Clone, Default)]
pub struct ConflictSet {
    records: BTreeMap<String, ConflictRecord>,
}

impl ConflictSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a conflicted path. `content` is the working file as the backend
    /// wrote it; `None` for binary or deleted files, which have no hunks.
    pub fn insert(&mut self, path: &str, content: Option<&str>) {
        let document = content.map(ConflictDocument::parse).unwrap_or_default();
        let hunks: Vec<HunkResolution> = document
            .blocks()
            .map(|block| HunkResolution {
                range: block.range,
                side: ResolutionSide::Manual,
                applied: false,
            })
            .collect();
        let choices = vec![None; hunks.len()];

        self.records.insert(
            path.to_string(),
            ConflictRecord {
                entry: ConflictEntry {
                    path: path.to_string(),
                    status: ResolutionStatus::Unresolved,
                    hunks,
                },
                document,
                choices,
            },
        );
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.records.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&ConflictEntry> {
        self.records.get(path).map(|record| &record.entry)
    }

    pub fn entries(&self) -> Vec<ConflictEntry> {
        self.records.values().map(|r| r.entry.clone()).collect()
    }

    pub fn paths(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn unresolved_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| !r.entry.is_resolved())
            .count()
    }

    pub fn is_unresolved(&self, path: &str) -> bool {
        self.get(path).is_some_and(|entry| !entry.is_resolved())
    }

    fn unresolved_record(&self, path: &str) -> Result<&ConflictRecord> {
        let record = self
            .records
            .get(path)
            .ok_or_else(|| WorkcopyError::OperationConflict(format!("{path} is not conflicted")))?;
        if record.entry.is_resolved() {
            return Err(WorkcopyError::OperationConflict(format!(
                "{path} is already resolved"
            )));
        }
        Ok(record)
    }

    /// Apply `choice` to one hunk. The re-rendered file is handed to `write`
    /// first; the set only changes once the write succeeded.
    pub fn resolve_hunk<F>(
        &mut self,
        path: &str,
        index: usize,
        choice: HunkChoice,
        write: F,
    ) -> Result<ResolutionStatus>
    where
        F: FnOnce(&str) -> Result<()>,
    {
        let record = self.unresolved_record(path)?;
        if index >= record.entry.hunks.len() {
            return Err(WorkcopyError::OperationConflict(format!(
                "hunk {index} out of range for {path} ({} hunks)",
                record.entry.hunks.len()
            )));
        }
        if let HunkChoice::Manual(text) = &choice {
            if contains_conflict_markers(text) {
                return Err(WorkcopyError::ConflictMarkersRemain(path.to_string()));
            }
        }

        let side = match &choice {
            HunkChoice::Ours => ResolutionSide::Ours,
            HunkChoice::Theirs => ResolutionSide::Theirs,
            HunkChoice::Manual(_) => ResolutionSide::Manual,
        };

        let mut choices = record.choices.clone();
        choices[index] = Some(choice);
        let rendered = record.document.render(&choices);
        let all_applied = choices.iter().all(Option::is_some);
        let status = if all_applied && !contains_conflict_markers(&rendered) {
            ResolutionStatus::Resolved
        } else {
            ResolutionStatus::Unresolved
        };

        write(&rendered)?;

        if let Some(record) = self.records.get_mut(path) {
            record.choices = choices;
            record.entry.hunks[index].side = side;
            record.entry.hunks[index].applied = true;
            record.entry.status = status;
        }
        Ok(status)
    }

    /// Whole-file resolution with one side's version
    pub fn resolve_file(&mut self, path: &str, side: ResolutionSide) -> Result<()> {
        self.unresolved_record(path)?;
        if let Some(record) = self.records.get_mut(path) {
            for hunk in &mut record.entry.hunks {
                hunk.side = side;
                hunk.applied = true;
            }
            record.entry.status = ResolutionStatus::Resolved;
        }
        Ok(())
    }

    /// Accept an externally edited file once it no longer carries conflict blocks
    pub fn mark_resolved(&mut self, path: &str, content: Option<&str>) -> Result<()> {
        self.unresolved_record(path)?;
        if let Some(text) = content {
            if ConflictDocument::parse(text).has_conflicts() {
                return Err(WorkcopyError::ConflictMarkersRemain(path.to_string()));
            }
        }
        if let Some(record) = self.records.get_mut(path) {
            for hunk in record.entry.hunks.iter_mut().filter(|h| !h.applied) {
                hunk.side = ResolutionSide::Manual;
                hunk.applied = true;
            }
            record.entry.status = ResolutionStatus::Resolved;
        }
        Ok(())
    }
}
