//! Conflict-related model types

use serde::{Deserialize, Serialize};

/// Index stages recorded for a conflicted file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictFile {
    /// File path relative to repository root
    pub path: String,
    /// Base (ancestor) version
    pub ancestor: Option<ConflictBlob>,
    /// Our (current branch) version
    pub ours: Option<ConflictBlob>,
    /// Their (incoming) version
    pub theirs: Option<ConflictBlob>,
}

/// One side of a conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictBlob {
    /// Object ID (blob hash)
    pub oid: String,
    /// File mode
    pub mode: u32,
    #[serde(skip)]
    pub content: Vec<u8>,
}

/// Which version a hunk or file resolution keeps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionSide {
    Ours,
    Theirs,
    #[default]
    Manual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStatus {
    #[default]
    Unresolved,
    Resolved,
}

/// Lines spanned by a conflict block in the file as the backend wrote it
/// (1-based, inclusive, marker lines included)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HunkRange {
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HunkResolution {
    pub range: HunkRange,
    pub side: ResolutionSide,
    pub applied: bool,
}

/// Resolution progress for one conflicted path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub path: String,
    pub status: ResolutionStatus,
    pub hunks: Vec<HunkResolution>,
}

impl ConflictEntry {
    pub fn is_resolved(&self) -> bool {
        self.status == ResolutionStatus::Resolved
    }
}
