//! Diff models

use serde::{Deserialize, Serialize};

/// Hunks of one file, addressable by index for partial staging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHunks {
    pub path: String,
    /// HEAD to index when true, index to working tree otherwise
    pub staged: bool,
    pub hunks: Vec<DiffHunk>,
    pub additions: usize,
    pub deletions: usize,
}

/// A hunk in a diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffHunk {
    pub header: String,
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    pub lines: Vec<DiffLine>,
}

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
    pub content: String,
    pub origin: DiffLineOrigin,
    pub old_line_no: Option<u32>,
    pub new_line_no: Option<u32>,
}

/// Origin type for a diff line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffLineOrigin {
    Context,
    Addition,
    Deletion,
    ContextEofnl,
    AddEofnl,
    DelEofnl,
}

impl DiffLineOrigin {
    /// Maps a libgit2 line origin; header and binary markers have no line
    pub fn from_git(c: char) -> Option<Self> {
        match c {
            ' ' => Some(DiffLineOrigin::Context),
            '+' => Some(DiffLineOrigin::Addition),
            '-' => Some(DiffLineOrigin::Deletion),
            '=' => Some(DiffLineOrigin::ContextEofnl),
            '>' => Some(DiffLineOrigin::AddEofnl),
            '<' => Some(DiffLineOrigin::DelEofnl),
            _ => None,
        }
    }
}

/// Scope of a stage, unstage or discard call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StageTarget {
    Files { paths: Vec<String> },
    Hunk { path: String, index: usize },
}

impl StageTarget {
    pub fn paths(&self) -> Vec<String> {
        match self {
            StageTarget::Files { paths } => paths.clone(),
            StageTarget::Hunk { path, .. } => vec![path.clone()],
        }
    }
}
