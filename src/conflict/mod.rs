//! Conflict tracking for paused operations

pub mod markers;
pub mod set;

pub use markers::{contains_conflict_markers, ConflictBlock, ConflictDocument, HunkChoice, Segment};
pub use set::ConflictSet;
