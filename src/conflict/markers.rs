//! Conflict marker parsing
//!
//! Splits a conflicted working file into plain text and conflict blocks so
//! individual hunks can be resolved and the file re-rendered.

use crate::models::HunkRange;

pub const OURS_MARKER: &str = "<<<<<<<";
pub const BASE_MARKER: &str = "|||||||";
pub const SEPARATOR: &str = "=======";
pub const THEIRS_MARKER: &str = ">>>>>>>";

/// Replacement chosen for a single conflict block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkChoice {
    Ours,
    Theirs,
    Manual(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictBlock {
    pub ours_label: String,
    pub theirs_label: String,
    pub ours: String,
    /// Present for diff3-style markers
    pub base: Option<String>,
    pub theirs: String,
    pub range: HunkRange,
    raw: String,
}

impl ConflictBlock {
    /// The block exactly as it appears in the file, markers included
    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn text_for(&self, choice: &HunkChoice) -> String {
        match choice {
            HunkChoice::Ours => self.ours.clone(),
            HunkChoice::Theirs => self.theirs.clone(),
            HunkChoice::Manual(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Conflict(ConflictBlock),
}

/// A conflicted file split into segments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictDocument {
    segments: Vec<Segment>,
}

#[derive(Clone, Copy)]
enum Section {
    Outside,
    Ours,
    Base,
    Theirs,
}

/// Label following a marker, if `line` is that marker line
fn marker_label(line: &str, marker: &str) -> Option<String> {
    let line = line.trim_end_matches(['\n', '\r']);
    let rest = line.strip_prefix(marker)?;
    if rest.is_empty() {
        return Some(String::new());
    }
    rest.strip_prefix(' ').map(|label| label.to_string())
}

fn is_separator(line: &str) -> bool {
    line.trim_end_matches(['\n', '\r']) == SEPARATOR
}

impl ConflictDocument {
    pub fn parse(text: &str) -> Self {
        let mut segments: Vec<Segment> = Vec::new();
        let mut text_buf = String::new();
        let mut section = Section::Outside;
        let mut block: Option<ConflictBlock> = None;

        for (idx, line) in text.split_inclusive('\n').enumerate() {
            let line_no = idx + 1;
            match section {
                Section::Outside => {
                    if let Some(label) = marker_label(line, OURS_MARKER) {
                        block = Some(ConflictBlock {
                            ours_label: label,
                            theirs_label: String::new(),
                            ours: String::new(),
                            base: None,
                            theirs: String::new(),
                            range: HunkRange {
                                start_line: line_no,
                                end_line: line_no,
                            },
                            raw: line.to_string(),
                        });
                        section = Section::Ours;
                    } else {
                        text_buf.push_str(line);
                    }
                }
                Section::Ours | Section::Base | Section::Theirs => {
                    let Some(current) = block.as_mut() else {
                        section = Section::Outside;
                        text_buf.push_str(line);
                        continue;
                    };
                    current.raw.push_str(line);

                    match section {
                        Section::Ours if marker_label(line, BASE_MARKER).is_some() => {
                            current.base = Some(String::new());
                            section = Section::Base;
                        }
                        Section::Ours | Section::Base if is_separator(line) => {
                            section = Section::Theirs;
                        }
                        Section::Ours => current.ours.push_str(line),
                        Section::Base => {
                            if let Some(base) = current.base.as_mut() {
                                base.push_str(line);
                            }
                        }
                        Section::Theirs => {
                            if let Some(label) = marker_label(line, THEIRS_MARKER) {
                                current.theirs_label = label;
                                current.range.end_line = line_no;
                                if !text_buf.is_empty() {
                                    segments.push(Segment::Text(std::mem::take(&mut text_buf)));
                                }
                                if let Some(done) = block.take() {
                                    segments.push(Segment::Conflict(done));
                                }
                                section = Section::Outside;
                            } else {
                                current.theirs.push_str(line);
                            }
                        }
                        Section::Outside => {}
                    }
                }
            }
        }

        // An unterminated block is kept verbatim as text
        if let Some(open) = block.take() {
            text_buf.push_str(&open.raw);
        }
        if !text_buf.is_empty() {
            segments.push(Segment::Text(text_buf));
        }

        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn blocks(&self) -> impl Iterator<Item = &ConflictBlock> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Conflict(block) => Some(block),
            Segment::Text(_) => None,
        })
    }

    pub fn block_count(&self) -> usize {
        self.blocks().count()
    }

    pub fn has_conflicts(&self) -> bool {
        self.block_count() > 0
    }

    /// Re-render the file; blocks without a choice keep their markers
    pub fn render(&self, choices: &[Option<HunkChoice>]) -> String {
        let mut out = String::new();
        let mut block_idx = 0;
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Conflict(block) => {
                    match choices.get(block_idx).and_then(|c| c.as_ref()) {
                        Some(choice) => out.push_str(&block.text_for(choice)),
                        None => out.push_str(block.raw()),
                    }
                    block_idx += 1;
                }
            }
        }
        out
    }
}

/// True when any line opens or closes a conflict block
pub fn contains_conflict_markers(text: &str) -> bool {
    text.lines().any(|line| {
        marker_label(line, OURS_MARKER).is_some() || marker_label(line, THEIRS_MARKER).is_some()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_BLOCKS: &str = "header\n\
<<<<<<< HEAD\n\
ours one\n\
=======\n\
theirs one\n\
>>>>>>> feature\n\
middle\n\
<<<<<<< HEAD\n\
ours two\n\
=======\n\
theirs two\n\
>>>>>>> feature\n\
footer\n";

    #[test]
    fn test_parse_two_blocks() {
        let doc = ConflictDocument::parse(TWO_BLOCKS);
        let blocks: Vec<_> = doc.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].ours, "ours one\n");
        assert_eq!(blocks[0].theirs, "theirs one\n");
        assert_eq!(blocks[0].ours_label, "HEAD");
        assert_eq!(blocks[0].theirs_label, "feature");
        assert_eq!(
            blocks[0].range,
            HunkRange {
                start_line: 2,
                end_line: 6
            }
        );
        assert_eq!(blocks[1].range.start_line, 8);
    }

    #[test]
    fn test_render_without_choices_is_identity() {
        let doc = ConflictDocument::parse(TWO_BLOCKS);
        assert_eq!(doc.render(&[]), TWO_BLOCKS);
    }

    #[test]
    fn test_render_mixed_choices() {
        let doc = ConflictDocument::parse(TWO_BLOCKS);
        let rendered = doc.render(&[
            Some(HunkChoice::Theirs),
            Some(HunkChoice::Manual("both\n".to_string())),
        ]);
        assert_eq!(rendered, "header\ntheirs one\nmiddle\nboth\nfooter\n");
        assert!(!contains_conflict_markers(&rendered));
    }

    #[test]
    fn test_partial_render_keeps_markers() {
        let doc = ConflictDocument::parse(TWO_BLOCKS);
        let rendered = doc.render(&[Some(HunkChoice::Ours)]);
        assert!(rendered.starts_with("header\nours one\nmiddle\n<<<<<<< HEAD\n"));
        assert!(contains_conflict_markers(&rendered));
    }

    #[test]
    fn test_diff3_base_section() {
        let text = "<<<<<<< ours\na\n||||||| base\no\n=======\nb\n>>>>>>> theirs\n";
        let doc = ConflictDocument::parse(text);
        let block = doc.blocks().next().unwrap();
        assert_eq!(block.base.as_deref(), Some("o\n"));
        assert_eq!(block.ours, "a\n");
        assert_eq!(block.theirs, "b\n");
    }

    #[test]
    fn test_unterminated_block_is_text() {
        let text = "a\n<<<<<<< HEAD\nb\n=======\n";
        let doc = ConflictDocument::parse(text);
        assert!(!doc.has_conflicts());
        assert_eq!(doc.render(&[]), text);
    }

    #[test]
    fn test_separator_alone_is_not_a_marker() {
        assert!(!contains_conflict_markers("Title\n=======\nbody\n"));
        assert!(contains_conflict_markers("x\n>>>>>>> theirs\n"));
    }

    #[test]
    fn test_longer_marker_runs_are_content() {
        let text = "<<<<<<<< not a marker\n";
        assert!(!ConflictDocument::parse(text).has_conflicts());
    }
}
