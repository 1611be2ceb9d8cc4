//! Unified diff hunk grammar.
//!
//! A diff body is a sequence of hunks. Each hunk starts with a header
//! `@@ -old_start[,old_count] +new_start[,new_count] @@` and is followed by
//! lines classified by their first character: `' '` context, `'-'` delete,
//! `'+'` add, and `'\'` for the "No newline at end of file" marker.

use regex::Regex;
use std::sync::LazyLock;

use crate::errors::PatchError;

static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk header regex")
});

/// File header lines emitted by diff tools, ignored between hunks.
const FILE_HEADER_PREFIXES: &[&str] = &[
    "---",
    "+++",
    "diff ",
    "index ",
    "new file mode",
    "deleted file mode",
    "old mode",
    "new mode",
    "similarity index",
    "rename from",
    "rename to",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkHeader {
    /// 1-based start line in the original file (0 for insertion at top).
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
}

impl HunkHeader {
    /// Parse a hunk header line. Missing counts default to 1.
    pub fn parse(line: &str) -> Result<Self, PatchError> {
        let caps = HUNK_HEADER_RE
            .captures(line)
            .ok_or_else(|| PatchError::InvalidHunkHeader {
                line: line.to_string(),
            })?;

        let number = |idx: usize, default: usize| -> Result<usize, PatchError> {
            match caps.get(idx) {
                Some(m) => m.as_str().parse().map_err(|_| PatchError::InvalidHunkHeader {
                    line: line.to_string(),
                }),
                None => Ok(default),
            }
        };

        Ok(Self {
            old_start: number(1, 0)?,
            old_count: number(2, 1)?,
            new_start: number(3, 0)?,
            new_count: number(4, 1)?,
        })
    }

    /// 0-based index into the original lines where this hunk begins.
    ///
    /// A zero-length original range names the line *after which* the new
    /// lines are inserted, so it is not shifted down by one.
    pub fn start_index(&self) -> usize {
        if self.old_count == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Delete(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub header: HunkHeader,
    pub lines: Vec<HunkLine>,
    /// The original side ends without a trailing newline.
    pub old_missing_newline: bool,
    /// The updated side ends without a trailing newline.
    pub new_missing_newline: bool,
}

impl Hunk {
    fn new(header: HunkHeader) -> Self {
        Self {
            header,
            lines: Vec::new(),
            old_missing_newline: false,
            new_missing_newline: false,
        }
    }

    /// Original lines covered by the body (context + delete).
    pub fn old_lines(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| !matches!(l, HunkLine::Add(_)))
            .count()
    }

    /// Updated lines covered by the body (context + add).
    pub fn new_lines(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| !matches!(l, HunkLine::Delete(_)))
            .count()
    }

    /// The hunk carries a "No newline at end of file" marker on either side.
    pub fn marks_end_of_file(&self) -> bool {
        self.old_missing_newline || self.new_missing_newline
    }

    fn body_complete(&self) -> bool {
        self.old_lines() >= self.header.old_count && self.new_lines() >= self.header.new_count
    }
}

fn classify(line: &str) -> Option<HunkLine> {
    if line.is_empty() {
        // Blank context lines often lose their leading space in transit.
        return Some(HunkLine::Context(String::new()));
    }
    match line.as_bytes()[0] {
        b' ' => Some(HunkLine::Context(line[1..].to_string())),
        b'-' => Some(HunkLine::Delete(line[1..].to_string())),
        b'+' => Some(HunkLine::Add(line[1..].to_string())),
        _ => None,
    }
}

/// The marker applies to the line just before it: a delete names the
/// original side, an add the updated side, context both.
fn mark_missing_newline(hunk: &mut Hunk) {
    match hunk.lines.last() {
        Some(HunkLine::Delete(_)) => hunk.old_missing_newline = true,
        Some(HunkLine::Add(_)) => hunk.new_missing_newline = true,
        Some(HunkLine::Context(_)) => {
            hunk.old_missing_newline = true;
            hunk.new_missing_newline = true;
        }
        None => {}
    }
}

/// Parse a diff into hunks and verify every hunk body against its header.
pub fn parse_hunks(diff: &str) -> Result<Vec<Hunk>, PatchError> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;

    for (idx, line) in diff.lines().enumerate() {
        let line_number = idx + 1;

        if line.starts_with("@@") {
            if let Some(done) = current.take() {
                hunks.push(done);
            }
            current = Some(Hunk::new(HunkHeader::parse(line)?));
            continue;
        }

        if line.starts_with('\\') {
            if let Some(hunk) = current.as_mut() {
                mark_missing_newline(hunk);
            }
            continue;
        }

        let in_body = current.as_ref().is_some_and(|h| !h.body_complete());
        if in_body {
            let parsed = classify(line).ok_or_else(|| PatchError::UnexpectedLine {
                line_number,
                line: line.to_string(),
            })?;
            if let Some(hunk) = current.as_mut() {
                hunk.lines.push(parsed);
            }
            continue;
        }

        if line.trim().is_empty() || FILE_HEADER_PREFIXES.iter().any(|p| line.starts_with(p)) {
            continue;
        }

        // Body lines beyond the declared counts are kept so the count check
        // below reports them.
        match (current.as_mut(), classify(line)) {
            (Some(hunk), Some(parsed)) => hunk.lines.push(parsed),
            _ => {
                return Err(PatchError::UnexpectedLine {
                    line_number,
                    line: line.to_string(),
                });
            }
        }
    }

    if let Some(done) = current.take() {
        hunks.push(done);
    }

    for (idx, hunk) in hunks.iter().enumerate() {
        let (actual_old, actual_new) = (hunk.old_lines(), hunk.new_lines());
        if actual_old != hunk.header.old_count || actual_new != hunk.header.new_count {
            return Err(PatchError::CountMismatch {
                hunk: idx + 1,
                declared_old: hunk.header.old_count,
                declared_new: hunk.header.new_count,
                actual_old,
                actual_new,
            });
        }
    }

    Ok(hunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_with_counts() {
        let h = HunkHeader::parse("@@ -3,4 +3,5 @@ fn main()").unwrap();
        assert_eq!(
            h,
            HunkHeader {
                old_start: 3,
                old_count: 4,
                new_start: 3,
                new_count: 5
            }
        );
        assert_eq!(h.start_index(), 2);
    }

    #[test]
    fn test_header_missing_counts_default_to_one() {
        let h = HunkHeader::parse("@@ -7 +7 @@").unwrap();
        assert_eq!(h.old_count, 1);
        assert_eq!(h.new_count, 1);
    }

    #[test]
    fn test_header_zero_length_range_inserts_after_line() {
        let h = HunkHeader::parse("@@ -5,0 +6,2 @@").unwrap();
        assert_eq!(h.start_index(), 5);
        let top = HunkHeader::parse("@@ -0,0 +1,3 @@").unwrap();
        assert_eq!(top.start_index(), 0);
    }

    #[test]
    fn test_header_rejects_garbage() {
        for bad in ["@@ -a,1 +1 @@", "@@ 1,2 3,4 @@", "@@ -1,2 @@"] {
            assert!(
                matches!(
                    HunkHeader::parse(bad),
                    Err(PatchError::InvalidHunkHeader { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_skips_file_headers() {
        let diff = "diff --git a/x b/x\nindex 123..456\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n-old\n+new\n";
        let hunks = parse_hunks(diff).unwrap();
        assert_eq!(hunks.len(), 1);
        assert_eq!(
            hunks[0].lines,
            vec![
                HunkLine::Delete("old".into()),
                HunkLine::Add("new".into())
            ]
        );
    }

    #[test]
    fn test_parse_delete_line_that_looks_like_header() {
        // Deleting the line "-- note" produces "--- note" inside the body.
        let diff = "@@ -1,2 +1,1 @@\n--- note\n keep\n";
        let hunks = parse_hunks(diff).unwrap();
        assert_eq!(hunks[0].lines[0], HunkLine::Delete("-- note".into()));
    }

    #[test]
    fn test_parse_count_mismatch_short_body() {
        let diff = "@@ -1,3 +1,3 @@\n a\n-b\n+c\n";
        match parse_hunks(diff) {
            Err(PatchError::CountMismatch {
                declared_old,
                actual_old,
                ..
            }) => {
                assert_eq!(declared_old, 3);
                assert_eq!(actual_old, 2);
            }
            other => panic!("expected CountMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_count_mismatch_long_body() {
        let diff = "@@ -1 +1 @@\n-a\n+b\n+c\n";
        assert!(matches!(
            parse_hunks(diff),
            Err(PatchError::CountMismatch { actual_new: 2, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_preamble_text() {
        let diff = "Here is the diff you asked for\n@@ -1 +1 @@\n-a\n+b\n";
        assert!(matches!(
            parse_hunks(diff),
            Err(PatchError::UnexpectedLine { line_number: 1, .. })
        ));
    }

    #[test]
    fn test_parse_no_newline_marker() {
        let diff = "@@ -1 +1 @@\n-a\n+b\n\\ No newline at end of file\n";
        let hunks = parse_hunks(diff).unwrap();
        assert!(hunks[0].new_missing_newline);
        assert!(!hunks[0].old_missing_newline);
    }

    #[test]
    fn test_parse_no_newline_marker_on_original_side() {
        let diff = "@@ -1 +1,2 @@\n-a\n\\ No newline at end of file\n+a\n+b\n";
        let hunks = parse_hunks(diff).unwrap();
        assert!(hunks[0].old_missing_newline);
        assert!(!hunks[0].new_missing_newline);
        assert_eq!(hunks[0].lines.len(), 3);
    }

    #[test]
    fn test_parse_empty_diff_has_no_hunks() {
        assert!(parse_hunks("").unwrap().is_empty());
        assert!(parse_hunks("--- a/x\n+++ b/x\n").unwrap().is_empty());
    }
}
