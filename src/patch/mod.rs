//! Unified diff application.
//!
//! `apply_unified_diff` validates every hunk against the current file content
//! before anything touches the disk. The updated content is written with a
//! temp-file rename, so a failed validation or an interrupted write never
//! leaves a partially patched file behind.

pub mod hunk;

use std::path::{Path, PathBuf};

use crate::errors::PatchError;
use crate::util::write_atomic;

pub use hunk::{Hunk, HunkHeader, HunkLine, parse_hunks};

const END_OF_FILE: &str = "<end of file>";

/// Outcome of a successful patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSummary {
    pub path: PathBuf,
    pub hunks: usize,
    pub added: usize,
    pub removed: usize,
    /// The target did not exist before the patch.
    pub created: bool,
}

impl PatchSummary {
    pub fn describe(&self) -> String {
        if self.hunks == 0 {
            return format!("No hunks to apply to {}", self.path.display());
        }
        format!(
            "Diff successfully applied to file {} ({} hunk(s), +{} -{})",
            self.path.display(),
            self.hunks,
            self.added,
            self.removed
        )
    }
}

/// Apply `diff` to the file at `path`.
///
/// A missing file is treated as empty and is created by the patch. An empty
/// diff is a no-op and does not create the file.
pub fn apply_unified_diff(path: &Path, diff: &str) -> Result<PatchSummary, PatchError> {
    let hunks = parse_hunks(diff)?;

    let (original, created) = match std::fs::read_to_string(path) {
        Ok(text) => (text, false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (String::new(), true),
        Err(source) => {
            return Err(PatchError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut summary = PatchSummary {
        path: path.to_path_buf(),
        hunks: hunks.len(),
        added: 0,
        removed: 0,
        created,
    };
    if hunks.is_empty() {
        tracing::debug!(path = %path.display(), "empty diff, nothing to apply");
        return Ok(summary);
    }

    let updated = apply_hunks(&original, &hunks)?;
    for hunk in &hunks {
        for line in &hunk.lines {
            match line {
                HunkLine::Add(_) => summary.added += 1,
                HunkLine::Delete(_) => summary.removed += 1,
                HunkLine::Context(_) => {}
            }
        }
    }

    write_atomic(path, updated.as_bytes()).map_err(|source| PatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::info!(
        path = %path.display(),
        hunks = summary.hunks,
        added = summary.added,
        removed = summary.removed,
        created = summary.created,
        "applied diff"
    );
    Ok(summary)
}

/// Apply a diff to in-memory content without touching the filesystem.
pub fn apply_to_content(original: &str, diff: &str) -> Result<String, PatchError> {
    let hunks = parse_hunks(diff)?;
    if hunks.is_empty() {
        return Ok(original.to_string());
    }
    apply_hunks(original, &hunks)
}

/// One line of content split from its terminator (`"\n"`, `"\r\n"` or empty
/// for a last line without one).
#[derive(Debug, Clone, Copy)]
struct SourceLine<'a> {
    text: &'a str,
    ending: &'a str,
}

fn split_lines(content: &str) -> Vec<SourceLine<'_>> {
    content
        .split_inclusive('\n')
        .map(|line| {
            let text = line.strip_suffix('\n').map_or(line, |l| l.strip_suffix('\r').unwrap_or(l));
            SourceLine {
                text,
                ending: &line[text.len()..],
            }
        })
        .collect()
}

/// Terminator used for added lines: whatever the file already uses.
fn line_terminator(source: &[SourceLine<'_>]) -> &'static str {
    match source.iter().find(|l| !l.ending.is_empty()) {
        Some(line) if line.ending == "\r\n" => "\r\n",
        _ => "\n",
    }
}

fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, PatchError> {
    let source = split_lines(original);
    let terminator = line_terminator(&source);

    let mut out: Vec<SourceLine<'_>> = Vec::with_capacity(source.len());
    let mut cursor = 0usize;
    // Net shift between original and updated numbering after each hunk.
    let mut offset: isize = 0;
    let mut final_newline = original.is_empty() || original.ends_with('\n');

    for (idx, hunk) in hunks.iter().enumerate() {
        let start = hunk.header.start_index();
        if start < cursor {
            return Err(PatchError::HunkOutOfOrder {
                hunk: idx + 1,
                start: hunk.header.old_start,
            });
        }
        if start > source.len() {
            return Err(PatchError::ContextMismatch {
                line_number: start + 1,
                expected: first_old_line(hunk).unwrap_or_default().to_string(),
                actual: END_OF_FILE.to_string(),
            });
        }

        out.extend_from_slice(&source[cursor..start]);
        cursor = start;

        for line in &hunk.lines {
            match line {
                HunkLine::Context(text) => {
                    let actual = source.get(cursor).copied();
                    if actual.map(|l| l.text) != Some(text.as_str()) {
                        return Err(PatchError::ContextMismatch {
                            line_number: cursor + 1,
                            expected: text.clone(),
                            actual: actual.map_or(END_OF_FILE, |l| l.text).to_string(),
                        });
                    }
                    out.push(source[cursor]);
                    cursor += 1;
                }
                HunkLine::Delete(text) => {
                    let actual = source.get(cursor).copied();
                    if actual.map(|l| l.text) != Some(text.as_str()) {
                        return Err(PatchError::DeleteMismatch {
                            line_number: cursor + 1,
                            expected: text.clone(),
                            actual: actual.map_or(END_OF_FILE, |l| l.text).to_string(),
                        });
                    }
                    cursor += 1;
                    offset -= 1;
                }
                HunkLine::Add(text) => {
                    out.push(SourceLine {
                        text: text.as_str(),
                        ending: terminator,
                    });
                    offset += 1;
                }
            }
        }

        // With an explicit marker at end of file the updated side decides.
        if cursor == source.len() && hunk.marks_end_of_file() {
            final_newline = !hunk.new_missing_newline;
        }
        tracing::trace!(hunk = idx + 1, offset, "hunk verified");
    }

    out.extend_from_slice(&source[cursor..]);

    let mut result = String::with_capacity(original.len());
    let last = out.len().saturating_sub(1);
    for (idx, line) in out.iter().enumerate() {
        result.push_str(line.text);
        let ending = if line.ending.is_empty() { terminator } else { line.ending };
        if idx < last || final_newline {
            result.push_str(ending);
        }
    }
    Ok(result)
}

fn first_old_line(hunk: &Hunk) -> Option<&str> {
    hunk.lines.iter().find_map(|l| match l {
        HunkLine::Context(t) | HunkLine::Delete(t) => Some(t.as_str()),
        HunkLine::Add(_) => None,
    })
}
