//! Pulling code out of worker replies: fenced code blocks and unified diffs.

use regex::Regex;
use std::sync::LazyLock;

use crate::patch::HunkHeader;

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?ms)^[ \t]*```([^\n`]*)\n(.*?)^[ \t]*```[ \t]*$").expect("valid fence regex"));

static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z0-9_][A-Za-z0-9_./-]*\.[A-Za-z0-9]+)").expect("valid path regex"));

const DIFF_LANGUAGES: &[&str] = &["diff", "patch", "udiff"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: Option<String>,
    /// Target file named in the fence info string or on the line above it.
    pub filename: Option<String>,
    pub content: String,
}

impl CodeBlock {
    pub fn is_diff(&self) -> bool {
        self.language
            .as_deref()
            .is_some_and(|l| DIFF_LANGUAGES.contains(&l))
            || looks_like_diff(&self.content)
    }
}

/// Hunks for one file, taken from a diff in a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub hunks: String,
}

fn looks_like_diff(text: &str) -> bool {
    text.lines().any(|l| l.starts_with("@@ -"))
}

fn path_in(text: &str) -> Option<String> {
    PATH_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
        .find(|p| p.contains('.') && !p.starts_with('.'))
}

/// All fenced code blocks, in order.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let info = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let content = caps.get(2).map(|m| m.as_str()).unwrap_or_default().to_string();

            let mut tokens = info.split_whitespace();
            let first = tokens.next();
            let (language, mut filename) = match first {
                Some(tok) if tok.contains('.') || tok.contains('/') => (None, Some(tok.to_string())),
                Some(tok) => (Some(tok.to_lowercase()), tokens.next().map(str::to_string)),
                None => (None, None),
            };
            if filename.is_none() {
                let before = &text[..whole.start()];
                filename = before
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .and_then(path_in);
            }
            Some(CodeBlock {
                language,
                filename,
                content,
            })
        })
        .collect()
}

/// Unified diffs in the reply, split per target file. Diffs are read from
/// diff fences, or from the whole reply when it has no fences.
pub fn extract_diffs(text: &str) -> Vec<FileDiff> {
    let blocks = extract_code_blocks(text);
    let mut diffs = Vec::new();
    if blocks.is_empty() {
        if looks_like_diff(text) {
            diffs.extend(split_diff(text, None));
        }
        return diffs;
    }
    for block in blocks.iter().filter(|b| b.is_diff()) {
        diffs.extend(split_diff(&block.content, block.filename.as_deref()));
    }
    diffs
}

/// Split diff text at `---`/`+++` header pairs. Hunks before any header are
/// attributed to `default_path`.
fn split_diff(text: &str, default_path: Option<&str>) -> Vec<FileDiff> {
    let lines: Vec<&str> = text.lines().collect();
    let mut diffs: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileDiff> = default_path.map(|p| FileDiff {
        path: p.to_string(),
        hunks: String::new(),
    });
    let mut in_hunks = false;
    // Lines the current hunk still declares, (old, new).
    let mut open = (0usize, 0usize);

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let next = lines.get(i + 1).copied().unwrap_or_default();
        let hunk_open = open != (0, 0);
        if !hunk_open && line.starts_with("--- ") && next.starts_with("+++ ") {
            if let Some(done) = current.take().filter(|d| !d.hunks.is_empty()) {
                diffs.push(done);
            }
            current = Some(FileDiff {
                path: header_path(next),
                hunks: String::new(),
            });
            in_hunks = false;
            i += 2;
            continue;
        }
        if line.starts_with("@@") {
            in_hunks = true;
            open = HunkHeader::parse(line).map_or((0, 0), |h| (h.old_count, h.new_count));
        } else if hunk_open {
            open = match line.as_bytes().first() {
                Some(b'-') => (open.0.saturating_sub(1), open.1),
                Some(b'+') => (open.0, open.1.saturating_sub(1)),
                Some(b'\\') => open,
                _ => (open.0.saturating_sub(1), open.1.saturating_sub(1)),
            };
        }
        if in_hunks && let Some(diff) = current.as_mut() {
            diff.hunks.push_str(line);
            diff.hunks.push('\n');
        }
        i += 1;
    }
    if let Some(done) = current.filter(|d| !d.hunks.is_empty()) {
        diffs.push(done);
    }
    diffs
}

fn header_path(line: &str) -> String {
    let path = line.trim_start_matches("+++ ").trim();
    // drop a trailing timestamp
    let path = path.split('\t').next().unwrap_or(path).trim();
    path.strip_prefix("b/").unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_blocks_with_filenames() {
        let reply = "Here is the server:\n\n**app/main.py**\n```python\nprint('hi')\n```\n\nAnd config:\n```yaml config.yaml\nport: 80\n```\n```\nno name here\n```\n";
        let blocks = extract_code_blocks(reply);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].language.as_deref(), Some("python"));
        assert_eq!(blocks[0].filename.as_deref(), Some("app/main.py"));
        assert_eq!(blocks[0].content, "print('hi')\n");
        assert_eq!(blocks[1].filename.as_deref(), Some("config.yaml"));
        assert_eq!(blocks[2].filename, None);
    }

    #[test]
    fn test_info_string_path_only() {
        let blocks = extract_code_blocks("```src/lib.rs\npub fn f() {}\n```\n");
        assert_eq!(blocks[0].language, None);
        assert_eq!(blocks[0].filename.as_deref(), Some("src/lib.rs"));
    }

    #[test]
    fn test_diff_fence_with_headers() {
        let reply = "Patch:\n```diff\n--- a/app.py\n+++ b/app.py\n@@ -1,1 +1,1 @@\n-print(1)\n+print(2)\n--- a/util.py\n+++ b/util.py\n@@ -0,0 +1,1 @@\n+X = 1\n```\n";
        let diffs = extract_diffs(reply);
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].path, "app.py");
        assert_eq!(diffs[0].hunks, "@@ -1,1 +1,1 @@\n-print(1)\n+print(2)\n");
        assert_eq!(diffs[1].path, "util.py");
    }

    #[test]
    fn test_body_lines_that_look_like_headers_stay_in_hunk() {
        // Replacing the line "-- x" with "++ y".
        let reply = "```diff\n--- a/notes.md\n+++ b/notes.md\n@@ -1,2 +1,2 @@\n--- x\n+++ y\n keep\n```\n";
        let diffs = extract_diffs(reply);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "notes.md");
        assert_eq!(diffs[0].hunks, "@@ -1,2 +1,2 @@\n--- x\n+++ y\n keep\n");
    }

    #[test]
    fn test_headerless_diff_uses_named_file() {
        let reply = "Update `app.py`:\n```diff\n@@ -1 +1 @@\n-a\n+b\n```\n";
        let diffs = extract_diffs(reply);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "app.py");
    }

    #[test]
    fn test_bare_diff_without_fences() {
        let reply = "--- a/x.txt\n+++ b/x.txt\n@@ -1 +1 @@\n-old\n+new\n";
        let diffs = extract_diffs(reply);
        assert_eq!(diffs[0].path, "x.txt");
        assert_eq!(diffs[0].hunks, "@@ -1 +1 @@\n-old\n+new\n");
    }

    #[test]
    fn test_plain_code_is_not_a_diff() {
        let reply = "```python main.py\nprint('x')\n```\n";
        assert!(extract_diffs(reply).is_empty());
        assert!(!extract_code_blocks(reply)[0].is_diff());
    }
}
