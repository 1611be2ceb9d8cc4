//! Live scan of the project directory.

use anyhow::{Context, Result};
use regex::Regex;
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;
use walkdir::WalkDir;

use super::tree::{NodeKind, TreeNode};
use crate::util::truncate_chars;

/// Bytes read from the head of a file when looking for a description.
const HEAD_BYTES: u64 = 2048;
const MAX_DESCRIPTION_CHARS: usize = 120;

pub const DEFAULT_EXCLUDES: &[&str] = &[
    "node_modules",
    ".venv",
    ".git",
    "target",
    "__pycache__",
    ".pytest_cache",
    ".sweteam",
];

/// Files whose description stands in for their directory, in priority order.
const DIRECTORY_DESCRIPTION_FILES: &[&str] = &[
    "README.md",
    "__init__.py",
    "lib.rs",
    "mod.rs",
    "index.js",
    "index.ts",
    "Dockerfile",
    "docker-compose.yml",
    "docker-compose.yaml",
];

struct DescriptionRule {
    file_name: Regex,
    prefix: &'static str,
}

static DESCRIPTION_RULES: LazyLock<Vec<DescriptionRule>> = LazyLock::new(|| {
    [
        (r"^README\.md$", ""),
        (r"\.py$", "\"\"\""),
        (r"\.py$", "#"),
        (r"\.rs$", "//!"),
        (r"^Dockerfile$", "#"),
        (r"^docker-compose\.ya?ml$", ""),
        (r"\.toml$", "description"),
        (r"\.(js|ts)$", "/**"),
    ]
    .into_iter()
    .map(|(pattern, prefix)| DescriptionRule {
        file_name: Regex::new(pattern).expect("valid description rule regex"),
        prefix,
    })
    .collect()
});

/// Pull a one-line description from the head of a file using the first rule
/// that yields text.
pub fn extract_description(path: &Path) -> String {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return String::new();
    };
    let rules: Vec<&DescriptionRule> = DESCRIPTION_RULES
        .iter()
        .filter(|r| r.file_name.is_match(name))
        .collect();
    if rules.is_empty() {
        return String::new();
    }

    let head = match read_head(path) {
        Ok(head) => head,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "cannot read file head");
            return String::new();
        }
    };

    rules
        .iter()
        .find_map(|rule| describe_with(&head, rule.prefix))
        .map(|d| truncate_chars(&d, MAX_DESCRIPTION_CHARS))
        .unwrap_or_default()
}

fn read_head(path: &Path) -> std::io::Result<String> {
    let mut buf = Vec::new();
    std::fs::File::open(path)?
        .take(HEAD_BYTES)
        .read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// A line starting with `prefix` (or the line right after an empty one) is
/// the description once prefix, mirrored suffix and decoration are removed.
fn describe_with(head: &str, prefix: &str) -> Option<String> {
    let suffix: String = prefix.chars().rev().collect();
    let mut take_next = false;
    for line in head.lines() {
        let trimmed = line.trim();
        if !(take_next || trimmed.starts_with(prefix)) {
            continue;
        }
        let text = trimmed.strip_prefix(prefix).unwrap_or(trimmed);
        let text = text.strip_suffix(suffix.as_str()).unwrap_or(text);
        let text = text
            .trim_matches(|c: char| c.is_whitespace() || matches!(c, '#' | '*' | '=' | '"' | '\''))
            .to_string();
        if !text.is_empty() {
            return Some(text);
        }
        take_next = true;
    }
    None
}

/// Scan `root` into a node, skipping entries whose name matches `excludes`.
pub fn scan_directory(root: &Path, excludes: &[glob::Pattern]) -> Result<TreeNode> {
    let mut node = TreeNode::directory("");
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !excludes.iter().any(|p| p.matches(&name))
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", entry.path().display(), root.display()))?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let Some((name, parents)) = parts.split_last() else {
            continue;
        };

        let mut dir = &mut node;
        for part in parents {
            dir = dir
                .contents
                .entry(part.clone())
                .or_insert_with(|| TreeNode::directory(""));
        }

        let child = if entry.file_type().is_dir() {
            TreeNode::directory("")
        } else {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            TreeNode::file(extract_description(entry.path()), size)
        };
        dir.contents.entry(name.clone()).or_insert(child);
    }

    describe_directories(&mut node);
    Ok(node)
}

fn describe_directories(node: &mut TreeNode) {
    for child in node.contents.values_mut() {
        if child.kind() == NodeKind::Directory {
            describe_directories(child);
        }
    }

    let from_file = DIRECTORY_DESCRIPTION_FILES.iter().find_map(|name| {
        node.contents
            .get(*name)
            .filter(|n| n.kind() == NodeKind::File && !n.description.is_empty())
            .map(|n| n.description.clone())
    });
    node.description = match from_file {
        Some(desc) => format!("Directory for {}", desc),
        None => {
            let dirs = node
                .contents
                .values()
                .filter(|n| n.kind() == NodeKind::Directory)
                .count();
            let files = node.contents.len() - dirs;
            format!("Directory of {} directories and {} files.", dirs, files)
        }
    };
}

/// Compile exclude globs, ignoring invalid patterns with a warning.
pub fn compile_excludes(patterns: &[String]) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!(pattern = %p, error = %e, "ignoring invalid exclude pattern");
                None
            }
        })
        .collect()
}
