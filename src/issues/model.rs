//! Issue board data model: paths, statuses, priorities, records and views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::IssueError;

/// Slash separated path of positive integers. The empty path is the board root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IssuePath(Vec<u32>);

impl IssuePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    pub fn child(&self, number: u32) -> Self {
        let mut segments = self.0.clone();
        segments.push(number);
        Self(segments)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// This path followed by each of its non-root ancestors, closest first.
    pub fn lineage(&self) -> Vec<Self> {
        (1..=self.0.len())
            .rev()
            .map(|n| Self(self.0[..n].to_vec()))
            .collect()
    }

    pub fn is_descendant_of(&self, other: &Self) -> bool {
        self.0.len() > other.0.len() && self.0.starts_with(&other.0)
    }

    /// Directory holding this issue's record and its sub-issues.
    pub fn dir(&self, board: &Path) -> PathBuf {
        let mut dir = board.to_path_buf();
        for seg in &self.0 {
            dir.push(seg.to_string());
        }
        dir
    }

    /// Record file, e.g. `12/3` -> `<board>/12/3/12.3.json`.
    pub fn record_file(&self, board: &Path) -> PathBuf {
        self.dir(board).join(format!("{}.json", self.dotted()))
    }

    pub fn dotted(&self) -> String {
        self.join(".")
    }

    fn join(&self, sep: &str) -> String {
        self.0
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(sep)
    }
}

impl FromStr for IssuePath {
    type Err = IssueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        trimmed
            .split('/')
            .map(|seg| match seg.trim().parse::<u32>() {
                Ok(n) if n > 0 => Ok(n),
                _ => Err(IssueError::InvalidPath(s.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl fmt::Display for IssuePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.join("/"))
    }
}

/// Resolved issue status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    New,
    InProgress,
    Open,
    Completed,
    Other(String),
}

impl Status {
    /// Statuses the scheduler picks work from.
    pub const OPEN: [Status; 3] = [Status::New, Status::InProgress, Status::Open];

    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "new",
            Self::InProgress => "in progress",
            Self::Open => "open",
            Self::Completed => "completed",
            Self::Other(s) => s,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::New | Self::InProgress | Self::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub(crate) fn decode_error() -> Self {
        Self::Other("Error Decoding".to_string())
    }
}

impl From<String> for Status {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "new" => Self::New,
            "in progress" | "in process" | "in_progress" => Self::InProgress,
            "open" => Self::Open,
            "completed" => Self::Completed,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for Status {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Status> for String {
    fn from(value: Status) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_PRIORITY: &str = "4 - Low";
pub const UNKNOWN: &str = "unknown";

const PRIORITY_WORDS: &[(&str, u8, &str)] = &[
    ("urgent", 0, "Urgent"),
    ("critical", 1, "Critical"),
    ("high", 2, "High"),
    ("medium", 3, "Medium"),
    ("low", 4, "Low"),
];

/// Rank used for sorting: the numeric prefix of `"N - Label"`, the rank of a
/// bare priority word, or 5 when neither applies.
pub fn priority_rank(priority: &str) -> u8 {
    let trimmed = priority.trim();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if let Ok(n) = digits.parse::<u8>() {
        return n;
    }
    let lower = trimmed.to_lowercase();
    PRIORITY_WORDS
        .iter()
        .find(|(word, _, _)| *word == lower)
        .map(|(_, rank, _)| *rank)
        .unwrap_or(5)
}

/// Rewrite bare priority words into the `"N - Label"` form.
pub fn normalize_priority(priority: &str) -> String {
    let lower = priority.trim().to_lowercase();
    match PRIORITY_WORDS.iter().find(|(word, _, _)| *word == lower) {
        Some((_, rank, label)) => format!("{} - {}", rank, label),
        None => priority.to_string(),
    }
}

/// One immutable entry in an issue's update log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub updated_at: DateTime<Utc>,
    #[serde(default = "unknown")]
    pub updated_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

/// On-disk issue record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updates: Vec<Update>,
}

/// Fields derived from the update log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueView {
    pub status: Status,
    pub priority: String,
    pub assignee: String,
    pub updated_by: String,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

impl IssueRecord {
    /// Resolve each field from the most recent update that defines it.
    pub fn view(&self) -> IssueView {
        let mut ordered: Vec<&Update> = self.updates.iter().collect();
        // Stable: equal timestamps keep log order.
        ordered.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));

        let status = ordered
            .iter()
            .rev()
            .find_map(|u| u.status.clone())
            .unwrap_or(Status::New);
        let priority = ordered
            .iter()
            .rev()
            .find_map(|u| non_empty(u.priority.as_deref()))
            .unwrap_or(DEFAULT_PRIORITY)
            .to_string();
        let updated_by = ordered
            .iter()
            .rev()
            .find_map(|u| non_empty(Some(u.updated_by.as_str())))
            .unwrap_or(UNKNOWN)
            .to_string();
        let assignee = ordered
            .iter()
            .rev()
            .find_map(|u| non_empty(u.assignee.as_deref()))
            .map(str::to_string)
            .unwrap_or_else(|| updated_by.clone());

        IssueView {
            status,
            priority,
            assignee,
            updated_by,
        }
    }

    /// Most recent update by timestamp.
    pub fn last_update(&self) -> Option<&Update> {
        self.updates
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| match a.updated_at.cmp(&b.updated_at) {
                Ordering::Equal => ia.cmp(ib),
                other => other,
            })
            .map(|(_, u)| u)
    }
}

/// One row of an issue listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueSummary {
    pub issue: String,
    pub priority: String,
    pub status: Status,
    pub assignee: String,
    pub title: String,
}

impl IssueSummary {
    /// Key for the board ordering: priority rank, then numeric path.
    pub fn sort_key(&self) -> (u8, Vec<u32>) {
        let path = self
            .issue
            .parse::<IssuePath>()
            .map(|p| p.segments().to_vec())
            .unwrap_or_default();
        (priority_rank(&self.priority), path)
    }
}

/// Sort by priority rank, then by the numeric tuple of the path.
pub fn sort_summaries(summaries: &mut [IssueSummary]) {
    summaries.sort_by_cached_key(IssueSummary::sort_key);
}

/// A record together with its resolved view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueDetail {
    pub issue: String,
    #[serde(flatten)]
    pub record: IssueRecord,
    pub status: Status,
    pub priority: String,
    pub assignee: String,
    pub updated_by: String,
}

impl IssueDetail {
    pub fn new(path: &IssuePath, record: IssueRecord) -> Self {
        let view = record.view();
        Self {
            issue: path.to_string(),
            record,
            status: view.status,
            priority: view.priority,
            assignee: view.assignee,
            updated_by: view.updated_by,
        }
    }

    /// Title, description and the last update's details, for stage inference
    /// and prompts.
    pub fn latest_text(&self) -> String {
        let mut text = format!("{}\n{}", self.record.title, self.record.description);
        if let Some(details) = self.record.last_update().and_then(|u| u.details.as_ref()) {
            text.push('\n');
            match details {
                serde_json::Value::String(s) => text.push_str(s),
                other => text.push_str(&other.to_string()),
            }
        }
        text
    }
}
