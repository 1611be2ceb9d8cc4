//! Lenient parsing of issue content supplied by workers and the CLI.
//!
//! Content may arrive as a JSON object (possibly with raw newlines inside
//! string values), a YAML mapping, or plain text. Known keys map onto record
//! fields; anything else is folded into `details`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::model::Status;

const TITLE_CHARS: usize = 24;

/// Content for a new issue. Unset fields get defaults at creation time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
    pub status: Option<Status>,
    pub priority: Option<String>,
    pub assignee: Option<String>,
    pub details: Option<Value>,
}

/// Content for one appended update. Unset timestamps and authors get defaults
/// at write time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDraft {
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
    pub status: Option<Status>,
    pub priority: Option<String>,
    pub assignee: Option<String>,
    pub details: Option<Value>,
}

impl NewIssue {
    pub fn titled(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    /// Parse worker or CLI supplied content for a new issue.
    pub fn parse(content: &str) -> Self {
        match parse_mapping(content) {
            Some(map) if has_any(&map, &["title", "description"]) => Self::from_map(map),
            _ => {
                let text = content.trim();
                Self::titled(text.chars().take(TITLE_CHARS).collect::<String>(), text)
            }
        }
    }

    pub fn from_map(mut map: Map<String, Value>) -> Self {
        let mut issue = Self {
            title: take_string(&mut map, "title").unwrap_or_default(),
            description: take_string(&mut map, "description").unwrap_or_default(),
            created_at: take_string(&mut map, "created_at").and_then(|s| parse_timestamp(&s)),
            updated_by: take_string(&mut map, "updated_by"),
            status: take_string(&mut map, "status").map(Status::from),
            priority: take_string(&mut map, "priority"),
            assignee: take_string(&mut map, "assignee"),
            details: map.remove("details"),
        };
        issue.details = fold_extra(issue.details.take(), map);
        issue
    }
}

impl UpdateDraft {
    /// Parse worker or CLI supplied content for an update. Plain text becomes
    /// the update's details.
    pub fn parse(content: &str) -> Self {
        match parse_mapping(content) {
            Some(map) if has_any(&map, UPDATE_KEYS) => Self::from_map(map),
            _ => {
                let text = content.trim();
                Self {
                    details: (!text.is_empty()).then(|| Value::String(text.to_string())),
                    ..Self::default()
                }
            }
        }
    }

    pub fn from_map(mut map: Map<String, Value>) -> Self {
        let mut draft = Self {
            updated_at: take_string(&mut map, "updated_at").and_then(|s| parse_timestamp(&s)),
            updated_by: take_string(&mut map, "updated_by"),
            status: take_string(&mut map, "status").map(Status::from),
            priority: take_string(&mut map, "priority"),
            assignee: take_string(&mut map, "assignee"),
            details: map.remove("details"),
        };
        // Fields that only make sense on creation are kept as details.
        draft.details = fold_extra(draft.details.take(), map);
        draft
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.priority.is_none()
            && self.assignee.is_none()
            && self.details.is_none()
    }
}

/// Try JSON, JSON with raw newlines repaired, then a YAML mapping.
pub fn parse_mapping(content: &str) -> Option<Map<String, Value>> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return Some(lowercase_keys(map));
    }
    if trimmed.starts_with('{') {
        let repaired = escape_raw_control_chars(trimmed);
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&repaired) {
            return Some(lowercase_keys(map));
        }
    }
    match serde_yaml::from_str::<serde_yaml::Value>(trimmed) {
        Ok(yaml @ serde_yaml::Value::Mapping(_)) => match serde_json::to_value(yaml) {
            Ok(Value::Object(map)) => Some(lowercase_keys(map)),
            _ => None,
        },
        _ => None,
    }
}

fn lowercase_keys(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(k, v)| (k.trim().to_lowercase(), v))
        .collect()
}

/// Escape newlines, carriage returns and tabs that appear inside JSON string
/// literals.
fn escape_raw_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(ch),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }
    out
}

const UPDATE_KEYS: &[&str] = &[
    "updated_at",
    "updated_by",
    "status",
    "priority",
    "assignee",
    "details",
];

/// Text such as "Note: see above" parses as YAML; only treat it as
/// structured when a known field is present.
fn has_any(map: &Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter().any(|k| map.contains_key(*k))
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn fold_extra(details: Option<Value>, extra: Map<String, Value>) -> Option<Value> {
    if extra.is_empty() {
        return details;
    }
    let mut merged = Map::new();
    match details {
        Some(Value::Object(existing)) => merged.extend(existing),
        Some(other) => {
            merged.insert("details".to_string(), other);
        }
        None => {}
    }
    merged.extend(extra);
    Some(Value::Object(merged))
}

/// RFC 3339, or a naive local `YYYY-MM-DDTHH:MM:SS[.fff]` read as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}
