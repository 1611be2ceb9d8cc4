//! Typed error hierarchy for sweteam.
//!
//! One enum per subsystem:
//! - `IssueError`: issue board reads and writes
//! - `PatchError`: unified diff parsing and application
//! - `DispatchError`: worker run lifecycle failures
//! - `ConfigError`: configuration values that cannot be used

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::worker::run::RunState;

/// Errors from the issue store.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("Issue {issue} not found")]
    NotFound { issue: String },

    #[error(
        "Issue {issue} is already completed. Create a new sub issue if additional work is needed"
    )]
    Conflict { issue: String },

    #[error("Assignee {assignee} is not a valid worker, assign to one of: {}", roster.join(", "))]
    InvalidAssignee {
        assignee: String,
        roster: Vec<String>,
    },

    #[error("Invalid issue path '{0}': expected slash separated positive integers")]
    InvalidPath(String),

    #[error("Failed to decode issue record at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Issue board I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IssueError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from the patch engine.
///
/// Every variant except `Io` means the diff itself is malformed or does not
/// match the file. Callers should re-read the file and regenerate the diff
/// rather than retry.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Invalid hunk header: '{line}'")]
    InvalidHunkHeader { line: String },

    #[error("Unexpected diff line {line_number}: '{line}'. Use strict unified diff syntax")]
    UnexpectedLine { line_number: usize, line: String },

    #[error(
        "Can't find expected context, original line #{line_number} is '{actual}' but the hunk expects '{expected}'. Read the file again and recreate the diff"
    )]
    ContextMismatch {
        line_number: usize,
        expected: String,
        actual: String,
    },

    #[error(
        "Can't delete, original line #{line_number} is '{actual}' but the hunk deletes '{expected}'. Read the file again and recreate the diff"
    )]
    DeleteMismatch {
        line_number: usize,
        expected: String,
        actual: String,
    },

    #[error(
        "Hunk {hunk} declares {declared_old} original and {declared_new} updated lines, but its body covers {actual_old} original and {actual_new} updated lines"
    )]
    CountMismatch {
        hunk: usize,
        declared_old: usize,
        declared_new: usize,
        actual_old: usize,
        actual_new: usize,
    },

    #[error("Hunk {hunk} starts at original line {start}, before the end of the previous hunk")]
    HunkOutOfOrder { hunk: usize, start: usize },

    #[error("Patch I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PatchError {
    /// True when the diff is malformed or stale, as opposed to an I/O failure.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Self::Io { .. })
    }
}

/// Errors from driving a worker run.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Run {run_id} expired")]
    RunExpired { run_id: String },

    #[error("Run {run_id} failed: {reason}")]
    RunFailed { run_id: String, reason: String },

    #[error("Rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("Function {name} not a configured tool.")]
    ToolNotConfigured { name: String },

    #[error("Worker {worker} still has an active run after waiting {}s", waited.as_secs())]
    WorkerBusy { worker: String, waited: Duration },

    #[error("Worker {0} is not registered")]
    UnknownWorker(String),

    #[error("Retries exhausted, last run state {state}")]
    RetriesExhausted { state: RunState },

    #[error("Backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must contain only alphanumeric characters, '_' or '-', got '{value}'")]
    InvalidName { field: &'static str, value: String },

    #[error("{field} must be an integer, got '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_error_conflict_names_issue() {
        let err = IssueError::Conflict {
            issue: "12/3".to_string(),
        };
        assert!(err.to_string().contains("12/3"));
        assert!(err.to_string().contains("new sub issue"));
    }

    #[test]
    fn issue_error_invalid_assignee_lists_roster() {
        let err = IssueError::InvalidAssignee {
            assignee: "ghost".into(),
            roster: vec!["pm".into(), "architect".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("ghost"));
        assert!(msg.contains("pm, architect"));
    }

    #[test]
    fn patch_error_io_is_not_malformed() {
        let io = PatchError::Io {
            path: PathBuf::from("a.txt"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!io.is_malformed());
        let header = PatchError::InvalidHunkHeader {
            line: "@@ nope @@".into(),
        };
        assert!(header.is_malformed());
    }

    #[test]
    fn dispatch_error_tool_not_configured_message() {
        let err = DispatchError::ToolNotConfigured {
            name: "rm_rf".into(),
        };
        assert_eq!(err.to_string(), "Function rm_rf not a configured tool.");
    }

    #[test]
    fn dispatch_error_rate_limited_reports_seconds() {
        let err = DispatchError::RateLimited {
            retry_after: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&IssueError::InvalidPath("x".into()));
        assert_std_error(&PatchError::HunkOutOfOrder { hunk: 2, start: 1 });
        assert_std_error(&DispatchError::UnknownWorker("x".into()));
        assert_std_error(&ConfigError::InvalidNumber {
            field: "retry_count",
            value: "x".into(),
        });
    }
}
