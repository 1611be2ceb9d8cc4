//! File-backed issue board.
//!
//! Every issue lives in a directory mirroring its path, holding one JSON
//! record named after the dotted path (`12/3` -> `12/3/12.3.json`). The
//! update log is read-modify-append, so writers take an exclusive `fs2`
//! lock: creation locks the parent directory, updates lock the record.

use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::content::{NewIssue, UpdateDraft};
use super::model::{
    DEFAULT_PRIORITY, IssueDetail, IssuePath, IssueRecord, IssueSummary, Status, Update,
    normalize_priority, sort_summaries,
};
use crate::errors::IssueError;
use crate::util::write_atomic;

/// Filters for [`IssueStore::list`]. Empty filters match everything.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub statuses: Vec<Status>,
    pub assignee: Option<String>,
}

impl ListFilter {
    pub fn open() -> Self {
        Self {
            statuses: Status::OPEN.to_vec(),
            assignee: None,
        }
    }

    pub fn with_statuses(statuses: Vec<Status>) -> Self {
        Self {
            statuses,
            assignee: None,
        }
    }

    fn matches(&self, status: &Status, assignee: &str) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(status))
            && self.assignee.as_deref().is_none_or(|a| a == assignee)
    }
}

/// Held for the duration of a read-modify-write; released on drop.
struct BoardLock {
    file: File,
}

impl BoardLock {
    fn acquire(path: &Path) -> Result<Self, IssueError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| IssueError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| IssueError::io(path, e))?;
        file.lock_exclusive().map_err(|e| IssueError::io(path, e))?;
        Ok(Self { file })
    }
}

impl Drop for BoardLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct IssueStore {
    root: PathBuf,
}

impl IssueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List issues under `root_path` (inclusive), sorted by priority rank
    /// then numeric path. Undecodable records are reported with status
    /// "Error Decoding" instead of failing the listing.
    pub fn list(&self, root_path: &str, filter: &ListFilter) -> Result<Vec<IssueSummary>, IssueError> {
        let base = root_path.parse::<IssuePath>()?;
        let dir = base.dir(&self.root);
        if !dir.is_dir() {
            if base.is_root() {
                return Ok(Vec::new());
            }
            return Err(IssueError::NotFound {
                issue: base.to_string(),
            });
        }

        let mut summaries = Vec::new();
        for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = self.issue_for_record(entry.path()) else {
                continue;
            };

            match read_record(entry.path()) {
                Ok(record) => {
                    let view = record.view();
                    if !filter.matches(&view.status, &view.assignee) {
                        continue;
                    }
                    summaries.push(IssueSummary {
                        issue: path.to_string(),
                        priority: normalize_priority(&view.priority),
                        status: view.status,
                        assignee: view.assignee,
                        title: record.title,
                    });
                }
                Err(e) => {
                    tracing::warn!(issue = %path, error = %e, "undecodable issue record");
                    let status = Status::decode_error();
                    if !filter.matches(&status, "") {
                        continue;
                    }
                    summaries.push(IssueSummary {
                        issue: path.to_string(),
                        priority: String::new(),
                        status,
                        assignee: String::new(),
                        title: String::new(),
                    });
                }
            }
        }

        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    /// Create a sub-issue under `parent` (or a root issue when empty) and
    /// return its path. Numbers are `max(existing) + 1` within the parent.
    pub fn create(&self, parent: &str, issue: NewIssue, creator: &str) -> Result<IssuePath, IssueError> {
        let parent = parent.parse::<IssuePath>()?;
        let parent_dir = parent.dir(&self.root);
        if !parent.is_root() && !parent.record_file(&self.root).is_file() {
            return Err(IssueError::NotFound {
                issue: parent.to_string(),
            });
        }

        let _lock = BoardLock::acquire(&parent_dir.join(".create.lock"))?;
        let next = next_child_number(&parent_dir)?;
        let path = parent.child(next);

        let now = Utc::now();
        let updated_by = issue
            .updated_by
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| creator.to_string());
        let assignee = issue
            .assignee
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| updated_by.clone());
        let record = IssueRecord {
            title: issue.title,
            description: issue.description,
            created_at: issue.created_at.unwrap_or(now),
            updates: vec![Update {
                updated_at: now,
                updated_by,
                status: Some(issue.status.unwrap_or(Status::New)),
                priority: Some(
                    issue
                        .priority
                        .filter(|s| !s.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_PRIORITY.to_string()),
                ),
                assignee: Some(assignee),
                details: issue.details,
            }],
        };

        write_record(&path.record_file(&self.root), &record)?;
        tracing::info!(issue = %path, creator, title = %record.title, "created issue");
        Ok(path)
    }

    /// Read a record with its resolved views.
    pub fn read(&self, issue: &str) -> Result<IssueDetail, IssueError> {
        let path = parse_issue(issue)?;
        let record = self.load(&path)?;
        Ok(IssueDetail::new(&path, record))
    }

    /// Append one update. Fails with `Conflict` once the issue is completed.
    pub fn update(&self, issue: &str, draft: UpdateDraft, caller: &str) -> Result<(), IssueError> {
        let path = parse_issue(issue)?;
        let file = path.record_file(&self.root);
        let _lock = BoardLock::acquire(&lock_file_for(&path, &self.root))?;

        let mut record = self.load(&path)?;
        if record.view().status.is_terminal() {
            return Err(IssueError::Conflict {
                issue: path.to_string(),
            });
        }

        let update = Update {
            updated_at: draft.updated_at.unwrap_or_else(Utc::now),
            updated_by: draft
                .updated_by
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| caller.to_string()),
            status: draft.status,
            priority: draft.priority,
            assignee: draft.assignee,
            details: draft.details,
        };
        tracing::debug!(issue = %path, updated_by = %update.updated_by, status = ?update.status, "appending update");
        record.updates.push(update);
        write_record(&file, &record)
    }

    /// Reassign an issue to a member of `roster`.
    pub fn assign(
        &self,
        issue: &str,
        assignee: &str,
        roster: &[String],
        caller: &str,
    ) -> Result<(), IssueError> {
        let assignee = assignee.trim();
        if !roster.iter().any(|r| r == assignee) {
            return Err(IssueError::InvalidAssignee {
                assignee: assignee.to_string(),
                roster: roster.to_vec(),
            });
        }
        let path = parse_issue(issue)?;
        self.update(
            issue,
            UpdateDraft {
                assignee: Some(assignee.to_string()),
                details: Some(serde_json::Value::String(format!(
                    "assign #{} to {}.",
                    path, assignee
                ))),
                ..UpdateDraft::default()
            },
            caller,
        )?;
        tracing::info!(issue = %path, assignee, caller, "reassigned issue");
        Ok(())
    }

    /// Direct children of `issue`, in numeric order.
    pub fn children(&self, issue: &IssuePath) -> Result<Vec<IssuePath>, IssueError> {
        let dir = issue.dir(&self.root);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut numbers = child_numbers(&dir)?;
        numbers.sort_unstable();
        Ok(numbers
            .into_iter()
            .map(|n| issue.child(n))
            .filter(|p| p.record_file(&self.root).is_file())
            .collect())
    }

    fn load(&self, path: &IssuePath) -> Result<IssueRecord, IssueError> {
        let file = path.record_file(&self.root);
        if !file.is_file() {
            return Err(IssueError::NotFound {
                issue: path.to_string(),
            });
        }
        read_record(&file)
    }

    /// Map a record file back to its issue path, if it is one.
    fn issue_for_record(&self, file: &Path) -> Option<IssuePath> {
        let rel = file.parent()?.strip_prefix(&self.root).ok()?;
        let segments = rel
            .components()
            .map(|c| c.as_os_str().to_str()?.parse::<u32>().ok().filter(|n| *n > 0))
            .collect::<Option<Vec<u32>>>()?;
        if segments.is_empty() {
            return None;
        }
        let path = segments
            .iter()
            .fold(IssuePath::root(), |acc, n| acc.child(*n));
        let expected = format!("{}.json", path.dotted());
        (file.file_name()?.to_str()? == expected).then_some(path)
    }
}

fn parse_issue(issue: &str) -> Result<IssuePath, IssueError> {
    let path = issue.parse::<IssuePath>()?;
    if path.is_root() {
        return Err(IssueError::InvalidPath(issue.to_string()));
    }
    Ok(path)
}

fn lock_file_for(path: &IssuePath, root: &Path) -> PathBuf {
    path.dir(root).join(format!(".{}.lock", path.dotted()))
}

fn child_numbers(dir: &Path) -> Result<Vec<u32>, IssueError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(IssueError::io(dir, e)),
    };
    Ok(entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter(|n| *n > 0)
        .collect())
}

fn next_child_number(dir: &Path) -> Result<u32, IssueError> {
    Ok(child_numbers(dir)?.into_iter().max().unwrap_or(0) + 1)
}

fn read_record(file: &Path) -> Result<IssueRecord, IssueError> {
    let text = fs::read_to_string(file).map_err(|e| IssueError::io(file, e))?;
    serde_json::from_str(&text).map_err(|source| IssueError::Decode {
        path: file.to_path_buf(),
        source,
    })
}

fn write_record(file: &Path, record: &IssueRecord) -> Result<(), IssueError> {
    let json = serde_json::to_string_pretty(record).map_err(|source| IssueError::Decode {
        path: file.to_path_buf(),
        source,
    })?;
    write_atomic(file, json.as_bytes()).map_err(|e| IssueError::io(file, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::model::IssuePath;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn store() -> (TempDir, IssueStore) {
        let dir = tempdir().unwrap();
        let store = IssueStore::new(dir.path().join("issue_board"));
        (dir, store)
    }

    fn roster() -> Vec<String> {
        ["pm", "architect", "backend_dev"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_create_writes_record_with_defaults() {
        let (_dir, store) = store();
        let path = store
            .create("", NewIssue::titled("Bootstrap", "set up repo"), "orchestrator")
            .unwrap();
        assert_eq!(path.to_string(), "1");
        assert!(store.root().join("1/1.json").is_file());

        let detail = store.read("1").unwrap();
        assert_eq!(detail.status, Status::New);
        assert_eq!(detail.priority, "4 - Low");
        assert_eq!(detail.assignee, "orchestrator");
        assert_eq!(detail.updated_by, "orchestrator");
        assert_eq!(detail.record.updates.len(), 1);
    }

    #[test]
    fn test_sub_issue_numbering() {
        let (_dir, store) = store();
        let parent = store.create("", NewIssue::titled("p", ""), "pm").unwrap();
        let other = store.create("", NewIssue::titled("o", ""), "pm").unwrap();

        let a = store.create("1", NewIssue::titled("a", ""), "pm").unwrap();
        fs::remove_dir_all(other.dir(store.root())).unwrap();
        let b = store.create("1", NewIssue::titled("b", ""), "pm").unwrap();
        let c = store.create("1", NewIssue::titled("c", ""), "pm").unwrap();

        assert_eq!(parent.to_string(), "1");
        let names: Vec<String> = [a, b, c].iter().map(|p| p.to_string()).collect();
        assert_eq!(names, vec!["1/1", "1/2", "1/3"]);
        assert!(store.root().join("1/3/1.3.json").is_file());
    }

    #[test]
    fn test_create_under_missing_parent_fails() {
        let (_dir, store) = store();
        assert!(matches!(
            store.create("9", NewIssue::titled("x", ""), "pm"),
            Err(IssueError::NotFound { .. })
        ));
    }

    #[test]
    fn test_read_missing_issue() {
        let (_dir, store) = store();
        assert!(matches!(store.read("4/2"), Err(IssueError::NotFound { .. })));
        assert!(matches!(store.read(""), Err(IssueError::InvalidPath(_))));
    }

    #[test]
    fn test_update_status_and_priority_resolution() {
        let (_dir, store) = store();
        store.create("", NewIssue::titled("t", ""), "pm").unwrap();
        store
            .update("1", UpdateDraft::parse(r#"{"status": "in progress"}"#), "backend_dev")
            .unwrap();
        store
            .update("1", UpdateDraft::parse(r#"{"priority": "high"}"#), "architect")
            .unwrap();

        let detail = store.read("1").unwrap();
        assert_eq!(detail.status, Status::InProgress);
        assert_eq!(detail.priority, "high");
        assert_eq!(detail.updated_by, "architect");
        // Seeded assignee persists.
        assert_eq!(detail.assignee, "pm");
    }

    #[test]
    fn test_completed_issue_is_terminal() {
        let (_dir, store) = store();
        store.create("", NewIssue::titled("t", ""), "pm").unwrap();
        store
            .update("1", UpdateDraft::parse(r#"{"status": "completed"}"#), "pm")
            .unwrap();

        let err = store
            .update("1", UpdateDraft::parse("more work"), "pm")
            .unwrap_err();
        assert!(matches!(err, IssueError::Conflict { .. }));
        assert!(matches!(
            store.assign("1", "architect", &roster(), "pm"),
            Err(IssueError::Conflict { .. })
        ));

        let sub = store
            .create("1", NewIssue::titled("follow up", ""), "pm")
            .unwrap();
        assert_eq!(sub.to_string(), "1/1");
    }

    #[test]
    fn test_assign_validates_roster() {
        let (_dir, store) = store();
        store.create("", NewIssue::titled("t", ""), "pm").unwrap();
        match store.assign("1", "ghost", &roster(), "pm") {
            Err(IssueError::InvalidAssignee { assignee, roster }) => {
                assert_eq!(assignee, "ghost");
                assert_eq!(roster.len(), 3);
            }
            other => panic!("expected InvalidAssignee, got {:?}", other),
        }

        store.assign("1", "backend_dev", &roster(), "pm").unwrap();
        let detail = store.read("1").unwrap();
        assert_eq!(detail.assignee, "backend_dev");
        assert_eq!(detail.updated_by, "pm");
    }

    #[test]
    fn test_list_sorted_by_priority_then_path() {
        let (_dir, store) = store();
        let mut high = NewIssue::titled("one", "");
        high.priority = Some("2 - High".into());
        let mut critical = NewIssue::titled("two", "");
        critical.priority = Some("1 - Critical".into());
        store.create("", high, "pm").unwrap();
        store.create("", critical, "pm").unwrap();

        let issues: Vec<String> = store
            .list("", &ListFilter::default())
            .unwrap()
            .into_iter()
            .map(|s| s.issue)
            .collect();
        assert_eq!(issues, vec!["2", "1"]);
    }

    #[test]
    fn test_list_filters_status_and_normalizes_priority() {
        let (_dir, store) = store();
        let mut urgent = NewIssue::titled("a", "");
        urgent.priority = Some("urgent".into());
        store.create("", urgent, "pm").unwrap();
        store.create("", NewIssue::titled("b", ""), "pm").unwrap();
        store
            .update("2", UpdateDraft::parse(r#"{"status": "completed"}"#), "pm")
            .unwrap();
        store
            .update("1", UpdateDraft::parse(r#"{"status": "in process"}"#), "pm")
            .unwrap();

        let open = store.list("", &ListFilter::open()).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].issue, "1");
        assert_eq!(open[0].priority, "0 - Urgent");
        assert_eq!(open[0].status, Status::InProgress);

        let done = store
            .list("", &ListFilter::with_statuses(vec![Status::Completed]))
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].issue, "2");
    }

    #[test]
    fn test_list_subtree_and_assignee_filter() {
        let (_dir, store) = store();
        store.create("", NewIssue::titled("root", ""), "pm").unwrap();
        let mut sub = NewIssue::titled("sub", "");
        sub.assignee = Some("backend_dev".into());
        store.create("1", sub, "pm").unwrap();
        store.create("", NewIssue::titled("other", ""), "pm").unwrap();

        let subtree: Vec<String> = store
            .list("1", &ListFilter::default())
            .unwrap()
            .into_iter()
            .map(|s| s.issue)
            .collect();
        assert_eq!(subtree, vec!["1", "1/1"]);

        let filter = ListFilter {
            statuses: vec![],
            assignee: Some("backend_dev".into()),
        };
        let mine = store.list("", &filter).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].issue, "1/1");
    }

    #[test]
    fn test_list_reports_decode_errors() {
        let (_dir, store) = store();
        store.create("", NewIssue::titled("good", ""), "pm").unwrap();
        let bad = IssuePath::root().child(2).record_file(store.root());
        fs::create_dir_all(bad.parent().unwrap()).unwrap();
        fs::write(&bad, "{not json").unwrap();

        let all = store.list("", &ListFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        let broken = all.iter().find(|s| s.issue == "2").unwrap();
        assert_eq!(broken.status.as_str(), "Error Decoding");

        let open = store.list("", &ListFilter::open()).unwrap();
        let open: Vec<&str> = open.iter().map(|s| s.issue.as_str()).collect();
        assert_eq!(open, vec!["1"]);

        let errors = store
            .list("", &ListFilter::with_statuses(vec![Status::decode_error()]))
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].issue, "2");
    }

    #[test]
    fn test_list_ignores_stray_files() {
        let (_dir, store) = store();
        store.create("", NewIssue::titled("a", ""), "pm").unwrap();
        fs::write(store.root().join("1/notes.json"), json!({}).to_string()).unwrap();
        fs::write(store.root().join("README.md"), "board").unwrap();
        assert_eq!(store.list("", &ListFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_list_empty_board() {
        let (_dir, store) = store();
        assert!(store.list("", &ListFilter::default()).unwrap().is_empty());
        assert!(matches!(
            store.list("3", &ListFilter::default()),
            Err(IssueError::NotFound { .. })
        ));
    }

    #[test]
    fn test_children_lists_existing_sub_issues() {
        let (_dir, store) = store();
        let parent = store.create("", NewIssue::titled("p", ""), "pm").unwrap();
        store.create("1", NewIssue::titled("a", ""), "pm").unwrap();
        store.create("1", NewIssue::titled("b", ""), "pm").unwrap();
        let kids: Vec<String> = store
            .children(&parent)
            .unwrap()
            .iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(kids, vec!["1/1", "1/2"]);
    }

    #[test]
    fn test_concurrent_updates_are_all_recorded() {
        let (_dir, store) = store();
        store.create("", NewIssue::titled("t", ""), "pm").unwrap();
        std::thread::scope(|s| {
            for i in 0..8 {
                let store = store.clone();
                s.spawn(move || {
                    store
                        .update("1", UpdateDraft::parse(&format!("note {}", i)), "tester")
                        .unwrap();
                });
            }
        });
        assert_eq!(store.read("1").unwrap().record.updates.len(), 9);
    }
}
