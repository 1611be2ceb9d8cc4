//! Hierarchical issue board.
//!
//! Issues are addressed by slash separated numeric paths and carry an
//! append-only update log; status, priority and assignee are resolved from
//! that log on every read.

pub mod content;
pub mod model;
pub mod store;

pub use content::{NewIssue, UpdateDraft};
pub use model::{
    IssueDetail, IssuePath, IssueRecord, IssueSummary, IssueView, Status, Update, priority_rank,
};
pub use store::{IssueStore, ListFilter};
