//! Workers: the capability interface, the registry, and the run dispatch
//! machinery behind it.

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod feedback;
pub mod http;
pub mod run;
pub mod tools;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::issues::IssuePath;

pub use backend::{RunBackend, RunRequest, StructuredRequest, ToolOutput};
pub use config::{WorkerConfig, default_roster, meta_worker};
pub use dispatch::{DispatchSettings, DispatchedWorker};
pub use feedback::FeedbackLog;
pub use run::{RunState, Step, next_step};
pub use tools::{ToolEnv, ToolScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation message returned with a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Worker that wrote the message, or the requesting party for user
    /// messages.
    pub author: String,
    pub content: String,
}

/// Extra context for a dispatched task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskContext {
    pub issue: Option<IssuePath>,
    pub notes: BTreeMap<String, String>,
}

impl TaskContext {
    pub fn for_issue(issue: IssuePath) -> Self {
        Self {
            issue: Some(issue),
            notes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    /// Retries exhausted or the task could not start. `state` is the last
    /// run state observed, if any run was started.
    Failed {
        state: Option<RunState>,
        reason: String,
    },
}

/// Result of [`Worker::perform_task`]. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReply {
    pub worker: String,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
    /// New messages after the prompt, oldest first.
    pub messages: Vec<Message>,
}

impl TaskReply {
    pub fn completed(worker: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            worker: worker.into(),
            outcome: TaskOutcome::Completed,
            messages,
        }
    }

    pub fn failed(worker: impl Into<String>, state: Option<RunState>, reason: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            outcome: TaskOutcome::Failed {
                state,
                reason: reason.into(),
            },
            messages: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Completed)
    }

    /// Reply text: the message contents joined by blank lines, or the
    /// failure reason.
    pub fn text(&self) -> String {
        match &self.outcome {
            TaskOutcome::Completed => self
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
            TaskOutcome::Failed { state, reason } => match state {
                Some(state) => format!("{} failed ({}): {}", self.worker, state, reason),
                None => format!("{} failed: {}", self.worker, reason),
            },
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.text()))
    }
}

/// A worker that accepts a task prompt and returns a reply.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    /// Drive one task to a terminal state. `from` names the requesting party.
    async fn perform_task(&self, prompt: &str, from: &str, context: &TaskContext) -> TaskReply;

    /// One structured completion constrained to `request.schema`.
    async fn evaluate(&self, request: &StructuredRequest) -> Result<Value>;
}

/// Mapping from worker name to handle, owned by the process.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<BTreeMap<String, Arc<dyn Worker>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker: Arc<dyn Worker>) {
        let name = worker.name().to_string();
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        if workers.insert(name.clone(), worker).is_some() {
            tracing::warn!(worker = %name, "replaced registered worker");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Worker names an issue may be assigned to.
    pub fn assignable(&self, exclude: &str) -> Vec<String> {
        self.names().into_iter().filter(|n| n != exclude).collect()
    }
}
