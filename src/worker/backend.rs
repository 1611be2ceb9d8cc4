//! The remote run backend a dispatched worker talks to.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::Message;
use super::run::RunSnapshot;
use crate::issues::IssuePath;

/// Parameters for starting a run on a thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRequest {
    pub worker: String,
    pub instructions: String,
    pub additional_instructions: Option<String>,
    pub model: Option<String>,
    pub temperature: f32,
    /// JSON function schemas for the worker's declared tools.
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// A completion whose reply must match `schema`.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredRequest {
    pub model: Option<String>,
    pub system: String,
    pub prompt: String,
    pub schema_name: String,
    pub schema: Value,
}

#[async_trait]
pub trait RunBackend: Send + Sync {
    /// Open a conversation thread for `worker`, optionally tied to an issue.
    async fn create_thread(&self, worker: &str, issue: Option<&IssuePath>) -> Result<String>;

    /// Append a user message; returns the message id.
    async fn post_message(&self, thread: &str, content: &str) -> Result<String>;

    async fn start_run(&self, thread: &str, request: &RunRequest) -> Result<RunSnapshot>;

    async fn poll_run(&self, thread: &str, run: &str) -> Result<RunSnapshot>;

    /// Runs on `thread` still in an active state.
    async fn active_runs(&self, thread: &str) -> Result<Vec<RunSnapshot>>;

    async fn submit_tool_outputs(&self, thread: &str, run: &str, outputs: &[ToolOutput]) -> Result<RunSnapshot>;

    /// Messages added after `message_id`, oldest first, excluding it.
    async fn messages_since(&self, thread: &str, message_id: &str) -> Result<Vec<Message>>;

    async fn structured_completion(&self, request: &StructuredRequest) -> Result<Value>;
}
