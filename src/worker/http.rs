//! `RunBackend` over an assistants-style REST API.
//!
//! Threads, messages and runs map one to one onto the API's objects. Each
//! worker gets one assistant, created on its first run; per-run overrides
//! carry the current instructions, tools and temperature.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::backend::{RunBackend, RunRequest, StructuredRequest, ToolOutput};
use super::run::{RunError, RunSnapshot, RunState, ToolCall};
use super::{Message, Role};
use crate::issues::IssuePath;
use crate::util::extract_json_object;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub api_base: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

pub struct AssistantsBackend {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    assistants: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ApiObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiSubmitToolOutputs {
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Deserialize)]
struct ApiRequiredAction {
    submit_tool_outputs: Option<ApiSubmitToolOutputs>,
}

#[derive(Debug, Deserialize)]
struct ApiLastError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiRun {
    id: String,
    status: String,
    #[serde(default)]
    required_action: Option<ApiRequiredAction>,
    #[serde(default)]
    last_error: Option<ApiLastError>,
}

#[derive(Debug, Deserialize)]
struct ApiText {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ApiContent {
    #[serde(default)]
    text: Option<ApiText>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    id: String,
    role: String,
    #[serde(default)]
    content: Vec<ApiContent>,
}

impl TryFrom<ApiRun> for RunSnapshot {
    type Error = anyhow::Error;

    fn try_from(run: ApiRun) -> Result<Self> {
        let state: RunState = run.status.parse().map_err(anyhow::Error::msg)?;
        let tool_calls = run
            .required_action
            .and_then(|a| a.submit_tool_outputs)
            .map(|s| {
                s.tool_calls
                    .into_iter()
                    .map(|c| ToolCall {
                        id: c.id,
                        name: c.function.name,
                        arguments: c.function.arguments,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(RunSnapshot {
            id: run.id,
            state,
            tool_calls,
            last_error: run.last_error.map(|e| RunError {
                code: e.code,
                message: e.message,
            }),
        })
    }
}

impl From<ApiMessage> for Message {
    fn from(message: ApiMessage) -> Self {
        let content = message
            .content
            .into_iter()
            .filter_map(|c| c.text.map(|t| t.value))
            .collect::<Vec<_>>()
            .join("\n");
        Message {
            id: message.id,
            role: if message.role == "user" { Role::User } else { Role::Assistant },
            author: String::new(),
            content,
        }
    }
}

impl AssistantsBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env)
            .with_context(|| format!("{} is not set; the worker backend needs an API key", settings.api_key_env))?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: settings.model.clone(),
            assistants: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", path))?;
        decode(resp, path).await
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", path))?;
        decode(resp, path).await
    }

    async fn assistant_for(&self, request: &RunRequest) -> Result<String> {
        let mut assistants = self.assistants.lock().await;
        if let Some(id) = assistants.get(&request.worker) {
            return Ok(id.clone());
        }
        let created: ApiObject = self
            .post(
                "assistants",
                &json!({
                    "name": request.worker,
                    "instructions": request.instructions,
                    "model": request.model.as_deref().unwrap_or(&self.model),
                    "tools": request.tools,
                    "temperature": request.temperature,
                }),
            )
            .await
            .with_context(|| format!("Failed to create assistant for {}", request.worker))?;
        tracing::info!(worker = %request.worker, assistant = %created.id, "created assistant");
        assistants.insert(request.worker.clone(), created.id.clone());
        Ok(created.id)
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response, path: &str) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("{} returned {}: {}", path, status, body);
    }
    resp.json::<T>()
        .await
        .with_context(|| format!("Failed to parse response from {}", path))
}

#[async_trait]
impl RunBackend for AssistantsBackend {
    async fn create_thread(&self, worker: &str, issue: Option<&IssuePath>) -> Result<String> {
        let mut metadata = json!({"worker": worker});
        if let Some(issue) = issue {
            metadata["issue"] = Value::String(issue.to_string());
        }
        let thread: ApiObject = self.post("threads", &json!({"metadata": metadata})).await?;
        Ok(thread.id)
    }

    async fn post_message(&self, thread: &str, content: &str) -> Result<String> {
        let message: ApiObject = self
            .post(
                &format!("threads/{}/messages", thread),
                &json!({"role": "user", "content": content}),
            )
            .await?;
        Ok(message.id)
    }

    async fn start_run(&self, thread: &str, request: &RunRequest) -> Result<RunSnapshot> {
        let assistant = self.assistant_for(request).await?;
        let mut body = json!({
            "assistant_id": assistant,
            "instructions": request.instructions,
            "tools": request.tools,
            "temperature": request.temperature,
        });
        if let Some(extra) = &request.additional_instructions {
            body["additional_instructions"] = Value::String(extra.clone());
        }
        if let Some(model) = &request.model {
            body["model"] = Value::String(model.clone());
        }
        let run: ApiRun = self.post(&format!("threads/{}/runs", thread), &body).await?;
        run.try_into()
    }

    async fn poll_run(&self, thread: &str, run: &str) -> Result<RunSnapshot> {
        let run: ApiRun = self.get(&format!("threads/{}/runs/{}", thread, run), &[]).await?;
        run.try_into()
    }

    async fn active_runs(&self, thread: &str) -> Result<Vec<RunSnapshot>> {
        let runs: ApiList<ApiRun> = self
            .get(&format!("threads/{}/runs", thread), &[("limit", "20")])
            .await?;
        let mut active = Vec::new();
        for run in runs.data {
            let snapshot = RunSnapshot::try_from(run)?;
            if snapshot.state.is_active() {
                active.push(snapshot);
            }
        }
        Ok(active)
    }

    async fn submit_tool_outputs(&self, thread: &str, run: &str, outputs: &[ToolOutput]) -> Result<RunSnapshot> {
        let run: ApiRun = self
            .post(
                &format!("threads/{}/runs/{}/submit_tool_outputs", thread, run),
                &json!({"tool_outputs": outputs}),
            )
            .await?;
        run.try_into()
    }

    async fn messages_since(&self, thread: &str, message_id: &str) -> Result<Vec<Message>> {
        let messages: ApiList<ApiMessage> = self
            .get(
                &format!("threads/{}/messages", thread),
                &[("order", "asc"), ("after", message_id), ("limit", "100")],
            )
            .await?;
        Ok(messages.data.into_iter().map(Message::from).collect())
    }

    async fn structured_completion(&self, request: &StructuredRequest) -> Result<Value> {
        let body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {"name": request.schema_name, "schema": request.schema, "strict": true},
            },
        });
        let completion: Value = self.post("chat/completions", &body).await?;
        let content = completion["choices"][0]["message"]["content"]
            .as_str()
            .context("Completion has no message content")?;
        parse_structured(content)
    }
}

fn parse_structured(content: &str) -> Result<Value> {
    match serde_json::from_str(content) {
        Ok(value) => Ok(value),
        Err(_) => {
            let object = extract_json_object(content).context("Completion content is not JSON")?;
            serde_json::from_str(&object).context("Completion content is not JSON")
        }
    }
}
