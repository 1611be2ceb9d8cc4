//! Drives a task to completion against a [`RunBackend`].
//!
//! One `DispatchedWorker` per worker identity. Its admission lock serializes
//! tasks so a worker never has two runs in flight; inside a task the run is
//! polled with a fixed interval and advanced by [`next_step`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};

use super::backend::{RunBackend, RunRequest, StructuredRequest, ToolOutput};
use super::config::WorkerConfig;
use super::run::{RunError, RunSnapshot, RunState, Step, next_step};
use super::tools::{self, ToolEnv, ToolScope};
use super::{Role, TaskContext, TaskReply, Worker};
use crate::errors::DispatchError;
use crate::issues::IssuePath;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Fresh runs allowed after a failed or expired one.
    pub retry_count: u32,
    pub poll_interval: Duration,
    /// How long a task waits for the worker to become idle.
    pub admission_wait: Duration,
    pub submit_attempts: u32,
    pub rate_limit_fallback: Duration,
    pub run_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            retry_count: 3,
            poll_interval: Duration::from_millis(500),
            admission_wait: Duration::from_secs(300),
            submit_attempts: 2,
            rate_limit_fallback: Duration::from_secs(15),
            run_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct ThreadHandle {
    id: String,
    issue: Option<IssuePath>,
}

pub struct DispatchedWorker {
    config: WorkerConfig,
    backend: Arc<dyn RunBackend>,
    env: Arc<ToolEnv>,
    settings: DispatchSettings,
    admission: Mutex<()>,
    threads: Mutex<Vec<ThreadHandle>>,
}

impl DispatchedWorker {
    pub fn new(
        config: WorkerConfig,
        backend: Arc<dyn RunBackend>,
        env: Arc<ToolEnv>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            config,
            backend,
            env,
            settings,
            admission: Mutex::new(()),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The thread of the closest issue in `issue`'s lineage, or a new one.
    async fn thread_for(&self, issue: Option<&IssuePath>) -> Result<String> {
        let mut threads = self.threads.lock().await;
        let existing = match issue {
            Some(issue) => issue.lineage().into_iter().find_map(|candidate| {
                threads
                    .iter()
                    .find(|t| t.issue.as_ref() == Some(&candidate))
                    .map(|t| t.id.clone())
            }),
            None => threads.iter().find(|t| t.issue.is_none()).map(|t| t.id.clone()),
        };
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = self
            .backend
            .create_thread(&self.config.name, issue)
            .await
            .with_context(|| format!("Failed to create a thread for {}", self.config.name))?;
        tracing::debug!(worker = %self.config.name, thread = %id, issue = ?issue.map(|i| i.to_string()), "opened thread");
        threads.push(ThreadHandle {
            id: id.clone(),
            issue: issue.cloned(),
        });
        Ok(id)
    }

    /// Block until no run is active on `thread`, up to the admission budget.
    async fn wait_until_idle(&self, thread: &str) -> Result<()> {
        let deadline = Instant::now() + self.settings.admission_wait;
        loop {
            let active = self
                .backend
                .active_runs(thread)
                .await
                .context("Failed to list active runs")?;
            if active.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DispatchError::WorkerBusy {
                    worker: self.config.name.clone(),
                    waited: self.settings.admission_wait,
                }
                .into());
            }
            tracing::debug!(worker = %self.config.name, thread, active = active.len(), "waiting for active run");
            sleep(self.settings.poll_interval).await;
        }
    }

    fn run_request(&self) -> RunRequest {
        let factor = self.env.feedback.performance_factor(&self.config.name);
        RunRequest {
            worker: self.config.name.clone(),
            instructions: self.config.system_instructions(),
            additional_instructions: self.env.feedback.latest_instructions(&self.config.name),
            model: self.config.model.clone(),
            temperature: (self.config.temperature as f64 * factor).clamp(0.0, 2.0) as f32,
            tools: tools::tool_definitions(&self.config.tools),
        }
    }

    async fn run_tools(&self, calls: &[super::run::ToolCall], scope: &ToolScope) -> Vec<ToolOutput> {
        let mut outputs = Vec::with_capacity(calls.len());
        for call in calls {
            let output = tools::invoke(&self.env, scope, &self.config.tools, &call.name, &call.arguments).await;
            outputs.push(ToolOutput {
                tool_call_id: call.id.clone(),
                output,
            });
        }
        outputs
    }

    /// Submit tool outputs, retrying a bounded number of times.
    async fn submit(&self, thread: &str, run: &RunSnapshot, outputs: &[ToolOutput]) -> RunSnapshot {
        let attempts = self.settings.submit_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.backend.submit_tool_outputs(thread, &run.id, outputs).await {
                Ok(snapshot) => return snapshot,
                Err(e) => {
                    tracing::warn!(worker = %self.config.name, run = %run.id, attempt, error = %e, "tool output submission failed");
                    last_error = format!("{:#}", e);
                }
            }
        }
        let mut failed = RunSnapshot::new(run.id.clone(), RunState::Failed);
        failed.last_error = Some(RunError {
            code: "submit_failed".into(),
            message: format!("Tool outputs not accepted after {} attempts: {}", attempts, last_error),
        });
        failed
    }

    async fn drive(&self, prompt: &str, from: &str, context: &TaskContext) -> Result<TaskReply> {
        let name = self.config.name.as_str();
        let thread = self.thread_for(context.issue.as_ref()).await?;
        self.wait_until_idle(&thread).await?;

        let prompt_id = self
            .backend
            .post_message(&thread, prompt)
            .await
            .context("Failed to post prompt")?;
        tracing::info!(
            target: "sweteam::messages",
            from,
            to = name,
            issue = ?context.issue.as_ref().map(|i| i.to_string()),
            prompt,
            "task sent"
        );

        let request = self.run_request();
        let scope = ToolScope {
            caller: name.to_string(),
            from: from.to_string(),
            issue: context.issue.clone(),
        };
        let mut retries = self.settings.retry_count;
        let mut run = self
            .backend
            .start_run(&thread, &request)
            .await
            .context("Failed to start run")?;
        let mut started = Instant::now();

        loop {
            if run.state.is_active() && started.elapsed() > self.settings.run_timeout {
                tracing::warn!(worker = name, run = %run.id, "run exceeded its timeout");
                run = RunSnapshot {
                    state: RunState::Expired,
                    tool_calls: Vec::new(),
                    last_error: Some(RunError {
                        code: "run_timeout".into(),
                        message: format!("Run did not finish within {}s", self.settings.run_timeout.as_secs()),
                    }),
                    ..run
                };
            }

            match next_step(&run, retries, self.settings.rate_limit_fallback) {
                Step::Wait => {
                    sleep(self.settings.poll_interval).await;
                    match self.backend.poll_run(&thread, &run.id).await {
                        Ok(snapshot) => run = snapshot,
                        Err(e) => {
                            tracing::warn!(worker = name, run = %run.id, error = %e, "poll failed");
                            if retries == 0 {
                                return Ok(TaskReply::failed(name, Some(run.state), format!("Polling failed: {:#}", e)));
                            }
                            retries -= 1;
                        }
                    }
                }
                Step::RunTools(calls) => {
                    tracing::debug!(worker = name, run = %run.id, calls = calls.len(), "run requires action");
                    let outputs = self.run_tools(&calls, &scope).await;
                    run = self.submit(&thread, &run, &outputs).await;
                }
                Step::Retry { backoff } => {
                    if let Some(wait) = backoff {
                        tracing::info!(
                            worker = name,
                            run = %run.id,
                            "{}",
                            DispatchError::RateLimited { retry_after: wait }
                        );
                        sleep(wait).await;
                    }
                    retries -= 1;
                    tracing::info!(worker = name, failed_run = %run.id, state = %run.state, retries_left = retries, "starting a fresh run");
                    run = self
                        .backend
                        .start_run(&thread, &request)
                        .await
                        .context("Failed to restart run")?;
                    started = Instant::now();
                }
                Step::Collect => {
                    let mut messages = self
                        .backend
                        .messages_since(&thread, &prompt_id)
                        .await
                        .context("Failed to collect reply")?;
                    for message in &mut messages {
                        message.author = match message.role {
                            Role::Assistant => name.to_string(),
                            Role::User => from.to_string(),
                        };
                    }
                    let reply = TaskReply::completed(name, messages);
                    tracing::info!(target: "sweteam::messages", from = name, to = from, reply = %reply.text(), "task reply");
                    return Ok(reply);
                }
                Step::GiveUp => {
                    let reason = match run.state {
                        RunState::Expired => DispatchError::RunExpired { run_id: run.id.clone() }.to_string(),
                        _ => DispatchError::RunFailed {
                            run_id: run.id.clone(),
                            reason: run
                                .last_error
                                .as_ref()
                                .map(|e| e.to_string())
                                .unwrap_or_else(|| "no error reported".to_string()),
                        }
                        .to_string(),
                    };
                    tracing::warn!(worker = name, "{}", DispatchError::RetriesExhausted { state: run.state });
                    return Ok(TaskReply::failed(name, Some(run.state), reason));
                }
            }
        }
    }
}

#[async_trait]
impl Worker for DispatchedWorker {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn perform_task(&self, prompt: &str, from: &str, context: &TaskContext) -> TaskReply {
        let name = self.config.name.as_str();
        let _admitted = match timeout(self.settings.admission_wait, self.admission.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                let busy = DispatchError::WorkerBusy {
                    worker: name.to_string(),
                    waited: self.settings.admission_wait,
                };
                tracing::warn!(worker = name, from, "{}", busy);
                return TaskReply::failed(name, None, busy.to_string());
            }
        };

        match self.drive(prompt, from, context).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(worker = name, from, error = %format!("{:#}", e), "task failed");
                TaskReply::failed(name, None, format!("{:#}", e))
            }
        }
    }

    async fn evaluate(&self, request: &StructuredRequest) -> Result<Value> {
        let mut request = request.clone();
        if request.model.is_none() {
            request.model = self.config.model.clone();
        }
        self.backend
            .structured_completion(&request)
            .await
            .with_context(|| format!("{} could not evaluate", self.config.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerRegistry;
    use crate::worker::backend::testing::{ScriptedBackend, failed, snap, tools as tool_calls};
    use crate::worker::tools::testing::env_in;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        _registry: Arc<WorkerRegistry>,
        backend: Arc<ScriptedBackend>,
        worker: Arc<DispatchedWorker>,
        env: Arc<ToolEnv>,
    }

    fn fixture(backend: ScriptedBackend, settings: DispatchSettings) -> Fixture {
        let dir = tempdir().unwrap();
        let registry = Arc::new(WorkerRegistry::new());
        let env = Arc::new(env_in(dir.path(), &registry, &[]));
        let backend = Arc::new(backend);
        let config = WorkerConfig::new("backend_dev", "develop backend code", "You write Python.");
        let worker = Arc::new(DispatchedWorker::new(config, backend.clone(), env.clone(), settings));
        registry.register(worker.clone());
        Fixture {
            _dir: dir,
            _registry: registry,
            backend,
            worker,
            env,
        }
    }

    fn ctx(issue: &str) -> TaskContext {
        TaskContext::for_issue(issue.parse().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_run_returns_new_messages() {
        let f = fixture(
            ScriptedBackend::new().script(vec![snap(RunState::InProgress), snap(RunState::Completed)], "all done"),
            DispatchSettings::default(),
        );
        let reply = f.worker.perform_task("implement login", "pm", &ctx("1")).await;
        assert!(reply.is_success(), "{:?}", reply);
        assert_eq!(reply.messages.len(), 1);
        assert_eq!(reply.messages[0].content, "all done");
        assert_eq!(reply.messages[0].author, "backend_dev");
        assert_eq!(f.backend.run_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_calls_are_executed_and_submitted() {
        let f = fixture(
            ScriptedBackend::new().script(
                vec![
                    tool_calls(&[
                        ("overwrite_file", r#"{"filename":"app.py","content":"print('hi')\n"}"#),
                        ("launch_rocket", "{}"),
                    ]),
                    snap(RunState::Completed),
                ],
                "wrote app.py",
            ),
            DispatchSettings::default(),
        );
        let reply = f.worker.perform_task("write app.py", "pm", &ctx("1")).await;
        assert!(reply.is_success());
        assert!(f.env.project_dir.join("app.py").is_file());

        let submitted = f.backend.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0][0].tool_call_id, "call_0");
        assert!(submitted[0][0].output.contains("written"));
        assert_eq!(submitted[0][1].output, "Function launch_rocket not a configured tool.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_failure_with_state() {
        let backend = ScriptedBackend::new()
            .script(vec![failed("server_error", "boom")], "")
            .script(vec![failed("server_error", "boom again")], "");
        let settings = DispatchSettings {
            retry_count: 1,
            ..DispatchSettings::default()
        };
        let f = fixture(backend, settings);
        let reply = f.worker.perform_task("x", "pm", &ctx("1")).await;
        match &reply.outcome {
            crate::worker::TaskOutcome::Failed { state, reason } => {
                assert_eq!(*state, Some(RunState::Failed));
                assert!(reason.ends_with("failed: server_error: boom again"), "{}", reason);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(f.backend.run_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_sleeps_before_consuming_retry() {
        let backend = ScriptedBackend::new()
            .script(
                vec![failed(
                    "rate_limit_exceeded",
                    "Rate limit reached for requests. Please try again in 5 seconds.",
                )],
                "",
            )
            .script(vec![snap(RunState::Completed)], "finally");
        let settings = DispatchSettings {
            retry_count: 1,
            ..DispatchSettings::default()
        };
        let f = fixture(backend, settings);
        let worker = f.worker.clone();
        let begin = Instant::now();
        let task = tokio::spawn(async move { worker.perform_task("x", "pm", &ctx("1")).await });

        // One poll interval in, the first run has failed and the backoff is running.
        sleep(Duration::from_secs(4)).await;
        assert_eq!(f.backend.run_count(), 1);

        let reply = task.await.unwrap();
        let elapsed = begin.elapsed();
        assert!(reply.is_success(), "{:?}", reply);
        assert_eq!(reply.text(), "finally");
        assert_eq!(f.backend.run_count(), 2);
        assert!(elapsed >= Duration::from_secs(5), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(7), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_worker_never_runs_twice_at_once() {
        let backend = ScriptedBackend::new()
            .script(
                vec![
                    snap(RunState::InProgress),
                    snap(RunState::InProgress),
                    snap(RunState::Completed),
                ],
                "first",
            )
            .script(vec![snap(RunState::Completed)], "second");
        let f = fixture(backend, DispatchSettings::default());

        let no_issue = TaskContext::default();
        let (a, b) = tokio::join!(
            f.worker.perform_task("task a", "pm", &no_issue),
            f.worker.perform_task("task b", "tester", &no_issue),
        );
        assert_eq!(a.text(), "first");
        assert_eq!(b.text(), "second");
        assert_eq!(*f.backend.max_active.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_active_run_times_out_admission() {
        let settings = DispatchSettings {
            admission_wait: Duration::from_secs(3),
            ..DispatchSettings::default()
        };
        let f = fixture(ScriptedBackend::new().script(vec![snap(RunState::Completed)], "ok"), settings);
        assert!(f.worker.perform_task("first", "pm", &ctx("5")).await.is_success());

        f.backend.stuck_run("thread_1");
        let reply = f.worker.perform_task("second", "pm", &ctx("5")).await;
        match &reply.outcome {
            crate::worker::TaskOutcome::Failed { state, reason } => {
                assert_eq!(*state, None);
                assert!(reason.contains("still has an active run"), "{}", reason);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(f.backend.run_count(), 1);

        f.backend.finish_all();
        assert!(f.worker.perform_task("third", "pm", &ctx("5")).await.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_issue_reuses_ancestor_thread() {
        let f = fixture(ScriptedBackend::new(), DispatchSettings::default());
        f.worker.perform_task("a", "pm", &ctx("3")).await;
        f.worker.perform_task("b", "pm", &ctx("3/2")).await;
        f.worker.perform_task("c", "pm", &ctx("4")).await;
        let created = f.backend.created_threads.lock().unwrap();
        let issues: Vec<String> = created
            .iter()
            .map(|(_, issue)| issue.as_ref().unwrap().to_string())
            .collect();
        assert_eq!(issues, vec!["3", "4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_failures_fail_the_run_then_retry() {
        let backend = ScriptedBackend::new()
            .script(vec![tool_calls(&[("read_file", r#"{"filepath":"nope.txt"}"#)])], "")
            .script(vec![snap(RunState::Completed)], "recovered");
        *backend.submit_failures.lock().unwrap() = 2;
        let f = fixture(backend, DispatchSettings::default());
        let reply = f.worker.perform_task("x", "pm", &ctx("1")).await;
        assert_eq!(reply.text(), "recovered");
        assert_eq!(f.backend.run_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_expires_locally() {
        let settings = DispatchSettings {
            retry_count: 0,
            run_timeout: Duration::from_secs(2),
            ..DispatchSettings::default()
        };
        let f = fixture(ScriptedBackend::new().script(vec![snap(RunState::InProgress)], ""), settings);
        let reply = f.worker.perform_task("x", "pm", &ctx("1")).await;
        match reply.outcome {
            crate::worker::TaskOutcome::Failed { state, reason } => {
                assert_eq!(state, Some(RunState::Expired));
                assert!(reason.ends_with("expired"), "{}", reason);
            }
            other => panic!("expected expiry, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_feedback_shapes_the_run_request() {
        let f = fixture(ScriptedBackend::new(), DispatchSettings::default());
        f.env
            .feedback
            .record("backend_dev", "orchestrator", 10.0, "always run the tests")
            .unwrap();
        f.worker.perform_task("x", "pm", &ctx("1")).await;
        let started = f.backend.started.lock().unwrap();
        assert_eq!(
            started[0].additional_instructions.as_deref(),
            Some("always run the tests")
        );
        assert!((started[0].temperature - 0.77).abs() < 1e-4);
        assert_eq!(started[0].tools.len(), tools::TOOL_NAMES.len());
    }

    #[tokio::test]
    async fn test_evaluate_uses_structured_completion() {
        let backend = ScriptedBackend::new();
        backend.structured.lock().unwrap().push_back(serde_json::json!({"score": 8}));
        let f = fixture(backend, DispatchSettings::default());
        let request = StructuredRequest {
            model: None,
            system: "judge".into(),
            prompt: "rate".into(),
            schema_name: "score".into(),
            schema: serde_json::json!({"type": "object"}),
        };
        assert_eq!(f.worker.evaluate(&request).await.unwrap()["score"], 8);
    }
}
