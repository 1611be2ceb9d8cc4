//! Named tools a worker may call during a run.
//!
//! Each tool is a typed handler in a static table together with its JSON
//! function schema. A call is validated against the calling worker's
//! declared tool set before anything runs, and every outcome, including
//! handler errors, is returned to the run as text.

use anyhow::{Context, Result, bail};
use futures::future::{BoxFuture, join_all};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

use super::feedback::FeedbackLog;
use super::{TaskContext, WorkerRegistry};
use crate::errors::DispatchError;
use crate::exec::CommandRunner;
use crate::issues::{IssuePath, IssueStore, ListFilter, NewIssue, Status, UpdateDraft};
use crate::patch::apply_unified_diff;
use crate::planner::{DirectoryPlanner, Tree};
use crate::requester::Requester;
use crate::util::{truncate_chars, write_atomic};

pub const PARALLEL_TOOL: &str = "multi_tool_use.parallel";

/// Longest tool result handed back to a run.
const MAX_OUTPUT_CHARS: usize = 32_000;

/// Shared resources the tools operate on.
pub struct ToolEnv {
    pub project_dir: PathBuf,
    pub issues: IssueStore,
    pub planner: DirectoryPlanner,
    pub exec: CommandRunner,
    pub requester: Arc<dyn Requester>,
    pub feedback: Arc<FeedbackLog>,
    pub registry: Weak<WorkerRegistry>,
    /// Workers issues may be assigned to.
    pub roster: Vec<String>,
}

/// Who is calling a tool, on whose behalf, and for which issue.
#[derive(Debug, Clone, Default)]
pub struct ToolScope {
    pub caller: String,
    pub from: String,
    pub issue: Option<IssuePath>,
}

type ToolHandler = for<'a> fn(&'a ToolEnv, &'a ToolScope, Value) -> BoxFuture<'a, Result<String>>;

struct ToolSpec {
    name: &'static str,
    description: &'static str,
    parameters: fn() -> Value,
    handler: ToolHandler,
}

static TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "read_file",
        description: "Read a file in the project directory.",
        parameters: || {
            json!({
                "type": "object",
                "properties": {"filepath": {"type": "string", "description": "path relative to the project directory"}},
                "required": ["filepath"]
            })
        },
        handler: read_file,
    },
    ToolSpec {
        name: "overwrite_file",
        description: "Write a whole file. An existing file is only replaced when force is true.",
        parameters: || {
            json!({
                "type": "object",
                "properties": {
                    "filename": {"type": "string"},
                    "content": {"type": "string"},
                    "force": {"type": "boolean", "default": false}
                },
                "required": ["filename", "content"]
            })
        },
        handler: overwrite_file,
    },
    ToolSpec {
        name: "apply_diff",
        description: "Apply unified diff hunks to a file. Context and deleted lines must match the file exactly.",
        parameters: || {
            json!({
                "type": "object",
                "properties": {
                    "filepath": {"type": "string"},
                    "diffs": {"type": "string", "description": "one or more unified diff hunks starting with @@"}
                },
                "required": ["filepath", "diffs"]
            })
        },
        handler: apply_diff,
    },
    ToolSpec {
        name: "dir_structure",
        description: "Read the planned vs. actual project layout, or merge an update into the plan.",
        parameters: || {
            json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["read", "update"]},
                    "actual_only": {"type": "boolean", "default": false},
                    "content": {"description": "planned tree patch for update, as a mapping or YAML text"}
                },
                "required": ["action"]
            })
        },
        handler: dir_structure,
    },
    ToolSpec {
        name: "issue_manager",
        description: "List, create, read, update or assign issues on the issue board.",
        parameters: || {
            json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["list", "create", "read", "update", "assign"]},
                    "issue": {"type": "string", "description": "issue path such as 12/3; the parent for create"},
                    "only_in_state": {"type": "array", "items": {"type": "string"}},
                    "content": {"description": "issue or update content as an object, JSON/YAML text or plain text"},
                    "assignee": {"type": "string"}
                },
                "required": ["action"]
            })
        },
        handler: issue_manager,
    },
    ToolSpec {
        name: "run_command",
        description: "Run a command in the project directory, optionally in the background.",
        parameters: || {
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "args": {"type": "array", "items": {"type": "string"}},
                    "asynchronous": {"type": "boolean", "default": false}
                },
                "required": ["command"]
            })
        },
        handler: run_command,
    },
    ToolSpec {
        name: "run_module",
        description: "Run a Python module, or call one function in it, from the project directory.",
        parameters: || {
            json!({
                "type": "object",
                "properties": {
                    "module_name": {"type": "string"},
                    "method_name": {"type": "string"},
                    "args": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["module_name"]
            })
        },
        handler: run_module,
    },
    ToolSpec {
        name: "get_human_input",
        description: "Ask the human requester a question.",
        parameters: || {
            json!({
                "type": "object",
                "properties": {"prompt": {"type": "string"}},
                "required": ["prompt"]
            })
        },
        handler: get_human_input,
    },
    ToolSpec {
        name: "chat_with_worker",
        description: "Send a message to another worker and wait for the reply.",
        parameters: || {
            json!({
                "type": "object",
                "properties": {
                    "worker_name": {"type": "string"},
                    "message": {"type": "string"},
                    "issue": {"type": "string"}
                },
                "required": ["worker_name", "message"]
            })
        },
        handler: chat_with_worker,
    },
    ToolSpec {
        name: "evaluate_worker",
        description: "Score another worker's reply from 0 to 10 and say how it can improve.",
        parameters: || {
            json!({
                "type": "object",
                "properties": {
                    "worker_name": {"type": "string"},
                    "score": {"type": "number"},
                    "additional_instructions": {"type": "string"}
                },
                "required": ["worker_name", "score"]
            })
        },
        handler: evaluate_worker,
    },
];

pub const TOOL_NAMES: &[&str] = &[
    "read_file",
    "overwrite_file",
    "apply_diff",
    "dir_structure",
    "issue_manager",
    "run_command",
    "run_module",
    "get_human_input",
    "chat_with_worker",
    "evaluate_worker",
];

fn spec(name: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|t| t.name == name)
}

/// Function definitions for the tools a worker declares.
pub fn tool_definitions(allowed: &[String]) -> Vec<Value> {
    allowed
        .iter()
        .filter_map(|name| spec(name))
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": (t.parameters)(),
                }
            })
        })
        .collect()
}

/// Run one requested tool call and render its result for the run.
/// Never fails: unknown tools, bad arguments and handler errors all come back
/// as text the worker can react to.
pub async fn invoke(env: &ToolEnv, scope: &ToolScope, allowed: &[String], name: &str, arguments: &str) -> String {
    tracing::info!(target: "sweteam::messages", worker = %scope.caller, tool = name, arguments, "tool call");

    let output = if name == PARALLEL_TOOL {
        invoke_parallel(env, scope, allowed, arguments).await
    } else {
        invoke_one(env, scope, allowed, name, parse_arguments(arguments)).await
    };
    let output = truncate_chars(&output, MAX_OUTPUT_CHARS);

    tracing::info!(target: "sweteam::messages", worker = %scope.caller, tool = name, output = %output, "tool result");
    output
}

async fn invoke_one(env: &ToolEnv, scope: &ToolScope, allowed: &[String], name: &str, args: Value) -> String {
    let name = name.strip_prefix("functions.").unwrap_or(name);
    let spec = match spec(name) {
        Some(spec) if allowed.iter().any(|a| a == name) => spec,
        _ => {
            tracing::warn!(worker = %scope.caller, tool = name, "worker requested a tool it does not have");
            return DispatchError::ToolNotConfigured { name: name.to_string() }.to_string();
        }
    };
    match (spec.handler)(env, scope, args).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(worker = %scope.caller, tool = name, error = %e, "tool failed");
            format!("Error: calling tool {}, received error {:#}", name, e)
        }
    }
}

#[derive(Deserialize)]
struct ParallelUse {
    recipient_name: String,
    #[serde(default)]
    parameters: Value,
}

#[derive(Deserialize)]
struct ParallelArgs {
    #[serde(default)]
    tool_uses: Vec<ParallelUse>,
}

async fn invoke_parallel(env: &ToolEnv, scope: &ToolScope, allowed: &[String], arguments: &str) -> String {
    let bundle: ParallelArgs = match serde_json::from_value(parse_arguments(arguments)) {
        Ok(bundle) => bundle,
        Err(e) => return format!("Error: calling tool {}, received error {}", PARALLEL_TOOL, e),
    };
    let calls = bundle.tool_uses.into_iter().map(|tool_use| async move {
        let name = tool_use
            .recipient_name
            .strip_prefix("functions.")
            .unwrap_or(&tool_use.recipient_name)
            .to_string();
        let output = invoke_one(env, scope, allowed, &name, tool_use.parameters).await;
        format!("Output of {}:\n{}\n\n", name, output)
    });
    join_all(calls).await.concat()
}

/// Arguments are JSON object text; anything else is treated as no arguments.
fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "tool arguments are not JSON");
        json!({})
    })
}

fn args<T: serde::de::DeserializeOwned>(tool: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).with_context(|| format!("Invalid arguments for {}", tool))
}

/// Resolve a worker supplied path inside the project directory. A leading
/// component naming the project directory itself is dropped.
pub(crate) fn resolve(project_dir: &Path, requested: &str) -> Result<PathBuf> {
    let requested = Path::new(requested.trim());
    let relative = if requested.is_absolute() {
        requested
            .strip_prefix(project_dir)
            .with_context(|| format!("{} is outside the project directory", requested.display()))?
    } else {
        requested
    };
    if relative.components().any(|c| matches!(c, Component::ParentDir)) {
        bail!("{} escapes the project directory", relative.display());
    }
    let relative = match project_dir.file_name() {
        Some(name) => relative.strip_prefix(name).unwrap_or(relative),
        None => relative,
    };
    Ok(project_dir.join(relative))
}

#[derive(Deserialize)]
struct ReadFileArgs {
    filepath: String,
}

fn read_file<'a>(env: &'a ToolEnv, _scope: &'a ToolScope, value: Value) -> BoxFuture<'a, Result<String>> {
    Box::pin(async move {
        let a: ReadFileArgs = args("read_file", value)?;
        let path = resolve(&env.project_dir, &a.filepath)?;
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", a.filepath))
    })
}

#[derive(Deserialize)]
struct OverwriteArgs {
    filename: String,
    content: String,
    #[serde(default)]
    force: bool,
}

fn overwrite_file<'a>(env: &'a ToolEnv, scope: &'a ToolScope, value: Value) -> BoxFuture<'a, Result<String>> {
    Box::pin(async move {
        let a: OverwriteArgs = args("overwrite_file", value)?;
        let path = resolve(&env.project_dir, &a.filename)?;
        if path.is_file() && !a.force {
            let current = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", a.filename))?;
            return Ok(format!(
                "File {} already exists and was not changed. Its current content is:\n{}\n\
                 Check it, then call overwrite_file with force=true to replace it.",
                a.filename, current
            ));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        write_atomic(&path, a.content.as_bytes()).with_context(|| format!("Failed to write {}", a.filename))?;
        tracing::info!(worker = %scope.caller, file = %path.display(), bytes = a.content.len(), "file overwritten");
        Ok(format!("File {} written ({} bytes).", a.filename, a.content.len()))
    })
}

#[derive(Deserialize)]
struct ApplyDiffArgs {
    filepath: String,
    diffs: String,
}

fn apply_diff<'a>(env: &'a ToolEnv, _scope: &'a ToolScope, value: Value) -> BoxFuture<'a, Result<String>> {
    Box::pin(async move {
        let a: ApplyDiffArgs = args("apply_diff", value)?;
        let path = resolve(&env.project_dir, &a.filepath)?;
        // Rejections go back verbatim so the worker can regenerate the diff.
        Ok(match apply_unified_diff(&path, &a.diffs) {
            Ok(summary) => summary.describe(),
            Err(e) => format!(
                "Error applying diff to {}: {}. The file was not changed; read it again and regenerate the diff.",
                a.filepath, e
            ),
        })
    })
}

#[derive(Deserialize)]
struct DirStructureArgs {
    action: String,
    #[serde(default)]
    actual_only: bool,
    #[serde(default)]
    content: Value,
}

fn dir_structure<'a>(env: &'a ToolEnv, _scope: &'a ToolScope, value: Value) -> BoxFuture<'a, Result<String>> {
    Box::pin(async move {
        let a: DirStructureArgs = args("dir_structure", value)?;
        match a.action.as_str() {
            "read" if a.actual_only => env.planner.actual_yaml(),
            "read" => env.planner.reconciled_yaml(),
            "update" => {
                let plan = match a.content {
                    Value::String(text) => env.planner.update_from_str(&text)?,
                    Value::Object(_) => {
                        let patch: Tree = serde_json::from_value(a.content).context("Planned tree patch is not a tree")?;
                        env.planner.update(patch)?
                    }
                    _ => bail!("dir_structure update needs content"),
                };
                Ok(format!(
                    "Directory plan updated with {} entries.",
                    plan.values().map(|n| n.count()).sum::<usize>()
                ))
            }
            other => bail!("Unknown dir_structure action '{}', expected read or update", other),
        }
    })
}

#[derive(Deserialize)]
struct IssueArgs {
    action: String,
    #[serde(default)]
    issue: String,
    #[serde(default)]
    only_in_state: Vec<String>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    assignee: Option<String>,
}

fn issue_manager<'a>(env: &'a ToolEnv, scope: &'a ToolScope, value: Value) -> BoxFuture<'a, Result<String>> {
    Box::pin(async move {
        let a: IssueArgs = args("issue_manager", value)?;
        let result = run_issue_action(env, scope, a);
        Ok(match result {
            Ok(value) => value.to_string(),
            Err(e) => json!({"status": "error", "message": format!("{:#}", e)}).to_string(),
        })
    })
}

fn run_issue_action(env: &ToolEnv, scope: &ToolScope, a: IssueArgs) -> Result<Value> {
    let store = &env.issues;
    match a.action.as_str() {
        "list" => {
            let statuses = a.only_in_state.into_iter().map(Status::from).collect();
            let issues = store.list(&a.issue, &ListFilter::with_statuses(statuses))?;
            Ok(serde_json::to_value(issues)?)
        }
        "create" => {
            let new_issue = match a.content {
                Value::Object(map) => NewIssue::from_map(map),
                Value::String(text) => NewIssue::parse(&text),
                _ => bail!("create needs content"),
            };
            let path = store.create(&a.issue, new_issue, &scope.caller)?;
            Ok(json!({"status": "success", "issue": path.to_string()}))
        }
        "read" => Ok(serde_json::to_value(store.read(&a.issue)?)?),
        "update" => {
            let mut draft = match a.content {
                Value::Object(map) => UpdateDraft::from_map(map),
                Value::String(text) => UpdateDraft::parse(&text),
                _ => UpdateDraft::default(),
            };
            if draft.assignee.is_none() {
                draft.assignee = a.assignee;
            }
            if draft.is_empty() {
                bail!("update needs content");
            }
            store.update(&a.issue, draft, &scope.caller)?;
            Ok(json!({"status": "success", "message": format!("Issue {} updated", a.issue)}))
        }
        "assign" => {
            let assignee = a.assignee.context("assign needs an assignee")?;
            store.assign(&a.issue, &assignee, &env.roster, &scope.caller)?;
            Ok(json!({"status": "success", "message": format!("Issue {} assigned to {}", a.issue, assignee)}))
        }
        other => bail!("Unknown issue_manager action '{}'", other),
    }
}

#[derive(Deserialize)]
struct RunCommandArgs {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    asynchronous: bool,
}

fn run_command<'a>(env: &'a ToolEnv, _scope: &'a ToolScope, value: Value) -> BoxFuture<'a, Result<String>> {
    Box::pin(async move {
        let a: RunCommandArgs = args("run_command", value)?;
        let (program, argv) = if a.args.is_empty() {
            let mut parts = a.command.split_whitespace().map(str::to_string);
            let program = parts.next().context("run_command needs a command")?;
            (program, parts.collect::<Vec<_>>())
        } else {
            (a.command.trim().to_string(), a.args)
        };
        if a.asynchronous {
            let pid = env.exec.spawn_detached(&program, &argv)?;
            return Ok(format!("Started {} in the background with pid {}.", program, pid));
        }
        Ok(env.exec.run(&program, &argv).await?.report())
    })
}

#[derive(Deserialize)]
struct RunModuleArgs {
    module_name: String,
    #[serde(default)]
    method_name: Option<String>,
    #[serde(default)]
    args: Vec<String>,
}

fn run_module<'a>(env: &'a ToolEnv, _scope: &'a ToolScope, value: Value) -> BoxFuture<'a, Result<String>> {
    Box::pin(async move {
        let a: RunModuleArgs = args("run_module", value)?;
        let method = a.method_name.as_deref().filter(|m| !m.trim().is_empty());
        Ok(env.exec.run_module(&a.module_name, method, &a.args).await?.report())
    })
}

#[derive(Deserialize)]
struct HumanInputArgs {
    prompt: String,
}

fn get_human_input<'a>(env: &'a ToolEnv, scope: &'a ToolScope, value: Value) -> BoxFuture<'a, Result<String>> {
    Box::pin(async move {
        let a: HumanInputArgs = args("get_human_input", value)?;
        let prompt = format!("<{}> {}", scope.caller, a.prompt);
        Ok(env
            .requester
            .ask(&prompt)
            .await?
            .unwrap_or_else(|| "The requester gave no answer.".to_string()))
    })
}

#[derive(Deserialize)]
struct ChatArgs {
    worker_name: String,
    message: String,
    #[serde(default)]
    issue: Option<String>,
}

fn chat_with_worker<'a>(env: &'a ToolEnv, scope: &'a ToolScope, value: Value) -> BoxFuture<'a, Result<String>> {
    Box::pin(async move {
        let a: ChatArgs = args("chat_with_worker", value)?;
        let target = a.worker_name.trim();
        if target == scope.from {
            return Ok(format!(
                "You are already chatting with {}, please reply to them instead of starting a new chat.",
                scope.from
            ));
        }
        if target == scope.caller {
            return Ok("You cannot start a chat with yourself.".to_string());
        }
        let registry = env.registry.upgrade().context("Worker registry is gone")?;
        let worker = registry
            .get(target)
            .ok_or_else(|| DispatchError::UnknownWorker(target.to_string()))?;

        let issue = match a.issue.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(issue) => Some(issue.parse::<IssuePath>()?),
            None => scope.issue.clone(),
        };
        let context = TaskContext {
            issue,
            ..TaskContext::default()
        };
        let reply = worker.perform_task(&a.message, &scope.caller, &context).await;
        Ok(reply.text())
    })
}

#[derive(Deserialize)]
struct EvaluateArgs {
    worker_name: String,
    score: f64,
    #[serde(default)]
    additional_instructions: String,
}

fn evaluate_worker<'a>(env: &'a ToolEnv, scope: &'a ToolScope, value: Value) -> BoxFuture<'a, Result<String>> {
    Box::pin(async move {
        let a: EvaluateArgs = args("evaluate_worker", value)?;
        let known = env
            .registry
            .upgrade()
            .is_some_and(|r| r.contains(&a.worker_name));
        if !known {
            bail!(DispatchError::UnknownWorker(a.worker_name));
        }
        let factor = env
            .feedback
            .record(&a.worker_name, &scope.caller, a.score, &a.additional_instructions)?;
        Ok(format!(
            "Thanks for your feedback. {} now has performance factor {:.2}.",
            a.worker_name, factor
        ))
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::planner::DEFAULT_EXCLUDES;
    use crate::requester::testing::ScriptedRequester;
    use std::time::Duration;

    /// An environment rooted in `dir` with the project at `dir/proj`.
    pub fn env_in(dir: &Path, registry: &Arc<WorkerRegistry>, answers: &[&str]) -> ToolEnv {
        let project_dir = dir.join("proj");
        std::fs::create_dir_all(&project_dir).unwrap();
        let excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        ToolEnv {
            issues: IssueStore::new(dir.join("issue_board")),
            planner: DirectoryPlanner::new("proj", &project_dir, dir.join("dir_structure.yaml"), &excludes),
            exec: CommandRunner::new(&project_dir, Duration::from_secs(10), "python3"),
            requester: Arc::new(ScriptedRequester::new(answers)),
            feedback: Arc::new(FeedbackLog::new(dir.join("feedback"))),
            registry: Arc::downgrade(registry),
            roster: vec!["pm".into(), "backend_dev".into()],
            project_dir,
        }
    }

    pub fn all_tools() -> Vec<String> {
        TOOL_NAMES.iter().map(|s| s.to_string()).collect()
    }
}
