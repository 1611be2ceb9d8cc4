//! Stage inference and the external checks that follow an accepted reply.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use crate::exec::{CommandOutput, CommandRunner};
use crate::issues::{IssuePath, IssueStore, NewIssue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    Coding,
    Testing,
    Deploy,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Coding => "coding",
            Self::Testing => "testing",
            Self::Deploy => "deploy",
        }
    }

    /// Classify issue text by keyword hits. Ties go to the later stage;
    /// text with no hits is still being planned.
    pub fn infer(text: &str) -> Stage {
        let text = text.to_lowercase();
        STAGE_KEYWORDS
            .iter()
            .map(|(stage, re)| (*stage, re.find_iter(&text).count()))
            .filter(|(_, hits)| *hits > 0)
            .max_by_key(|(stage, hits)| (*hits, *stage as u8))
            .map(|(stage, _)| stage)
            .unwrap_or(Stage::Plan)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static STAGE_KEYWORDS: LazyLock<Vec<(Stage, Regex)>> = LazyLock::new(|| {
    let build = |words: &str| Regex::new(&format!(r"\b(?:{})\b", words)).expect("valid stage regex");
    vec![
        (Stage::Plan, build("plan|planning|design|architecture|requirements?|break down|decompose|spec")),
        (
            Stage::Coding,
            build("code|coding|implement\\w*|function|endpoint|class|module|fix|bug|refactor|api"),
        ),
        (Stage::Testing, build("tests?|testing|pytest|unit test|integration|qa|verify")),
        (Stage::Deploy, build("deploy\\w*|docker|container|kubernetes|release|production|ci/cd")),
    ]
});

/// Commands run for each stage; an empty argv skips the check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageCommands {
    pub coding: Vec<String>,
    pub testing: Vec<String>,
    pub deploy: Vec<String>,
}

impl Default for StageCommands {
    fn default() -> Self {
        let argv = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect();
        Self {
            coding: argv(&["python3", "-m", "compileall", "-q", "."]),
            testing: argv(&["python3", "-m", "pytest", "-q"]),
            deploy: argv(&["docker", "compose", "config", "--quiet"]),
        }
    }
}

impl StageCommands {
    pub fn for_stage(&self, stage: Stage) -> &[String] {
        match stage {
            Stage::Plan => &[],
            Stage::Coding => &self.coding,
            Stage::Testing => &self.testing,
            Stage::Deploy => &self.deploy,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StageCheck {
    /// Nothing to run for this stage.
    Skipped,
    /// The command could not be started.
    Unavailable(String),
    Ran(CommandOutput),
}

impl StageCheck {
    pub fn failed_output(&self) -> Option<&CommandOutput> {
        match self {
            Self::Ran(output) if !output.success() => Some(output),
            _ => None,
        }
    }
}

pub struct StageRunner {
    exec: CommandRunner,
    commands: StageCommands,
}

impl StageRunner {
    pub fn new(exec: CommandRunner, commands: StageCommands) -> Self {
        Self { exec, commands }
    }

    pub async fn check(&self, stage: Stage) -> StageCheck {
        let Some((program, args)) = self.commands.for_stage(stage).split_first() else {
            return StageCheck::Skipped;
        };
        match self.exec.run(program, args).await {
            Ok(output) => {
                tracing::info!(
                    stage = %stage,
                    command = %output.command,
                    exit_code = ?output.exit_code,
                    timed_out = output.timed_out,
                    "stage check finished"
                );
                StageCheck::Ran(output)
            }
            Err(e) => {
                tracing::warn!(stage = %stage, error = %format!("{:#}", e), "stage check could not run");
                StageCheck::Unavailable(format!("{:#}", e))
            }
        }
    }
}

/// Create a sub-issue under `parent` unless an open child already carries
/// the same title. Returns the new path, or `None` when deduplicated.
pub fn ensure_sub_issue(
    store: &IssueStore,
    parent: &IssuePath,
    issue: NewIssue,
    creator: &str,
) -> anyhow::Result<Option<IssuePath>> {
    for child in store.children(parent)? {
        let existing = store.read(&child.to_string())?;
        if existing.status.is_open() && existing.record.title == issue.title {
            tracing::debug!(parent = %parent, existing = %child, title = %issue.title, "sub-issue already open");
            return Ok(None);
        }
    }
    Ok(Some(store.create(&parent.to_string(), issue, creator)?))
}
