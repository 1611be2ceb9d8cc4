use anyhow::{Context, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use super::judge::{Judge, ResponseScore};
use super::reply::{extract_code_blocks, extract_diffs};
use super::stage::{Stage, StageCheck, StageCommands, StageRunner, ensure_sub_issue};
use super::state::{CycleJournal, Phase};
use crate::errors::IssueError;
use crate::issues::model::UNKNOWN;
use crate::issues::{IssueDetail, IssuePath, IssueSummary, ListFilter, NewIssue, Status, UpdateDraft};
use crate::patch::apply_unified_diff;
use crate::util::truncate_chars;
use crate::worker::tools::{ToolEnv, resolve};
use crate::worker::{TaskContext, Worker, WorkerRegistry};

/// Assignee value meaning nobody owns the issue yet.
pub const UNASSIGNED: &str = "unassigned";

const REPLY_DETAILS_LIMIT: usize = 2000;

/// How the loop ended and what is still open.
#[derive(Debug, Clone)]
pub struct OrchestrationReport {
    pub final_phase: Phase,
    pub cycles: u32,
    pub open_issues: Vec<IssueSummary>,
}

impl OrchestrationReport {
    pub fn render(&self) -> String {
        let mut out = format!("Orchestration {} after {} cycle(s).", self.final_phase, self.cycles);
        if self.open_issues.is_empty() {
            out.push_str("\nNo open issues.");
            return out;
        }
        out.push_str(&format!("\n{} issue(s) still open:", self.open_issues.len()));
        for issue in &self.open_issues {
            out.push_str(&format!(
                "\n  {:<8} {:<12} {:<12} {:<14} {}",
                issue.issue, issue.priority, issue.status, issue.assignee, issue.title
            ));
        }
        out
    }
}

/// The scheduling loop. Holds a meta worker for judging, reassignment and
/// code saving; every other worker is reached through the registry.
pub struct Orchestrator {
    name: String,
    retry_count: u32,
    registry: Arc<WorkerRegistry>,
    meta: Arc<dyn Worker>,
    env: Arc<ToolEnv>,
    judge: Judge,
    stages: StageRunner,
    journal: CycleJournal,
    roster_roles: String,
}

impl Orchestrator {
    pub fn new(meta: Arc<dyn Worker>, registry: Arc<WorkerRegistry>, env: Arc<ToolEnv>) -> Self {
        let stages = StageRunner::new(env.exec.clone(), StageCommands::default());
        let journal = CycleJournal::new(env.project_dir.join(".sweteam").join("state"));
        Self {
            name: meta.name().to_string(),
            retry_count: 3,
            registry,
            meta,
            env,
            judge: Judge::default(),
            stages,
            journal,
            roster_roles: String::new(),
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_judge(mut self, judge: Judge) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_stage_commands(mut self, commands: StageCommands) -> Self {
        self.stages = StageRunner::new(self.env.exec.clone(), commands);
        self
    }

    pub fn with_journal(mut self, state_file: PathBuf) -> Self {
        self.journal = CycleJournal::new(state_file);
        self
    }

    pub fn with_roster_roles(mut self, roles: impl Into<String>) -> Self {
        self.roster_roles = roles.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run cycles until the board is empty and nothing new is requested, or
    /// the retry budget runs out.
    pub async fn run(&self) -> Result<OrchestrationReport> {
        let mut budget = self.retry_count;
        let mut cycle = self.journal.last_cycle().unwrap_or_else(|e| {
            tracing::warn!(error = %format!("{:#}", e), "could not read cycle journal");
            0
        });
        let mut cycles = 0;
        tracing::info!(orchestrator = %self.name, budget, "starting orchestration");

        while budget > 0 {
            let Some(top) = self.open_issues()?.into_iter().next() else {
                if self.solicit_request(cycle + 1).await? {
                    continue;
                }
                self.note(cycle, "", Phase::Done, "no open issues and no new request");
                tracing::info!(cycles, "orchestration done");
                return Ok(OrchestrationReport {
                    final_phase: Phase::Done,
                    cycles,
                    open_issues: Vec::new(),
                });
            };

            cycle += 1;
            cycles += 1;
            tracing::info!(cycle, issue = %top.issue, assignee = %top.assignee, priority = %top.priority, "selected issue");
            if let Err(e) = self.run_cycle(cycle, &top).await {
                tracing::warn!(cycle, issue = %top.issue, error = %format!("{:#}", e), "cycle failed");
                self.note(cycle, &top.issue, Phase::Selecting, &format!("cycle failed: {:#}", e));
            }
            budget -= 1;
        }

        let open_issues = self.open_issues()?;
        self.note(
            cycle,
            "",
            Phase::Exhausted,
            &format!("retry budget spent with {} open issue(s)", open_issues.len()),
        );
        tracing::warn!(cycles, open = open_issues.len(), "retry budget exhausted");
        Ok(OrchestrationReport {
            final_phase: Phase::Exhausted,
            cycles,
            open_issues,
        })
    }

    fn open_issues(&self) -> Result<Vec<IssueSummary>> {
        self.env
            .issues
            .list("", &ListFilter::open())
            .context("Failed to list open issues")
    }

    fn note(&self, cycle: u32, issue: &str, phase: Phase, outcome: &str) {
        if let Err(e) = self.journal.record(cycle, issue, phase, outcome) {
            tracing::warn!(error = %format!("{:#}", e), "could not write cycle journal");
        }
    }

    /// Ask the requester for new work. Returns false when none is offered.
    async fn solicit_request(&self, cycle: u32) -> Result<bool> {
        let answer = self
            .env
            .requester
            .ask("There are no open issues. What should the team work on next? (leave empty to stop)")
            .await
            .context("Failed to ask for a new request")?;
        let Some(text) = answer.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()) else {
            return Ok(false);
        };
        let mut issue = NewIssue::parse(&text);
        issue.assignee.get_or_insert_with(|| UNASSIGNED.to_string());
        let path = self
            .env
            .issues
            .create("", issue, &self.name)
            .context("Failed to create an issue for the new request")?;
        self.note(cycle, &path.to_string(), Phase::Selecting, "created from a new request");
        Ok(true)
    }

    fn is_assignable(&self, assignee: &str) -> bool {
        let assignee = assignee.trim();
        !assignee.is_empty()
            && assignee != UNKNOWN
            && assignee != UNASSIGNED
            && assignee != self.name
            && self.registry.contains(assignee)
    }

    async fn run_cycle(&self, cycle: u32, top: &IssueSummary) -> Result<()> {
        let path: IssuePath = top.issue.parse()?;
        let worker = match self.registry.get(top.assignee.trim()) {
            Some(worker) if self.is_assignable(&top.assignee) => worker,
            _ => return self.reassign(cycle, top, &path).await,
        };

        self.note(cycle, &top.issue, Phase::Dispatching, &format!("sent to {}", top.assignee));
        let before = self.env.issues.read(&top.issue)?;
        let prompt = dispatch_prompt(top);
        let reply = worker
            .perform_task(&prompt, &self.name, &TaskContext::for_issue(path.clone()))
            .await;
        if !reply.is_success() {
            self.note(cycle, &top.issue, Phase::Evaluating, &format!("dispatch failed: {}", reply.text()));
            return Ok(());
        }
        let text = reply.text();

        let score = self.judge.score(self.meta.as_ref(), &prompt, &text).await;
        let accepted = self.judge.accepts(&score);
        self.record_feedback(&top.assignee, &score, accepted);
        if !accepted {
            self.note(
                cycle,
                &top.issue,
                Phase::Evaluating,
                &format!("rejected with score {:.1}: {}", score.score, score.explanation),
            );
            return Ok(());
        }
        self.note(cycle, &top.issue, Phase::Evaluating, &format!("accepted with score {:.1}", score.score));

        let mut notes = self.apply_code(&path, &top.assignee, &text).await;
        if score.contains_patch && notes.is_empty() {
            tracing::debug!(issue = %top.issue, "judge saw code but no file could be identified");
        }

        let complete = self
            .judge
            .is_true(
                self.meta.as_ref(),
                "The reply fully resolves the issue and any code it describes works",
                &prompt,
                &text,
            )
            .await;
        let complete = self.judge.confident_yes(&complete);
        if let Some(note) = self.update_on_behalf(top, &before, &text, complete)? {
            notes.push(note);
        }

        let detail = self.env.issues.read(&top.issue)?;
        let stage = Stage::infer(&detail.latest_text());
        notes.push(self.follow_stage(stage, &detail, &path, &prompt, &text).await);

        self.note(cycle, &top.issue, Phase::Updating, &notes.join("; "));
        Ok(())
    }

    async fn reassign(&self, cycle: u32, top: &IssueSummary, path: &IssuePath) -> Result<()> {
        self.note(
            cycle,
            &top.issue,
            Phase::Reassigning,
            &format!("assignee '{}' is not an available worker", top.assignee),
        );
        let prompt = format!(
            "Issue {issue} is assigned to '{assignee}', who cannot work on it. It is about: {title}. \
             Review it with issue_manager(action='read', issue='{issue}') and assign it to the single \
             best suited worker with issue_manager(action='assign', issue='{issue}', assignee=<worker>). \
             The workers and their roles are:\n{roles}",
            issue = top.issue,
            assignee = top.assignee,
            title = top.title,
            roles = self.roster_roles,
        );
        let reply = self
            .meta
            .perform_task(&prompt, &self.name, &TaskContext::for_issue(path.clone()))
            .await;
        if !reply.is_success() {
            tracing::warn!(issue = %top.issue, reason = %reply.text(), "reassignment request failed");
        }

        let after = self.env.issues.read(&top.issue)?;
        if self.is_assignable(&after.assignee) {
            tracing::info!(issue = %top.issue, assignee = %after.assignee, "issue reassigned");
        } else {
            tracing::warn!(issue = %top.issue, assignee = %after.assignee, "issue still has no valid assignee");
        }
        Ok(())
    }

    fn record_feedback(&self, worker: &str, score: &ResponseScore, accepted: bool) {
        let instructions = if accepted { "" } else { score.explanation.as_str() };
        if let Err(e) = self.env.feedback.record(worker, &self.name, score.score, instructions) {
            tracing::warn!(worker, error = %format!("{:#}", e), "could not record feedback");
        }
    }

    /// Apply diffs from the reply directly; hand named code blocks to the meta
    /// worker to save. Returns one note per file touched.
    async fn apply_code(&self, path: &IssuePath, assignee: &str, text: &str) -> Vec<String> {
        let diffs = extract_diffs(text);
        let mut notes = Vec::new();
        for diff in &diffs {
            let applied = resolve(&self.env.project_dir, &diff.path)
                .and_then(|file| apply_unified_diff(&file, &diff.hunks).map_err(anyhow::Error::from));
            match applied {
                Ok(summary) => {
                    tracing::info!(file = %diff.path, added = summary.added, removed = summary.removed, "applied diff from reply");
                    notes.push(format!("patched {}", diff.path));
                }
                Err(e) => {
                    tracing::warn!(file = %diff.path, error = %format!("{:#}", e), "diff from reply not applied");
                    notes.push(format!("diff for {} not applied: {:#}", diff.path, e));
                }
            }
        }
        if !diffs.is_empty() {
            return notes;
        }

        let files: Vec<String> = extract_code_blocks(text)
            .into_iter()
            .filter(|b| !b.is_diff())
            .filter_map(|b| b.filename)
            .collect();
        if files.is_empty() {
            return notes;
        }
        let prompt = format!(
            "{assignee} wrote code for issue {path} in these files: {files}. Save each code block below \
             to its file with overwrite_file (force=true) and reply with the files written.\n\n{text}",
            files = files.join(", "),
        );
        let reply = self
            .meta
            .perform_task(&prompt, &self.name, &TaskContext::for_issue(path.clone()))
            .await;
        if !reply.is_success() {
            notes.push(format!("saving code failed: {}", reply.text()));
        }
        for file in files {
            match resolve(&self.env.project_dir, &file) {
                Ok(target) if target.is_file() => notes.push(format!("saved {}", file)),
                _ => {
                    tracing::warn!(issue = %path, file = %file, "file missing after saving code");
                    notes.push(format!("{} missing after save", file));
                }
            }
        }
        notes
    }

    /// Write an update when the worker left the issue untouched, and close
    /// it when the judge is confident it is done.
    fn update_on_behalf(
        &self,
        top: &IssueSummary,
        before: &IssueDetail,
        text: &str,
        complete: bool,
    ) -> Result<Option<String>> {
        let after = self.env.issues.read(&top.issue)?;
        if after.status.is_terminal() {
            return Ok(Some("worker completed the issue".to_string()));
        }
        let worker_updated = after
            .record
            .updates
            .iter()
            .skip(before.record.updates.len())
            .any(|u| u.updated_by != self.name);

        let status = if complete {
            Some(Status::Completed)
        } else if after.status == Status::New {
            Some(Status::InProgress)
        } else {
            None
        };
        let details = (!worker_updated).then(|| {
            Value::String(format!(
                "{} replied: {}",
                top.assignee,
                truncate_chars(text, REPLY_DETAILS_LIMIT)
            ))
        });
        if status.is_none() && details.is_none() {
            return Ok(None);
        }

        let draft = UpdateDraft {
            status: status.clone(),
            details,
            ..UpdateDraft::default()
        };
        match self.env.issues.update(&top.issue, draft, &self.name) {
            Ok(()) => Ok(Some(match status {
                Some(status) => format!("status set to {}", status),
                None => "recorded reply on the issue".to_string(),
            })),
            Err(e @ IssueError::Conflict { .. }) => {
                tracing::warn!(issue = %top.issue, error = %e, "issue closed while updating");
                Ok(Some("issue was already completed".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn follow_stage(
        &self,
        stage: Stage,
        detail: &IssueDetail,
        path: &IssuePath,
        prompt: &str,
        text: &str,
    ) -> String {
        if stage == Stage::Plan {
            return self.decompose(detail, path).await;
        }

        let output = match self.stages.check(stage).await {
            StageCheck::Skipped => return format!("{} stage: no check configured", stage),
            StageCheck::Unavailable(e) => return format!("{} stage: check unavailable ({})", stage, e),
            StageCheck::Ran(output) if output.success() => return format!("{} check passed", stage),
            StageCheck::Ran(output) => output,
        };

        let mut description = output.report();
        if stage == Stage::Testing {
            let claim = self
                .judge
                .is_true(self.meta.as_ref(), "The reply claims the tests pass", prompt, text)
                .await;
            if self.judge.confident_yes(&claim) {
                description = format!("The reply claimed the tests pass, but the test run failed.\n\n{}", description);
            }
        }

        let label = capitalize(stage.as_str());
        if detail.record.title.starts_with(&format!("{} check failed", label)) {
            // already a failure issue: record the rerun instead of nesting
            let draft = UpdateDraft {
                details: Some(Value::String(description)),
                ..UpdateDraft::default()
            };
            return match self.env.issues.update(&detail.issue, draft, &self.name) {
                Ok(()) => format!("{} check still failing", stage),
                Err(e) => format!("{} check still failing; update failed: {}", stage, e),
            };
        }

        let failure = NewIssue {
            title: format!("{} check failed for issue {}", label, detail.issue),
            description,
            priority: Some(detail.priority.clone()),
            assignee: Some(detail.assignee.clone()),
            ..NewIssue::default()
        };
        match ensure_sub_issue(&self.env.issues, path, failure, &self.name) {
            Ok(Some(created)) => format!("{} check failed; opened {}", stage, created),
            Ok(None) => format!("{} check failed; sub-issue already open", stage),
            Err(e) => {
                tracing::warn!(issue = %detail.issue, error = %format!("{:#}", e), "could not open failure sub-issue");
                format!("{} check failed; could not open sub-issue", stage)
            }
        }
    }

    async fn decompose(&self, detail: &IssueDetail, path: &IssuePath) -> String {
        if detail.status.is_terminal() {
            return "plan stage: issue completed".to_string();
        }
        let existing = self.env.issues.children(path).map(|c| c.len()).unwrap_or(0);
        if existing > 0 {
            return format!("plan stage: {} sub-issue(s) already exist", existing);
        }
        let prompt = format!(
            "Issue {issue} ({title}) is still at the planning stage. Break it into specific sub issues \
             with issue_manager(action='create', issue='{issue}') and assign each one to the best suited \
             worker. The workers and their roles are:\n{roles}",
            issue = detail.issue,
            title = detail.record.title,
            roles = self.roster_roles,
        );
        let reply = self
            .meta
            .perform_task(&prompt, &self.name, &TaskContext::for_issue(path.clone()))
            .await;
        if !reply.is_success() {
            tracing::warn!(issue = %detail.issue, reason = %reply.text(), "decomposition request failed");
        }
        let created = self.env.issues.children(path).map(|c| c.len()).unwrap_or(0);
        format!("plan stage: {} sub-issue(s) after decomposition", created)
    }
}

fn dispatch_prompt(top: &IssueSummary) -> String {
    format!(
        "Issue {issue} is assigned to you and is in {status} status, it is about {title}. Review its \
         details with issue_manager(action='read', issue='{issue}'). If it is specific enough to be \
         coded, write the code, then update the issue with what you did. If it is not clear and \
         specific enough, describe it in more detail and create more specific sub issues for coding.",
        issue = top.issue,
        status = top.status,
        title = top.title,
    )
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
