//! `sweteam orchestrate`: wire the team together and run the loop.

use anyhow::{Context, Result};
use std::sync::Arc;

use sweteam::config::Config;
use sweteam::exec::CommandRunner;
use sweteam::issues::IssueStore;
use sweteam::orchestrator::{Judge, Orchestrator, Phase};
use sweteam::planner::DirectoryPlanner;
use sweteam::requester::default_requester;
use sweteam::worker::config::roster_roles;
use sweteam::worker::http::AssistantsBackend;
use sweteam::worker::{
    DispatchedWorker, FeedbackLog, RunBackend, ToolEnv, Worker, WorkerRegistry, meta_worker,
};

pub async fn cmd_orchestrate(config: &Config) -> Result<()> {
    let settings = &config.settings;
    let code_dir = config.code_dir();
    std::fs::create_dir_all(&code_dir)
        .with_context(|| format!("Failed to create code directory {}", code_dir.display()))?;

    let backend: Arc<dyn RunBackend> =
        Arc::new(AssistantsBackend::new(&settings.backend).context("Failed to set up the worker backend")?);

    let roster = config.roster();
    let registry = Arc::new(WorkerRegistry::new());
    let env = Arc::new(ToolEnv {
        project_dir: code_dir.clone(),
        issues: IssueStore::new(config.issue_board_dir()),
        planner: DirectoryPlanner::new(
            settings.project.name.clone(),
            &code_dir,
            config.dir_structure_file(),
            &settings.project.excludes,
        ),
        exec: CommandRunner::new(&code_dir, config.exec_timeout(), settings.exec.python.clone()),
        requester: Arc::from(default_requester()),
        feedback: Arc::new(FeedbackLog::new(config.feedback_dir())),
        registry: Arc::downgrade(&registry),
        roster: roster.iter().map(|w| w.name.clone()).collect(),
    });

    let dispatch = settings.dispatch.settings();
    for worker in &roster {
        registry.register(Arc::new(DispatchedWorker::new(
            worker.clone(),
            backend.clone(),
            env.clone(),
            dispatch.clone(),
        )));
    }
    let meta: Arc<dyn Worker> = Arc::new(DispatchedWorker::new(
        meta_worker(&settings.orchestrator.name),
        backend,
        env.clone(),
        dispatch,
    ));

    tracing::info!(
        workspace = %config.workspace.display(),
        workers = %registry.names().join(", "),
        "team assembled"
    );

    let orchestrator = Orchestrator::new(meta, registry, env)
        .with_retry_count(settings.orchestrator.retry_count)
        .with_judge(Judge::new(
            settings.orchestrator.accept_threshold,
            settings.orchestrator.completion_confidence,
        ))
        .with_stage_commands(settings.stages.clone())
        .with_journal(config.state_file())
        .with_roster_roles(roster_roles(&roster));

    let report = orchestrator.run().await?;
    println!();
    println!("{}", report.render());
    if report.final_phase == Phase::Exhausted && !report.open_issues.is_empty() {
        println!();
        println!("Run 'sweteam orchestrate' again to continue, or raise --retry-count.");
    }
    Ok(())
}
