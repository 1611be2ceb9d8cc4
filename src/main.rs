use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sweteam::config::{CliOverrides, Config};

mod cmd;

#[derive(Parser)]
#[command(name = "sweteam")]
#[command(version, about = "Issue-driven orchestrator for a team of AI software workers")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Workspace holding `.sweteam/`, the issue board and the code directory
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduling loop over the issue board
    Orchestrate {
        /// Global cycle budget. Overrides sweteam.toml and SWETEAM_RETRY_COUNT.
        #[arg(long)]
        retry_count: Option<u32>,
    },
    /// Work with the issue board directly
    Issue {
        #[command(subcommand)]
        command: IssueCommands,
    },
    /// Apply unified diffs to files
    Diff {
        #[command(subcommand)]
        command: DiffCommands,
    },
    /// Show or update the planned directory structure
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum IssueCommands {
    /// List issues, open ones by default
    List {
        /// Only issues under this path
        #[arg(long, default_value = "")]
        root: String,
        /// Status to include (repeatable)
        #[arg(long = "status")]
        statuses: Vec<String>,
        /// Include every status
        #[arg(long, conflicts_with = "statuses")]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Create an issue, or a sub-issue with --parent
    Create {
        #[arg(long, default_value = "")]
        parent: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long)]
        priority: Option<String>,
    },
    /// Show an issue with its update log
    Read {
        issue: String,
        #[arg(long)]
        json: bool,
    },
    /// Append an update to an issue
    Update {
        issue: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        /// Free text, or JSON
        #[arg(long)]
        details: Option<String>,
    },
    /// Reassign an issue to a worker on the roster
    Assign { issue: String, assignee: String },
}

#[derive(Subcommand, Clone)]
pub enum DiffCommands {
    /// Apply a unified diff to FILE
    Apply {
        file: PathBuf,
        /// File holding the diff; read from stdin when omitted
        #[arg(long)]
        diff: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone)]
pub enum PlanCommands {
    /// Print the planned tree merged with what is on disk
    Show {
        /// Only the directory scan
        #[arg(long)]
        actual_only: bool,
    },
    /// Merge a YAML tree patch into the plan
    Update { patch: PathBuf },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default sweteam.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    // a missing .env is fine
    let _ = dotenvy::from_path(workspace.join(".env"));

    let overrides = CliOverrides {
        retry_count: match &cli.command {
            Commands::Orchestrate { retry_count } => *retry_count,
            _ => None,
        },
        verbose: cli.verbose,
    };

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&workspace, &overrides, command.clone());
    }

    let config = Config::resolve(&workspace, |key| std::env::var(key).ok(), &overrides)
        .context("Invalid configuration")?;
    let log_dir = match (&cli.command, config.settings.logging.file) {
        (Commands::Orchestrate { .. }, true) => Some(config.log_dir()),
        _ => None,
    };
    let _guard = sweteam::logging::init(&config.settings.logging.level, log_dir.as_deref())?;
    for warning in &config.warnings {
        tracing::warn!("{}", warning);
    }

    match cli.command {
        Commands::Orchestrate { .. } => cmd::cmd_orchestrate(&config).await?,
        Commands::Issue { command } => cmd::cmd_issue(&config, command)?,
        Commands::Diff { command } => cmd::cmd_diff(command)?,
        Commands::Plan { command } => cmd::cmd_plan(&config, command)?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
