//! Layered configuration for sweteam.
//!
//! Settings are read from `.sweteam/sweteam.toml` under the workspace
//! directory, then overridden by environment variables (a `.env` file is
//! loaded first), then by CLI flags. Every section is optional.
//!
//! ```toml
//! [project]
//! name = "todo_app"
//! issue_board_dir = "issue_board"
//!
//! [orchestrator]
//! retry_count = 10
//! accept_threshold = 5.0
//!
//! [dispatch]
//! poll_interval_ms = 500
//! run_timeout_secs = 300
//!
//! [backend]
//! model = "gpt-4o"
//!
//! [stages]
//! testing = ["python3", "-m", "pytest", "-q"]
//!
//! [[workers]]
//! name = "backend_dev"
//! role = "write server code"
//! instructions = "You are the backend developer."
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;
use crate::orchestrator::StageCommands;
use crate::planner::DEFAULT_EXCLUDES;
use crate::worker::http::BackendSettings;
use crate::worker::{DispatchSettings, WorkerConfig, default_roster};

pub const CONFIG_DIR: &str = ".sweteam";
pub const CONFIG_FILE: &str = "sweteam.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSection {
    /// Name of the code directory inside the workspace.
    pub name: String,
    pub issue_board_dir: String,
    pub dir_structure_file: String,
    /// Glob patterns skipped when scanning the code directory.
    pub excludes: Vec<String>,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: "default_project".to_string(),
            issue_board_dir: "issue_board".to_string(),
            dir_structure_file: "dir_structure.yaml".to_string(),
            excludes: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub name: String,
    /// Global cycle budget.
    pub retry_count: u32,
    /// Replies scoring at or below this (0-10) are rejected.
    pub accept_threshold: f64,
    /// Confidence (0-100) needed before an issue is closed on the judge's word.
    pub completion_confidence: f64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            name: "orchestrator".to_string(),
            retry_count: 3,
            accept_threshold: 5.0,
            completion_confidence: 70.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub retry_count: u32,
    pub poll_interval_ms: u64,
    pub admission_wait_secs: u64,
    pub submit_attempts: u32,
    pub rate_limit_fallback_secs: u64,
    pub run_timeout_secs: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        let defaults = DispatchSettings::default();
        Self {
            retry_count: defaults.retry_count,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            admission_wait_secs: defaults.admission_wait.as_secs(),
            submit_attempts: defaults.submit_attempts,
            rate_limit_fallback_secs: defaults.rate_limit_fallback.as_secs(),
            run_timeout_secs: defaults.run_timeout.as_secs(),
        }
    }
}

impl DispatchSection {
    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            retry_count: self.retry_count,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            admission_wait: Duration::from_secs(self.admission_wait_secs),
            submit_attempts: self.submit_attempts.max(1),
            rate_limit_fallback: Duration::from_secs(self.rate_limit_fallback_secs),
            run_timeout: Duration::from_secs(self.run_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecSection {
    pub timeout_secs: u64,
    pub python: String,
}

impl Default for ExecSection {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            python: "python3".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Also write daily JSON logs under `.sweteam/logs`.
    pub file: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
        }
    }
}

/// The `sweteam.toml` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweteamToml {
    pub project: ProjectSection,
    pub orchestrator: OrchestratorSection,
    pub dispatch: DispatchSection,
    pub backend: BackendSettings,
    pub exec: ExecSection,
    pub stages: StageCommands,
    pub logging: LoggingSection,
    /// Replaces the built-in roster when non-empty.
    pub workers: Vec<WorkerConfig>,
}

impl SweteamToml {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `<workspace>/.sweteam/sweteam.toml`, or defaults when absent.
    pub fn load_or_default(workspace: &Path) -> Result<Self, ConfigError> {
        let path = config_path(workspace);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `SWETEAM_*` overrides. `lookup` is usually `std::env::var`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(name) = lookup("SWETEAM_PROJECT_NAME") {
            self.project.name = name;
        }
        if let Some(dir) = lookup("SWETEAM_ISSUE_BOARD_DIR") {
            self.project.issue_board_dir = dir;
        }
        if let Some(value) = lookup("SWETEAM_RETRY_COUNT") {
            self.orchestrator.retry_count = parse_count("SWETEAM_RETRY_COUNT", &value)?;
        }
        if let Some(level) = lookup("SWETEAM_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Hard errors for unusable names; soft problems come back as warnings.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        check_name("project.name", &self.project.name)?;
        check_name("project.issue_board_dir", &self.project.issue_board_dir)?;

        let mut warnings = Vec::new();
        if !(0.0..=10.0).contains(&self.orchestrator.accept_threshold) {
            warnings.push(format!(
                "orchestrator.accept_threshold {} is outside 0..=10; every reply will be {}",
                self.orchestrator.accept_threshold,
                if self.orchestrator.accept_threshold < 0.0 { "accepted" } else { "rejected" }
            ));
        }
        if !(0.0..=100.0).contains(&self.orchestrator.completion_confidence) {
            warnings.push(format!(
                "orchestrator.completion_confidence {} is outside 0..=100",
                self.orchestrator.completion_confidence
            ));
        }
        if self.orchestrator.retry_count == 0 {
            warnings.push("orchestrator.retry_count is 0; orchestrate will stop immediately".to_string());
        }
        for worker in &self.workers {
            let unknown = worker.unknown_tools();
            if !unknown.is_empty() {
                warnings.push(format!("worker '{}' declares unknown tools: {}", worker.name, unknown.join(", ")));
            }
            if worker.name == self.orchestrator.name {
                warnings.push(format!("worker '{}' has the orchestrator's name and will never be assigned work", worker.name));
            }
        }
        Ok(warnings)
    }
}

fn check_name(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let valid = !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidName {
            field,
            value: value.to_string(),
        })
    }
}

fn parse_count(field: &'static str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

pub fn config_path(workspace: &Path) -> PathBuf {
    workspace.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Overrides given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub retry_count: Option<u32>,
    pub verbose: bool,
}

/// Fully resolved configuration for one workspace.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: PathBuf,
    pub settings: SweteamToml,
    pub verbose: bool,
    pub warnings: Vec<String>,
}

impl Config {
    /// File, then environment, then CLI.
    pub fn resolve(
        workspace: &Path,
        lookup: impl Fn(&str) -> Option<String>,
        cli: &CliOverrides,
    ) -> Result<Self, ConfigError> {
        let mut settings = SweteamToml::load_or_default(workspace)?;
        settings.apply_env_overrides(lookup)?;
        if let Some(retry_count) = cli.retry_count {
            settings.orchestrator.retry_count = retry_count;
        }
        if cli.verbose {
            settings.logging.level = "debug".to_string();
        }
        let warnings = settings.validate()?;
        Ok(Self {
            workspace: workspace.to_path_buf(),
            settings,
            verbose: cli.verbose,
            warnings,
        })
    }

    pub fn sweteam_dir(&self) -> PathBuf {
        self.workspace.join(CONFIG_DIR)
    }

    /// Where workers read and write code.
    pub fn code_dir(&self) -> PathBuf {
        self.workspace.join(&self.settings.project.name)
    }

    pub fn issue_board_dir(&self) -> PathBuf {
        self.workspace.join(&self.settings.project.issue_board_dir)
    }

    pub fn dir_structure_file(&self) -> PathBuf {
        self.workspace.join(&self.settings.project.dir_structure_file)
    }

    pub fn feedback_dir(&self) -> PathBuf {
        self.sweteam_dir().join("feedback")
    }

    pub fn state_file(&self) -> PathBuf {
        self.sweteam_dir().join("state")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.sweteam_dir().join("logs")
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.exec.timeout_secs)
    }

    pub fn roster(&self) -> Vec<WorkerConfig> {
        if self.settings.workers.is_empty() {
            default_roster()
        } else {
            self.settings.workers.clone()
        }
    }
}
