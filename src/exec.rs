//! External command execution.
//!
//! Used by the `run_command`/`run_module` worker tools and by the
//! orchestrator's stage checks (build, integration test, deploy dry run).

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::util::tail_lines;

/// Lines of stdout/stderr kept in reports.
const OUTPUT_TAIL_LINES: usize = 200;

/// Result of one command execution.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandOutput {
    pub command: String,
    /// Exit code; `None` when killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Plain-text report for workers and issue updates.
    pub fn report(&self) -> String {
        let status = if self.timed_out {
            "timed out".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            }
        };
        let mut report = format!("$ {}\n{}", self.command, status);
        if !self.stdout.trim().is_empty() {
            report.push_str("\nstdout:\n");
            report.push_str(self.stdout.trim_end());
        }
        if !self.stderr.trim().is_empty() {
            report.push_str("\nstderr:\n");
            report.push_str(self.stderr.trim_end());
        }
        report
    }
}

/// Runs commands in the project directory with a wall-clock timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    working_dir: PathBuf,
    timeout: Duration,
    python: String,
}

impl CommandRunner {
    pub fn new(working_dir: impl AsRef<Path>, timeout: Duration, python: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout,
            python: python.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run `program args...` to completion or timeout.
    pub async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let command_line = display_command(program, args);
        tracing::debug!(command = %command_line, cwd = %self.working_dir.display(), "running command");

        let child = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", command_line))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.with_context(|| format!("Failed to wait for command: {}", command_line))?,
            Err(_) => {
                // kill_on_drop reaps the child once the future is dropped
                tracing::warn!(command = %command_line, timeout_secs = self.timeout.as_secs(), "command timed out");
                return Ok(CommandOutput {
                    command: command_line,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("Command timed out after {} seconds", self.timeout.as_secs()),
                    timed_out: true,
                });
            }
        };

        let result = CommandOutput {
            command: command_line,
            exit_code: output.status.code(),
            stdout: tail_lines(&String::from_utf8_lossy(&output.stdout), OUTPUT_TAIL_LINES),
            stderr: tail_lines(&String::from_utf8_lossy(&output.stderr), OUTPUT_TAIL_LINES),
            timed_out: false,
        };
        tracing::debug!(command = %result.command, exit_code = ?result.exit_code, "command finished");
        Ok(result)
    }

    /// Start `program args...` in the background and return its pid.
    pub fn spawn_detached(&self, program: &str, args: &[String]) -> Result<u32> {
        let command_line = display_command(program, args);
        let child = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn background command: {}", command_line))?;
        let pid = child
            .id()
            .with_context(|| format!("Background command exited immediately: {}", command_line))?;
        tracing::info!(command = %command_line, pid, "started background command");
        Ok(pid)
    }

    /// `python -m module args...`, or call `module.method(*args)` when a
    /// method is given.
    pub async fn run_module(&self, module: &str, method: Option<&str>, args: &[String]) -> Result<CommandOutput> {
        let mut argv: Vec<String> = Vec::new();
        match method {
            Some(method) => {
                argv.push("-c".to_string());
                argv.push(
                    "import importlib, sys\n\
                     m = importlib.import_module(sys.argv[1])\n\
                     r = getattr(m, sys.argv[2])(*sys.argv[3:])\n\
                     print('' if r is None else r)"
                        .to_string(),
                );
                argv.push(module.to_string());
                argv.push(method.to_string());
            }
            None => {
                argv.push("-m".to_string());
                argv.push(module.to_string());
            }
        }
        argv.extend(args.iter().cloned());
        self.run(&self.python, &argv).await
    }
}

fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}
