//! Worker run state machine.
//!
//! A run moves `queued -> in_progress -> (requires_action -> in_progress)*`
//! and ends `completed`, `failed` or `expired`. [`next_step`] maps an
//! observed snapshot plus the remaining retry budget to the action the
//! dispatcher takes next; it performs no I/O.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

static RETRY_AFTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)try again in (\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|sec|seconds?)")
        .expect("valid retry-after regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    InProgress,
    RequiresAction,
    Completed,
    Failed,
    Expired,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// The run still occupies its worker.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::InProgress | Self::RequiresAction)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    /// Backend statuses outside the core set collapse onto it:
    /// `cancelling` is still active, `cancelled`/`incomplete` are failures.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" | "cancelling" => Ok(Self::InProgress),
            "requires_action" => Ok(Self::RequiresAction),
            "completed" => Ok(Self::Completed),
            "failed" | "cancelled" | "incomplete" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// A tool invocation requested by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text as produced by the model.
    pub arguments: String,
}

/// Error reported by the backend for a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunError {
    pub code: String,
    pub message: String,
}

impl RunError {
    pub fn is_rate_limit(&self) -> bool {
        self.code == "rate_limit_exceeded" || self.message.to_lowercase().contains("rate limit")
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// What the backend reported about a run at one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    pub id: String,
    pub state: RunState,
    pub tool_calls: Vec<ToolCall>,
    pub last_error: Option<RunError>,
}

impl RunSnapshot {
    pub fn new(id: impl Into<String>, state: RunState) -> Self {
        Self {
            id: id.into(),
            state,
            tool_calls: Vec::new(),
            last_error: None,
        }
    }
}

/// Next action for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Sleep one poll interval and look again.
    Wait,
    /// Execute the requested tools and submit their outputs.
    RunTools(Vec<ToolCall>),
    /// Collect the reply messages.
    Collect,
    /// Start a fresh run on the same conversation after `backoff`.
    Retry { backoff: Option<Duration> },
    /// No retries left.
    GiveUp,
}

/// Pure transition function over an observed run.
pub fn next_step(snapshot: &RunSnapshot, retries_remaining: u32, rate_limit_fallback: Duration) -> Step {
    match snapshot.state {
        RunState::Queued | RunState::InProgress => Step::Wait,
        RunState::RequiresAction if snapshot.tool_calls.is_empty() => Step::Wait,
        RunState::RequiresAction => Step::RunTools(snapshot.tool_calls.clone()),
        RunState::Completed => Step::Collect,
        RunState::Failed | RunState::Expired => {
            if retries_remaining == 0 {
                return Step::GiveUp;
            }
            let backoff = snapshot
                .last_error
                .as_ref()
                .filter(|e| e.is_rate_limit())
                .map(|e| parse_retry_after(&e.message).unwrap_or(rate_limit_fallback));
            Step::Retry { backoff }
        }
    }
}

/// Parse "try again in N seconds" (or milliseconds) from an error message.
pub fn parse_retry_after(message: &str) -> Option<Duration> {
    let caps = RETRY_AFTER_RE.captures(message)?;
    let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_lowercase();
    if unit.starts_with("ms") || unit.starts_with("milli") {
        Some(Duration::from_secs_f64(amount / 1000.0))
    } else {
        Some(Duration::from_secs_f64(amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FALLBACK: Duration = Duration::from_secs(15);

    fn failed(message: &str, code: &str) -> RunSnapshot {
        RunSnapshot {
            id: "run_1".into(),
            state: RunState::Failed,
            tool_calls: vec![],
            last_error: Some(RunError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    #[test]
    fn test_active_states_wait() {
        for state in [RunState::Queued, RunState::InProgress] {
            assert_eq!(next_step(&RunSnapshot::new("r", state), 3, FALLBACK), Step::Wait);
        }
        // requires_action without calls is a transient backend view
        assert_eq!(
            next_step(&RunSnapshot::new("r", RunState::RequiresAction), 3, FALLBACK),
            Step::Wait
        );
    }

    #[test]
    fn test_requires_action_runs_tools() {
        let mut snap = RunSnapshot::new("r", RunState::RequiresAction);
        snap.tool_calls.push(ToolCall {
            id: "call_1".into(),
            name: "read_file".into(),
            arguments: "{}".into(),
        });
        match next_step(&snap, 3, FALLBACK) {
            Step::RunTools(calls) => assert_eq!(calls[0].name, "read_file"),
            other => panic!("expected RunTools, got {:?}", other),
        }
    }

    #[test]
    fn test_completed_collects() {
        assert_eq!(
            next_step(&RunSnapshot::new("r", RunState::Completed), 0, FALLBACK),
            Step::Collect
        );
    }

    #[test]
    fn test_failure_retries_without_backoff() {
        assert_eq!(
            next_step(&failed("server error", "server_error"), 2, FALLBACK),
            Step::Retry { backoff: None }
        );
        let expired = RunSnapshot::new("r", RunState::Expired);
        assert_eq!(next_step(&expired, 1, FALLBACK), Step::Retry { backoff: None });
    }

    #[test]
    fn test_rate_limit_backoff_from_message() {
        let snap = failed(
            "Rate limit reached for gpt-4o. Please try again in 5 seconds.",
            "rate_limit_exceeded",
        );
        assert_eq!(
            next_step(&snap, 2, FALLBACK),
            Step::Retry {
                backoff: Some(Duration::from_secs(5))
            }
        );
    }

    #[test]
    fn test_rate_limit_backoff_fallback() {
        let snap = failed("Rate limit exceeded", "rate_limit_exceeded");
        assert_eq!(
            next_step(&snap, 2, FALLBACK),
            Step::Retry {
                backoff: Some(FALLBACK)
            }
        );
    }

    #[test]
    fn test_exhausted_gives_up() {
        assert_eq!(next_step(&failed("x", ""), 0, FALLBACK), Step::GiveUp);
    }

    #[test]
    fn test_parse_retry_after_units() {
        assert_eq!(
            parse_retry_after("Try again in 20 seconds"),
            Some(Duration::from_secs(20))
        );
        assert_eq!(
            parse_retry_after("please try again in 1.5s"),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            parse_retry_after("try again in 250ms"),
            Some(Duration::from_millis(250))
        );
        assert_eq!(parse_retry_after("no hint here"), None);
    }

    #[test]
    fn test_run_state_parse_and_display() {
        assert_eq!("requires_action".parse::<RunState>(), Ok(RunState::RequiresAction));
        assert_eq!("cancelled".parse::<RunState>(), Ok(RunState::Failed));
        assert!("bogus".parse::<RunState>().is_err());
        assert_eq!(RunState::InProgress.to_string(), "in_progress");
        assert!(RunState::RequiresAction.is_active());
        assert!(RunState::Expired.is_terminal());
    }
}
