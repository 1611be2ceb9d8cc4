use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

/// Where the scheduling loop is within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Selecting,
    Dispatching,
    Evaluating,
    Updating,
    Reassigning,
    /// No open issues and no new request.
    Done,
    /// Global retry budget spent.
    Exhausted,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Selecting => "selecting",
            Self::Dispatching => "dispatching",
            Self::Evaluating => "evaluating",
            Self::Updating => "updating",
            Self::Reassigning => "reassigning",
            Self::Done => "done",
            Self::Exhausted => "exhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Exhausted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "selecting" => Ok(Self::Selecting),
            "dispatching" => Ok(Self::Dispatching),
            "evaluating" => Ok(Self::Evaluating),
            "updating" => Ok(Self::Updating),
            "reassigning" => Ok(Self::Reassigning),
            "done" => Ok(Self::Done),
            "exhausted" => Ok(Self::Exhausted),
            other => Err(format!("unknown phase: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub cycle: u32,
    /// Empty when the cycle had no issue (e.g. the board was empty).
    pub issue: String,
    pub phase: Phase,
    pub outcome: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only record of orchestration cycles.
/// Format: cycle|issue|phase|outcome|timestamp
pub struct CycleJournal {
    state_file: PathBuf,
}

impl CycleJournal {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn record(&self, cycle: u32, issue: &str, phase: Phase, outcome: &str) -> Result<()> {
        let outcome: String = outcome
            .chars()
            .map(|c| if c == '|' || c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        let entry = format!(
            "{}|{}|{}|{}|{}\n",
            cycle,
            issue,
            phase,
            outcome.trim(),
            Utc::now().to_rfc3339()
        );

        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.state_file)
            .context("Failed to open state file")?
            .write_all(entry.as_bytes())
            .context("Failed to write state entry")?;

        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        if !self.state_file.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.state_file).context("Failed to read state file")?;

        Ok(content
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.split('|').collect();
                if parts.len() != 5 {
                    return None;
                }
                Some(JournalEntry {
                    cycle: parts[0].parse().ok()?,
                    issue: parts[1].to_string(),
                    phase: parts[2].parse().ok()?,
                    outcome: parts[3].to_string(),
                    timestamp: DateTime::parse_from_rfc3339(parts[4])
                        .ok()?
                        .with_timezone(&Utc),
                })
            })
            .collect())
    }

    /// Highest cycle number recorded, so a restarted loop keeps counting.
    pub fn last_cycle(&self) -> Result<u32> {
        Ok(self.entries()?.iter().map(|e| e.cycle).max().unwrap_or(0))
    }

    /// Entries for one issue, oldest first.
    pub fn issue_history(&self, issue: &str) -> Result<Vec<JournalEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.issue == issue)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_and_read_back() {
        let dir = tempdir().unwrap();
        let journal = CycleJournal::new(dir.path().join(".sweteam/state"));
        journal.record(1, "3/1", Phase::Dispatching, "sent to backend_dev").unwrap();
        journal.record(1, "3/1", Phase::Updating, "accepted | score 8\nnext").unwrap();
        journal.record(2, "", Phase::Done, "no open issues").unwrap();

        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].phase, Phase::Updating);
        assert_eq!(entries[1].outcome, "accepted   score 8 next");
        assert_eq!(journal.last_cycle().unwrap(), 2);
        assert_eq!(journal.issue_history("3/1").unwrap().len(), 2);
    }

    #[test]
    fn test_missing_journal_is_empty() {
        let dir = tempdir().unwrap();
        let journal = CycleJournal::new(dir.path().join("state"));
        assert!(journal.entries().unwrap().is_empty());
        assert_eq!(journal.last_cycle().unwrap(), 0);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("state");
        fs::write(&file, "garbage\n1|2|selecting|ok|not-a-time\n").unwrap();
        let journal = CycleJournal::new(file);
        journal.record(4, "2", Phase::Reassigning, "to pm").unwrap();
        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cycle, 4);
    }

    #[test]
    fn test_phase_round_trips_through_text() {
        for phase in [Phase::Selecting, Phase::Evaluating, Phase::Exhausted] {
            assert_eq!(phase.to_string().parse::<Phase>(), Ok(phase));
        }
        assert!(Phase::Done.is_terminal());
        assert!(!Phase::Updating.is_terminal());
    }
}
