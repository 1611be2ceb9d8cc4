//! Worker evaluations.
//!
//! Each evaluation is appended to `<dir>/<worker>.feedback.yaml` as one YAML
//! sequence item, so the file is always a valid list. The latest additional
//! instructions ride along with the worker's next run, and the accumulated
//! performance factor scales its temperature.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const MIN_FACTOR: f64 = 0.5;
const MAX_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub timestamp: DateTime<Utc>,
    pub evaluated_by: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub additional_instructions: String,
}

#[derive(Debug, Clone, Default)]
struct Standing {
    factor: f64,
    instructions: Option<String>,
}

impl Standing {
    fn from_history(history: &[Evaluation]) -> Self {
        let mut standing = Standing {
            factor: 1.0,
            instructions: None,
        };
        for evaluation in history {
            standing.apply(evaluation);
        }
        standing
    }

    fn apply(&mut self, evaluation: &Evaluation) {
        self.factor = (self.factor * (1.0 + evaluation.score.min(10.0) / 100.0)).clamp(MIN_FACTOR, MAX_FACTOR);
        if !evaluation.additional_instructions.trim().is_empty() {
            self.instructions = Some(evaluation.additional_instructions.clone());
        }
    }
}

pub struct FeedbackLog {
    dir: PathBuf,
    standings: Mutex<HashMap<String, Standing>>,
}

impl FeedbackLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            standings: Mutex::new(HashMap::new()),
        }
    }

    fn file_for(&self, worker: &str) -> PathBuf {
        self.dir.join(format!("{}.feedback.yaml", worker))
    }

    /// All evaluations recorded for `worker`, oldest first.
    pub fn history(&self, worker: &str) -> Result<Vec<Evaluation>> {
        read_history(&self.file_for(worker))
    }

    fn standing(&self, worker: &str) -> Standing {
        let mut standings = self.standings.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = standings.get(worker) {
            return s.clone();
        }
        let history = match self.history(worker) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(worker, error = %e, "ignoring unreadable feedback file");
                Vec::new()
            }
        };
        let standing = Standing::from_history(&history);
        standings.insert(worker.to_string(), standing.clone());
        standing
    }

    pub fn performance_factor(&self, worker: &str) -> f64 {
        self.standing(worker).factor
    }

    pub fn latest_instructions(&self, worker: &str) -> Option<String> {
        self.standing(worker).instructions
    }

    /// Append an evaluation and return the worker's new performance factor.
    pub fn record(&self, worker: &str, evaluated_by: &str, score: f64, additional_instructions: &str) -> Result<f64> {
        let evaluation = Evaluation {
            timestamp: Utc::now(),
            evaluated_by: evaluated_by.to_string(),
            score,
            additional_instructions: additional_instructions.trim().to_string(),
        };

        // Prime the cache from disk before appending.
        let mut standing = self.standing(worker);

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create feedback directory {}", self.dir.display()))?;
        let path = self.file_for(worker);
        let yaml = serde_yaml::to_string(&[&evaluation]).context("Failed to serialize evaluation")?;
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?
            .write_all(yaml.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;

        standing.apply(&evaluation);
        let factor = standing.factor;
        self.standings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker.to_string(), standing);
        tracing::info!(worker, evaluated_by, score, factor, "recorded worker evaluation");
        Ok(factor)
    }
}

fn read_history(path: &Path) -> Result<Vec<Evaluation>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_new_worker_has_neutral_standing() {
        let dir = tempdir().unwrap();
        let log = FeedbackLog::new(dir.path());
        assert_eq!(log.performance_factor("pm"), 1.0);
        assert_eq!(log.latest_instructions("pm"), None);
    }

    #[test]
    fn test_record_appends_valid_yaml_list() {
        let dir = tempdir().unwrap();
        let log = FeedbackLog::new(dir.path().join("feedback"));
        log.record("backend_dev", "orchestrator", 8.0, "write tests first").unwrap();
        log.record("backend_dev", "pm", 4.0, "").unwrap();

        let history = log.history("backend_dev").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].evaluated_by, "orchestrator");
        assert_eq!(history[1].score, 4.0);
        assert!(dir.path().join("feedback/backend_dev.feedback.yaml").is_file());
    }

    #[test]
    fn test_factor_compounds_and_caps_score() {
        let dir = tempdir().unwrap();
        let log = FeedbackLog::new(dir.path());
        let f1 = log.record("sre", "orchestrator", 50.0, "").unwrap();
        assert!((f1 - 1.10).abs() < 1e-9);
        let f2 = log.record("sre", "orchestrator", 5.0, "").unwrap();
        assert!((f2 - 1.10 * 1.05).abs() < 1e-9);
    }

    #[test]
    fn test_latest_instructions_skip_blank() {
        let dir = tempdir().unwrap();
        let log = FeedbackLog::new(dir.path());
        log.record("tester", "pm", 6.0, "run the full suite").unwrap();
        log.record("tester", "pm", 7.0, "  ").unwrap();
        assert_eq!(log.latest_instructions("tester").as_deref(), Some("run the full suite"));
    }

    #[test]
    fn test_standing_survives_restart() {
        let dir = tempdir().unwrap();
        FeedbackLog::new(dir.path())
            .record("pm", "orchestrator", 10.0, "be concise")
            .unwrap();
        let reopened = FeedbackLog::new(dir.path());
        assert!((reopened.performance_factor("pm") - 1.10).abs() < 1e-9);
        assert_eq!(reopened.latest_instructions("pm").as_deref(), Some("be concise"));
    }
}
