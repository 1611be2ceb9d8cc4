//! Lightweight judging of worker replies through structured completions.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::worker::{StructuredRequest, Worker};

/// How well a reply addressed its prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseScore {
    /// 0 is a complete failure, 10 is excellent.
    pub score: f64,
    #[serde(default)]
    pub contains_patch: bool,
    #[serde(default)]
    pub issue_updated: bool,
    #[serde(default)]
    pub explanation: String,
}

impl ResponseScore {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            contains_patch: false,
            issue_updated: false,
            explanation: reason.into(),
        }
    }
}

/// A yes/no judgement with a 0-100 confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryAnswer {
    pub answer: bool,
    pub confidence: f64,
    #[serde(default)]
    pub explanation: String,
}

const JUDGE_SYSTEM: &str = "You review the work of software team members. \
Judge only what the reply shows; do not assume work that is not in it.";

fn score_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "score": {"type": "number", "description": "0 means complete failure, 10 means extremely well"},
            "contains_patch": {"type": "boolean", "description": "the reply contains code or a diff meant for a file"},
            "issue_updated": {"type": "boolean", "description": "the reply says the issue was updated"},
            "explanation": {"type": "string"}
        },
        "required": ["score", "contains_patch", "issue_updated", "explanation"],
        "additionalProperties": false
    })
}

fn binary_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "answer": {"type": "boolean"},
            "confidence": {"type": "number", "description": "0 to 100"},
            "explanation": {"type": "string"}
        },
        "required": ["answer", "confidence", "explanation"],
        "additionalProperties": false
    })
}

#[derive(Debug, Clone)]
pub struct Judge {
    /// Replies scoring at or below this are rejected.
    pub accept_threshold: f64,
    /// Minimum confidence for a positive binary answer to count.
    pub completion_confidence: f64,
}

impl Default for Judge {
    fn default() -> Self {
        Self {
            accept_threshold: 5.0,
            completion_confidence: 70.0,
        }
    }
}

impl Judge {
    pub fn new(accept_threshold: f64, completion_confidence: f64) -> Self {
        Self {
            accept_threshold,
            completion_confidence,
        }
    }

    pub fn score_request(&self, prompt: &str, reply: &str) -> StructuredRequest {
        StructuredRequest {
            model: None,
            system: JUDGE_SYSTEM.to_string(),
            prompt: format!(
                "Request:\n{}\n\nReply:\n{}\n\nBased on the request and the reply, how well did the reply \
                 address the request? Score from 0 (complete failure) to 10 (extremely well) and explain \
                 the score.",
                prompt, reply
            ),
            schema_name: "response_score".to_string(),
            schema: score_schema(),
        }
    }

    pub fn question_request(&self, question: &str, prompt: &str, reply: &str) -> StructuredRequest {
        StructuredRequest {
            model: None,
            system: JUDGE_SYSTEM.to_string(),
            prompt: format!(
                "Request:\n{}\n\nReply:\n{}\n\nAnswer whether '{}' is true or false, say from 0 to 100 how \
                 confident you are, and explain why.",
                prompt, reply, question
            ),
            schema_name: "binary_answer".to_string(),
            schema: binary_schema(),
        }
    }

    /// Score a reply. An evaluation that fails or is malformed scores 0.
    pub async fn score(&self, evaluator: &dyn Worker, prompt: &str, reply: &str) -> ResponseScore {
        let value = match evaluator.evaluate(&self.score_request(prompt, reply)).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "reply evaluation failed");
                return ResponseScore::failed(format!("evaluation failed: {:#}", e));
            }
        };
        match serde_json::from_value::<ResponseScore>(value) {
            Ok(mut score) => {
                score.score = score.score.clamp(0.0, 10.0);
                score
            }
            Err(e) => ResponseScore::failed(format!("evaluation was malformed: {}", e)),
        }
    }

    pub fn accepts(&self, score: &ResponseScore) -> bool {
        score.score > self.accept_threshold
    }

    /// Ask a yes/no question about a reply. Failures answer "no" with zero
    /// confidence.
    pub async fn is_true(&self, evaluator: &dyn Worker, question: &str, prompt: &str, reply: &str) -> BinaryAnswer {
        let no = |explanation: String| BinaryAnswer {
            answer: false,
            confidence: 0.0,
            explanation,
        };
        match evaluator.evaluate(&self.question_request(question, prompt, reply)).await {
            Ok(value) => serde_json::from_value(value).unwrap_or_else(|e| no(format!("answer was malformed: {}", e))),
            Err(e) => {
                tracing::warn!(question, error = %format!("{:#}", e), "binary judgement failed");
                no(format!("judgement failed: {:#}", e))
            }
        }
    }

    pub fn confident_yes(&self, answer: &BinaryAnswer) -> bool {
        answer.answer && answer.confidence >= self.completion_confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testing::FakeWorker;

    #[tokio::test]
    async fn test_score_is_clamped_and_thresholded() {
        let judge = Judge::default();
        let meta = FakeWorker::new("orchestrator")
            .judge(json!({"score": 14, "contains_patch": true, "issue_updated": false, "explanation": "great"}))
            .judge(json!({"score": 5, "contains_patch": false, "issue_updated": false, "explanation": "meh"}));

        let high = judge.score(&meta, "do it", "done").await;
        assert_eq!(high.score, 10.0);
        assert!(high.contains_patch);
        assert!(judge.accepts(&high));

        let borderline = judge.score(&meta, "do it", "maybe").await;
        assert!(!judge.accepts(&borderline));

        let request = &meta.evaluated.lock().unwrap()[0];
        assert_eq!(request.schema_name, "response_score");
        assert!(request.prompt.contains("Reply:\ndone"));
    }

    #[tokio::test]
    async fn test_failed_or_malformed_evaluation_rejects() {
        let judge = Judge::default();
        let meta = FakeWorker::new("orchestrator").judge(json!({"verdict": "fine"}));
        let malformed = judge.score(&meta, "p", "r").await;
        assert_eq!(malformed.score, 0.0);
        assert!(!judge.accepts(&malformed));

        let unavailable = judge.score(&meta, "p", "r").await;
        assert!(unavailable.explanation.starts_with("evaluation failed"));
    }

    #[tokio::test]
    async fn test_binary_answer_needs_confidence() {
        let judge = Judge::default();
        let meta = FakeWorker::new("orchestrator")
            .judge(json!({"answer": true, "confidence": 90, "explanation": "tests pass"}))
            .judge(json!({"answer": true, "confidence": 40, "explanation": "unclear"}));
        let sure = judge.is_true(&meta, "Is the issue complete?", "p", "r").await;
        assert!(judge.confident_yes(&sure));
        let unsure = judge.is_true(&meta, "Is the issue complete?", "p", "r").await;
        assert!(!judge.confident_yes(&unsure));
        let missing = judge.is_true(&meta, "Is the issue complete?", "p", "r").await;
        assert!(!missing.answer);
    }
}
