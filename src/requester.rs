//! External requester channel.
//!
//! The orchestrator asks the requester for a new top-level request whenever
//! the board has no open issues, and workers reach it through the
//! `get_human_input` tool for clarifications.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dialoguer::{Input, theme::ColorfulTheme};

#[async_trait]
pub trait Requester: Send + Sync {
    /// Ask a question. `None` means no answer is offered.
    async fn ask(&self, prompt: &str) -> Result<Option<String>>;
}

/// Prompts on the terminal. An empty answer or one of `quit`/`exit`/`q`
/// means no further requests.
pub struct ConsoleRequester;

const STOP_WORDS: &[&str] = &["q", "quit", "exit"];

#[async_trait]
impl Requester for ConsoleRequester {
    async fn ask(&self, prompt: &str) -> Result<Option<String>> {
        let prompt = prompt.to_string();
        let answer: String = tokio::task::spawn_blocking(move || {
            Input::<String>::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()
        })
        .await
        .context("Console prompt task panicked")?
        .context("Failed to read user input")?;

        let answer = answer.trim();
        if answer.is_empty() || STOP_WORDS.contains(&answer.to_lowercase().as_str()) {
            return Ok(None);
        }
        Ok(Some(answer.to_string()))
    }
}

/// Answers every question with nothing. Used when stdin is not a terminal.
pub struct SilentRequester;

#[async_trait]
impl Requester for SilentRequester {
    async fn ask(&self, prompt: &str) -> Result<Option<String>> {
        tracing::info!(prompt, "no interactive requester, treating as no answer");
        Ok(None)
    }
}

/// Pick the console requester when attached to a terminal.
pub fn default_requester() -> Box<dyn Requester> {
    if console::Term::stdout().is_term() {
        Box::new(ConsoleRequester)
    } else {
        Box::new(SilentRequester)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned answers, then `None`.
    #[derive(Default)]
    pub struct ScriptedRequester {
        answers: Mutex<VecDeque<String>>,
        pub asked: Mutex<Vec<String>>,
    }

    impl ScriptedRequester {
        pub fn new(answers: &[&str]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().map(|s| s.to_string()).collect()),
                asked: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Requester for ScriptedRequester {
        async fn ask(&self, prompt: &str) -> Result<Option<String>> {
            self.asked.lock().unwrap().push(prompt.to_string());
            Ok(self.answers.lock().unwrap().pop_front())
        }
    }
}
