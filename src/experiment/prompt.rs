//! Operator questions
//!
//! The run pauses at a few points for a person at the bench to confirm a
//! physical step. [`OperatorPrompt`] abstracts where the answer comes from.

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    Exit,
}

impl Answer {
    /// Parse `y`/`yes`, `n`/`no`, `e`/`exit`, ignoring case and whitespace
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Some(Answer::Yes),
            "n" | "no" => Some(Answer::No),
            "e" | "exit" => Some(Answer::Exit),
            _ => None,
        }
    }
}

#[async_trait]
pub trait OperatorPrompt: Send {
    async fn ask(&mut self, question: &str) -> AppResult<Answer>;
}

/// Reads answers from stdin, asking again until one parses
#[derive(Debug, Default)]
pub struct ConsolePrompt;

#[async_trait]
impl OperatorPrompt for ConsolePrompt {
    async fn ask(&mut self, question: &str) -> AppResult<Answer> {
        let question = question.to_string();
        tokio::task::spawn_blocking(move || -> AppResult<Answer> {
            let stdin = std::io::stdin();
            let mut stdout = std::io::stdout();
            loop {
                write!(stdout, "{} [Yes/No/Exit]: ", question)?;
                stdout.flush()?;

                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    // Closed stdin cannot answer; treat as an abort.
                    return Ok(Answer::Exit);
                }
                match Answer::parse(&line) {
                    Some(answer) => return Ok(answer),
                    None => writeln!(stdout, "Please answer Yes, No or Exit.")?,
                }
            }
        })
        .await
        .map_err(|e| DaqError::Aborted(format!("prompt task failed: {}", e)))?
    }
}

/// Replays a fixed list of answers; answers `Exit` once the list runs out
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: VecDeque<Answer>,
    asked: Vec<String>,
}

impl ScriptedPrompt {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            asked: Vec::new(),
        }
    }

    /// Questions asked so far
    pub fn asked(&self) -> &[String] {
        &self.asked
    }
}

#[async_trait]
impl OperatorPrompt for ScriptedPrompt {
    async fn ask(&mut self, question: &str) -> AppResult<Answer> {
        self.asked.push(question.to_string());
        let answer = match self.answers.pop_front() {
            Some(answer) => answer,
            None => {
                warn!(question, "No scripted answer left, answering Exit");
                Answer::Exit
            }
        };
        info!(question, ?answer, "Scripted operator answer");
        Ok(answer)
    }
}

/// Unattended runs: every confirmation is given
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysYes;

#[async_trait]
impl OperatorPrompt for AlwaysYes {
    async fn ask(&mut self, question: &str) -> AppResult<Answer> {
        info!(question, "Unattended run, answering Yes");
        Ok(Answer::Yes)
    }
}
