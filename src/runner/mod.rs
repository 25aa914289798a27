//! Runner module - Grading abstraction layer
//!
//! This module provides a unified interface for grading one submission:
//! - `SubmissionGrader`: trait the coordinator dispatches through
//! - `IsolatedWorker`: runs the external grading engine in its own process group
//!
//! The runner module does NOT:
//! - Move archives between the working and error areas
//! - Build reports
//! - Know about LMS directory naming

pub mod isolated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::core::{GradingOutcome, QuestionResult, QuestionScores, SubmissionUnit};

pub const SUBMISSION_PLACEHOLDER: &str = "{submission}";
pub const AUTOGRADER_PLACEHOLDER: &str = "{autograder}";
pub const QUIET_PLACEHOLDER: &str = "{quiet}";
pub const DEBUG_PLACEHOLDER: &str = "{debug}";

/// Command template used to invoke the external grading engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineCommand {
    /// Program path or name
    pub program: String,
    /// Arguments, may contain placeholders
    pub args: Vec<String>,
    pub quiet: bool,
    pub debug: bool,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            quiet: true,
            debug: false,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self::new(program).with_args(iter.cloned())
    }

    /// Arguments with all placeholders substituted
    pub fn render_args(&self, submission: &Path, autograder: &Path) -> Vec<String> {
        let submission = submission.to_string_lossy();
        let autograder = autograder.to_string_lossy();
        let quiet = self.quiet.to_string();
        let debug = self.debug.to_string();

        self.args
            .iter()
            .map(|arg| {
                arg.replace(SUBMISSION_PLACEHOLDER, &submission)
                    .replace(AUTOGRADER_PLACEHOLDER, &autograder)
                    .replace(QUIET_PLACEHOLDER, &quiet)
                    .replace(DEBUG_PLACEHOLDER, &debug)
            })
            .collect()
    }
}

/// Message the engine writes as the last non-empty line of its stdout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReport {
    Graded { questions: Vec<QuestionResult> },
    Error { message: String },
}

impl WorkerReport {
    /// Extract the report from captured stdout. `None` if nothing was written.
    pub fn from_stdout(stdout: &str) -> Option<Result<Self, serde_json::Error>> {
        let line = stdout.lines().rev().find(|line| !line.trim().is_empty())?;
        Some(serde_json::from_str(line.trim()))
    }

    /// Convert into per-question scores, rejecting duplicates and invalid values
    pub fn into_scores(questions: Vec<QuestionResult>) -> Result<QuestionScores, String> {
        let mut scores = BTreeMap::new();
        for question in questions {
            if !question.is_valid() {
                return Err(format!(
                    "engine reported invalid score {}/{} for question {:?}",
                    question.score, question.possible, question.name
                ));
            }
            if scores.contains_key(&question.name) {
                return Err(format!(
                    "engine reported question {:?} more than once",
                    question.name
                ));
            }
            scores.insert(question.name.clone(), question);
        }
        Ok(scores)
    }
}

/// Grades one submission unit. Never fails: every problem becomes an outcome.
#[async_trait]
pub trait SubmissionGrader: Send + Sync {
    async fn grade_one(
        &self,
        submission: &SubmissionUnit,
        autograder_definition: &Path,
        timeout: Option<Duration>,
    ) -> GradingOutcome;
}

// Re-exports
pub use isolated::IsolatedWorker;
