use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use super::identity::StudentIdentity;

/// One student's repackaged archive, ready for grading
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionUnit {
    pub identity: StudentIdentity,
    pub archive_path: PathBuf,
}

/// Score of one gradable question inside a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResult {
    pub name: String,
    pub score: f64,
    pub possible: f64,
}

impl QuestionResult {
    pub fn new(name: impl Into<String>, score: f64, possible: f64) -> Self {
        Self {
            name: name.into(),
            score,
            possible,
        }
    }

    /// `0 <= score <= possible`, both finite
    pub fn is_valid(&self) -> bool {
        self.score.is_finite()
            && self.possible.is_finite()
            && self.score >= 0.0
            && self.possible >= 0.0
            && self.score <= self.possible
    }
}

/// Question name -> result
pub type QuestionScores = BTreeMap<String, QuestionResult>;

/// Result of grading one submission unit
#[derive(Debug, Clone, PartialEq)]
pub enum GradingOutcome {
    Success {
        identity: StudentIdentity,
        questions: QuestionScores,
    },
    Timeout {
        identity: StudentIdentity,
    },
    Failure {
        identity: StudentIdentity,
        error_description: String,
    },
}

impl GradingOutcome {
    pub fn identity(&self) -> &StudentIdentity {
        match self {
            GradingOutcome::Success { identity, .. }
            | GradingOutcome::Timeout { identity }
            | GradingOutcome::Failure { identity, .. } => identity,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            GradingOutcome::Success { .. } => OutcomeKind::Success,
            GradingOutcome::Timeout { .. } => OutcomeKind::Timeout,
            GradingOutcome::Failure { .. } => OutcomeKind::Failure,
        }
    }
}

/// Outcome tag without payload, for logging and summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Timeout,
    Failure,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::Failure => "failure",
        };
        write!(f, "{}", s)
    }
}
