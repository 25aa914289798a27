pub mod identity;
pub mod outcome;
pub mod utils;

pub use identity::{ArchiveNameParser, IdentityRegistry, StudentIdentity};
pub use outcome::{GradingOutcome, OutcomeKind, QuestionResult, QuestionScores, SubmissionUnit};
