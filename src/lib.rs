//! Batch autograding of LMS submission exports.
//!
//! A bulk export is unpacked into one normalized archive per student, each
//! archive is graded by an external engine in its own process group, and
//! the scores are collected into a delimited report.

pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod report;
pub mod runner;
pub mod unpack;

pub use config::GraderConfig;
pub use coordinator::{BatchGradingCoordinator, RunSummary};
pub use error::{GradingError, RepackagingError};
pub use report::BatchReport;
