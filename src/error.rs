//! Error types
//!
//! `GradingError` aborts a whole batch. `RepackagingError` only ever affects a
//! single student directory and is handled inside the unpacker.

use std::path::PathBuf;

use thiserror::Error;
use zip::result::ZipError;

/// Fatal errors surfaced to the caller of a grading run
#[derive(Debug, Error)]
pub enum GradingError {
    #[error("bulk archive not found: {}", .0.display())]
    MissingBulkArchive(PathBuf),

    #[error("failed to extract bulk archive {}: {source}", path.display())]
    Extraction {
        path: PathBuf,
        #[source]
        source: ZipError,
    },

    #[error("no autograder archive found under {}", .0.display())]
    MissingAutograder(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure to turn one student directory into a submission archive
#[derive(Debug, Error)]
pub enum RepackagingError {
    #[error("{} contains {} archives, expected at most one", dir.display(), archives.len())]
    AmbiguousPayload { dir: PathBuf, archives: Vec<PathBuf> },

    #[error("failed to read or write submission files: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build submission archive: {0}")]
    Zip(#[from] ZipError),
}

pub type Result<T, E = GradingError> = std::result::Result<T, E>;
