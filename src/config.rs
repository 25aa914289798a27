//! Grader configuration
//!
//! Loaded from an optional TOML file, then overridden from the environment
//! (`GRADER_*` variables, `.env` supported by the binary) and finally from
//! command line flags. The resulting struct is passed explicitly to the
//! coordinator; there is no global configuration state.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::identity::DEFAULT_NAME_DELIMITER;
use crate::core::ArchiveNameParser;
use crate::error::{GradingError, Result};
use crate::runner::EngineCommand;
use crate::unpack::repackage::DEFAULT_IDENTITY_RECORD;
use crate::unpack::{BatchUnpacker, SubmissionRepackager};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraderConfig {
    pub grading: GradingSection,
    pub lms: LmsSection,
    pub report: ReportSection,
    pub engine: EngineSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GradingSection {
    /// Per-submission wall-clock limit in seconds, 0 disables the limit
    pub timeout_secs: u64,
    /// Number of engine processes allowed at once (1 = sequential)
    pub max_parallel: usize,
    pub plot: bool,
    /// Remove previous `grading_*` session directories before a run
    pub clear: bool,
    /// Hand-graded questions, reported as unscored columns
    pub manual_questions: Vec<String>,
    /// Where session directories are created; defaults to the source's directory
    pub output_dir: Option<PathBuf>,
}

impl Default for GradingSection {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_parallel: 1,
            plot: false,
            clear: false,
            manual_questions: Vec::new(),
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LmsSection {
    pub name_delimiter: String,
    pub identity_record: String,
}

impl Default for LmsSection {
    fn default() -> Self {
        Self {
            name_delimiter: DEFAULT_NAME_DELIMITER.to_string(),
            identity_record: DEFAULT_IDENTITY_RECORD.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportSection {
    pub delimiter: char,
    pub unscored_marker: String,
    pub histogram_bins: usize,
}

impl Default for ReportSection {
    fn default() -> Self {
        Self {
            delimiter: ';',
            unscored_marker: String::new(),
            histogram_bins: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    /// Engine invocation; see `runner::EngineCommand` for placeholders
    pub command: Vec<String>,
    pub quiet: bool,
    pub debug: bool,
    /// Bounded wait for the result channel after the engine exits
    pub result_grace_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            command: [
                "python3",
                "files/otter_grade_one.py",
                "{submission}",
                "{autograder}",
                "{quiet}",
                "{debug}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            quiet: true,
            debug: false,
            result_grace_secs: 5,
        }
    }
}

impl GraderConfig {
    /// Load from `path` (if any) and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|e| {
                    GradingError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| GradingError::Config(e.to_string()))
    }

    /// Apply `GRADER_*` overrides from `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("GRADER_TIMEOUT_SECS") {
            self.grading.timeout_secs = parse_number("GRADER_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("GRADER_MAX_PARALLEL") {
            self.grading.max_parallel = parse_number("GRADER_MAX_PARALLEL", &value)?;
        }
        if let Some(value) = lookup("GRADER_ENGINE_COMMAND") {
            self.engine.command = value.split_whitespace().map(String::from).collect();
        }
        if let Some(value) = lookup("GRADER_NAME_DELIMITER") {
            self.lms.name_delimiter = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.grading.max_parallel == 0 {
            return Err(GradingError::Config("grading.max_parallel must be at least 1".into()));
        }
        if self.engine.command.is_empty() {
            return Err(GradingError::Config("engine.command must not be empty".into()));
        }
        if self.lms.name_delimiter.is_empty() {
            return Err(GradingError::Config("lms.name_delimiter must not be empty".into()));
        }
        if self.lms.identity_record.trim().is_empty() {
            return Err(GradingError::Config("lms.identity_record must not be empty".into()));
        }
        if self.report.histogram_bins == 0 {
            return Err(GradingError::Config("report.histogram_bins must be at least 1".into()));
        }
        if matches!(self.report.delimiter, '"' | '\n' | '\r') {
            return Err(GradingError::Config(format!(
                "report.delimiter {:?} is not usable",
                self.report.delimiter
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self.grading.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn result_grace(&self) -> Duration {
        Duration::from_secs(self.engine.result_grace_secs)
    }

    pub fn engine_command(&self) -> EngineCommand {
        EngineCommand::from_vec(&self.engine.command)
            .with_quiet(self.engine.quiet)
            .with_debug(self.engine.debug)
    }

    pub fn unpacker(&self) -> BatchUnpacker {
        BatchUnpacker::new(
            ArchiveNameParser::new(self.lms.name_delimiter.clone()),
            SubmissionRepackager::new(self.lms.identity_record.clone()),
        )
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GradingError::Config(format!("{} must be a number, got {:?}", key, value)))
}
