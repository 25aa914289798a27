//! Batch grading coordinator
//!
//! Drives one grading run end to end:
//!
//! ```text
//! <output root>/grading_<timestamp>/
//! ├── Doe_Jane.zip                      graded successfully
//! ├── errors/Roe_Rick.zip               timed out or failed, for manual follow-up
//! ├── invalid/Poe Ed_3_assignsub.../    could not be repackaged, never graded
//! ├── grading_result_<timestamp>.csv
//! └── grading_histogram_<timestamp>.txt (only when plotting)
//! ```
//!
//! Only the coordinator mutates the session directory. Engine processes get
//! read access to one submission archive and the autograder archive.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::GraderConfig;
use crate::core::utils::{find_archives, move_file};
use crate::core::{GradingOutcome, StudentIdentity, SubmissionUnit};
use crate::error::{GradingError, Result};
use crate::report::BatchReport;
use crate::runner::{IsolatedWorker, SubmissionGrader};
use crate::unpack::InvalidSubmission;

pub const SESSION_DIR_PREFIX: &str = "grading_";
const SESSION_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
pub const ERRORS_DIR: &str = "errors";
pub const INVALID_DIR: &str = "invalid";

/// Everything a grading run produced
#[derive(Debug, Default)]
pub struct RunSummary {
    /// `None` when there was nothing to grade
    pub session_dir: Option<PathBuf>,
    pub report: BatchReport,
    pub report_path: Option<PathBuf>,
    pub histogram_path: Option<PathBuf>,
    /// One outcome per submission unit, in unpack order
    pub outcomes: Vec<GradingOutcome>,
    /// Students whose archives were moved to `errors/`
    pub errors: Vec<StudentIdentity>,
    pub invalid: Vec<InvalidSubmission>,
}

impl RunSummary {
    pub fn graded(&self) -> usize {
        self.report.rows.len()
    }
}

pub struct BatchGradingCoordinator {
    config: GraderConfig,
    grader: Arc<dyn SubmissionGrader>,
}

impl BatchGradingCoordinator {
    pub fn new(config: GraderConfig, grader: Arc<dyn SubmissionGrader>) -> Self {
        Self { config, grader }
    }

    /// Coordinator grading through isolated engine processes
    pub fn from_config(config: GraderConfig) -> Self {
        let worker =
            IsolatedWorker::new(config.engine_command()).with_result_grace(config.result_grace());
        Self::new(config, Arc::new(worker))
    }

    /// Grade every submission found in `source`.
    ///
    /// `source` is either the bulk archive itself or a directory holding
    /// exactly one. Fatal errors (no autograder, unreadable bulk archive)
    /// abort before any student is graded; per-student problems never do.
    pub async fn run(
        &self,
        source: &Path,
        autograder_dir: &Path,
        timeout: Option<Duration>,
        produce_plot: bool,
    ) -> Result<RunSummary> {
        let autograder = find_autograder(autograder_dir)?;
        info!("Using autograder {:?}", autograder);

        let Some(bulk_archive) = resolve_source(source)? else {
            return Ok(RunSummary::default());
        };

        let output_root = match &self.config.grading.output_dir {
            Some(dir) => dir.clone(),
            None => bulk_archive
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        fs::create_dir_all(&output_root)?;
        if self.config.grading.clear {
            clear_sessions(&output_root)?;
        }

        let stamp = chrono::Local::now().format(SESSION_STAMP_FORMAT).to_string();
        let session_dir = create_session_dir(&output_root, &stamp)?;
        let errors_dir = session_dir.join(ERRORS_DIR);
        fs::create_dir(&errors_dir)?;
        info!("Created grading session {:?}", session_dir);

        let unpacker = self.config.unpacker();
        let batch = {
            let bulk_archive = bulk_archive.clone();
            let session_dir = session_dir.clone();
            tokio::task::spawn_blocking(move || {
                unpacker.unpack(&bulk_archive, &session_dir, &session_dir.join(INVALID_DIR))
            })
            .await
            .map_err(io::Error::from)??
        };

        let outcomes = self.grade_all(&batch.units, &autograder, timeout).await;

        let mut errors = Vec::new();
        for (unit, outcome) in batch.units.iter().zip(&outcomes) {
            let reason = match outcome {
                GradingOutcome::Success { .. } => continue,
                GradingOutcome::Timeout { .. } => "timed out",
                GradingOutcome::Failure {
                    error_description, ..
                } => error_description.as_str(),
            };
            let identity = outcome.identity();
            error!("Unable to grade {}: {}", identity, reason);
            move_to_errors(unit, &errors_dir);
            errors.push(identity.clone());
        }

        let report = BatchReport::from_outcomes(&outcomes, &self.config.grading.manual_questions);
        let report_path = session_dir.join(format!("grading_result_{}.csv", stamp));
        report.write(
            &report_path,
            self.config.report.delimiter,
            &self.config.report.unscored_marker,
        )?;
        info!(
            "Wrote report for {} students to {:?} ({} in errors, {} invalid)",
            report.rows.len(),
            report_path,
            errors.len(),
            batch.invalid.len()
        );

        let histogram_path = if produce_plot {
            self.write_histogram(&report, &session_dir, &stamp)
        } else {
            None
        };

        Ok(RunSummary {
            session_dir: Some(session_dir),
            report,
            report_path: Some(report_path),
            histogram_path,
            outcomes,
            errors,
            invalid: batch.invalid,
        })
    }

    /// Grade all units with at most `max_parallel` engines at once.
    /// Returns exactly one outcome per unit, in unit order.
    async fn grade_all(
        &self,
        units: &[SubmissionUnit],
        autograder: &Path,
        timeout: Option<Duration>,
    ) -> Vec<GradingOutcome> {
        let permits = Arc::new(Semaphore::new(self.config.grading.max_parallel.max(1)));

        let handles: Vec<_> = units
            .iter()
            .cloned()
            .map(|unit| {
                let grader = Arc::clone(&self.grader);
                let permits = Arc::clone(&permits);
                let autograder = autograder.to_path_buf();
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    info!("Grading {}", unit.identity);
                    grader.grade_one(&unit, &autograder, timeout).await
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(units.len());
        for (unit, handle) in units.iter().zip(handles) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => GradingOutcome::Failure {
                    identity: unit.identity.clone(),
                    error_description: format!("grading task aborted: {}", e),
                },
            };
            info!("Graded {}: {}", unit.identity, outcome.kind());
            outcomes.push(outcome);
        }
        outcomes
    }

    fn write_histogram(
        &self,
        report: &BatchReport,
        session_dir: &Path,
        stamp: &str,
    ) -> Option<PathBuf> {
        let Some(histogram) = report.histogram(self.config.report.histogram_bins) else {
            warn!("No graded submissions, skipping histogram");
            return None;
        };

        let rendered = histogram.render();
        info!("Distribution of {}:\n{}", crate::report::OVERALL_COLUMN, rendered);

        let path = session_dir.join(format!("grading_histogram_{}.txt", stamp));
        match fs::write(&path, rendered) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Failed to write histogram to {:?}: {}", path, e);
                None
            }
        }
    }
}

/// First archive below `autograder_dir` (recursive, sorted by path)
pub fn find_autograder(autograder_dir: &Path) -> Result<PathBuf> {
    if !autograder_dir.is_dir() {
        return Err(GradingError::MissingAutograder(autograder_dir.to_path_buf()));
    }
    let archives = find_archives(autograder_dir, true)?;
    if archives.len() > 1 {
        warn!(
            "Found {} autograder archives under {:?}, using {:?}",
            archives.len(),
            autograder_dir,
            archives[0]
        );
    }
    archives
        .into_iter()
        .next()
        .ok_or_else(|| GradingError::MissingAutograder(autograder_dir.to_path_buf()))
}

/// Resolve the bulk archive. `Ok(None)` means there is nothing to grade.
fn resolve_source(source: &Path) -> Result<Option<PathBuf>> {
    if source.is_file() {
        return Ok(Some(source.to_path_buf()));
    }
    if !source.is_dir() {
        return Err(GradingError::MissingBulkArchive(source.to_path_buf()));
    }

    let archives = find_archives(source, false)?;
    match archives.as_slice() {
        [bulk] => Ok(Some(bulk.clone())),
        [] => {
            warn!("No submission archive found in {:?}, nothing to grade", source);
            Ok(None)
        }
        many => {
            warn!(
                "Expected exactly one submission archive in {:?}, found {}; nothing graded",
                source,
                many.len()
            );
            Ok(None)
        }
    }
}

fn create_session_dir(root: &Path, stamp: &str) -> io::Result<PathBuf> {
    let mut candidate = root.join(format!("{}{}", SESSION_DIR_PREFIX, stamp));
    let mut counter = 1;
    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                candidate = root.join(format!("{}{}_{}", SESSION_DIR_PREFIX, stamp, counter));
                counter += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Remove previous session directories below `root`
fn clear_sessions(root: &Path) -> io::Result<()> {
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let is_session = entry
            .file_name()
            .to_str()
            .map(is_session_dir_name)
            .unwrap_or(false);
        if is_session && entry.file_type()?.is_dir() {
            info!("Clearing previous session {:?}", entry.path());
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

/// Matches exactly the names produced by `create_session_dir`:
/// `grading_<%Y%m%d_%H%M%S>` with an optional `_<n>` suffix
fn is_session_dir_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(SESSION_DIR_PREFIX) else {
        return false;
    };
    let stamp_len = "YYYYmmdd_HHMMSS".len();
    let (Some(stamp), Some(suffix)) = (rest.get(..stamp_len), rest.get(stamp_len..)) else {
        return false;
    };
    if chrono::NaiveDateTime::parse_from_str(stamp, SESSION_STAMP_FORMAT).is_err() {
        return false;
    }
    match suffix.strip_prefix('_') {
        None => suffix.is_empty(),
        Some(counter) => !counter.is_empty() && counter.bytes().all(|b| b.is_ascii_digit()),
    }
}

fn move_to_errors(unit: &SubmissionUnit, errors_dir: &Path) {
    let Some(file_name) = unit.archive_path.file_name() else {
        return;
    };
    let target = errors_dir.join(file_name);
    match move_file(&unit.archive_path, &target) {
        Ok(()) => info!("Moved {:?} to {:?}", unit.archive_path, target),
        Err(e) => error!(
            "Failed to move {:?} to {:?}: {}",
            unit.archive_path, target, e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{QuestionResult, QuestionScores};
    use crate::runner::EngineCommand;
    use async_trait::async_trait;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Grades by surname: `Hang` times out, `Broken` fails, everyone else passes
    struct FakeGrader;

    #[async_trait]
    impl SubmissionGrader for FakeGrader {
        async fn grade_one(
            &self,
            submission: &SubmissionUnit,
            _autograder_definition: &Path,
            _timeout: Option<Duration>,
        ) -> GradingOutcome {
            let identity = submission.identity.clone();
            assert!(submission.archive_path.is_file());
            match identity.surname.as_str() {
                "Hang" => GradingOutcome::Timeout { identity },
                "Broken" => GradingOutcome::Failure {
                    identity,
                    error_description: "SyntaxError".into(),
                },
                _ => {
                    let score = identity.given_names.len() as f64 % 3.0;
                    let questions: QuestionScores = [
                        ("q1".to_string(), QuestionResult::new("q1", 1.0, 1.0)),
                        ("q2".to_string(), QuestionResult::new("q2", score.min(2.0), 2.0)),
                    ]
                    .into_iter()
                    .collect();
                    GradingOutcome::Success {
                        identity,
                        questions,
                    }
                }
            }
        }
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            for (name, data) in entries {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(data).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    struct Fixture {
        _root: tempfile::TempDir,
        source_dir: PathBuf,
        autograder_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let source_dir = root.path().join("submissions");
        let autograder_dir = root.path().join("autograder");
        fs::create_dir_all(autograder_dir.join("dist")).unwrap();
        fs::create_dir_all(&source_dir).unwrap();
        fs::write(
            autograder_dir.join("dist/hw1-autograder.zip"),
            zip_bytes(&[("tests/q1.py", b"")]),
        )
        .unwrap();

        let nb = zip_bytes(&[("hw1.ipynb", b"{}")]);
        fs::write(
            source_dir.join("export.zip"),
            zip_bytes(&[
                ("Bravo Bob_11_assignsubmission_file_/hw1.zip", &nb),
                ("Hang Harry_12_assignsubmission_file_/hw1.zip", &nb),
                ("Alpha Ann_13_assignsubmission_file_/hw1.ipynb", b"{}"),
                ("Broken Bill_14_assignsubmission_file_/hw1.zip", &nb),
                ("Twice Tom_15_assignsubmission_file_/a.zip", &nb),
                ("Twice Tom_15_assignsubmission_file_/b.zip", &nb),
                ("__MACOSX/Bravo Bob_11_assignsubmission_file_/._hw1.zip", b""),
            ]),
        )
        .unwrap();

        Fixture {
            _root: root,
            source_dir,
            autograder_dir,
        }
    }

    fn coordinator(config: GraderConfig) -> BatchGradingCoordinator {
        BatchGradingCoordinator::new(config, Arc::new(FakeGrader))
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_run_partitions_students() {
        let fx = fixture();
        let summary = coordinator(GraderConfig::default())
            .run(&fx.source_dir, &fx.autograder_dir, None, false)
            .await
            .unwrap();

        let session = summary.session_dir.clone().unwrap();
        assert_eq!(session.parent(), Some(fx.source_dir.as_path()));

        // Exactly one outcome per unpacked unit
        assert_eq!(summary.outcomes.len(), 4);
        assert_eq!(summary.graded() + summary.errors.len(), summary.outcomes.len());

        let surnames: Vec<_> = summary
            .report
            .rows
            .iter()
            .map(|r| r.identity.surname.as_str())
            .collect();
        assert_eq!(surnames, vec!["Alpha", "Bravo"]);

        assert_eq!(
            file_names(&session.join(ERRORS_DIR)),
            vec!["Broken_Bill.zip", "Hang_Harry.zip"]
        );
        assert!(session.join("Alpha_Ann.zip").is_file());
        assert!(session.join("Bravo_Bob.zip").is_file());
        assert!(!session.join("Hang_Harry.zip").exists());

        assert_eq!(summary.invalid.len(), 1);
        assert_eq!(
            file_names(&session.join(INVALID_DIR)),
            vec!["Twice Tom_15_assignsubmission_file_"]
        );

        let report = fs::read_to_string(summary.report_path.unwrap()).unwrap();
        let lines: Vec<_> = report.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "surname;given_names;file;q1;q2;overall");
        assert!(lines[1].starts_with("Alpha;Ann;Alpha_Ann.zip;1;"));
        assert!(summary.histogram_path.is_none());
    }

    #[tokio::test]
    async fn test_missing_autograder_aborts_before_unpacking() {
        let fx = fixture();
        fs::remove_dir_all(fx.autograder_dir.join("dist")).unwrap();

        let err = coordinator(GraderConfig::default())
            .run(&fx.source_dir, &fx.autograder_dir, None, false)
            .await
            .unwrap_err();

        assert!(matches!(err, GradingError::MissingAutograder(_)));
        assert_eq!(file_names(&fx.source_dir), vec!["export.zip"]);
    }

    #[tokio::test]
    async fn test_empty_source_is_noop() {
        let fx = fixture();
        fs::remove_file(fx.source_dir.join("export.zip")).unwrap();

        let summary = coordinator(GraderConfig::default())
            .run(&fx.source_dir, &fx.autograder_dir, None, true)
            .await
            .unwrap();

        assert!(summary.session_dir.is_none());
        assert!(summary.report.is_empty());
        assert!(summary.outcomes.is_empty());
        assert!(file_names(&fx.source_dir).is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_is_fatal() {
        let fx = fixture();
        let err = coordinator(GraderConfig::default())
            .run(&fx.source_dir.join("nope.zip"), &fx.autograder_dir, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GradingError::MissingBulkArchive(_)));
    }

    #[tokio::test]
    async fn test_corrupt_bulk_archive_is_fatal() {
        let fx = fixture();
        let bulk = fx.source_dir.join("export.zip");
        fs::write(&bulk, b"garbage").unwrap();

        let err = coordinator(GraderConfig::default())
            .run(&bulk, &fx.autograder_dir, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GradingError::Extraction { .. }));
    }

    #[tokio::test]
    async fn test_parallel_dispatch_matches_sequential() {
        let sequential = {
            let fx = fixture();
            coordinator(GraderConfig::default())
                .run(&fx.source_dir, &fx.autograder_dir, None, false)
                .await
                .unwrap()
        };

        let fx = fixture();
        let mut config = GraderConfig::default();
        config.grading.max_parallel = 3;
        let parallel = coordinator(config)
            .run(&fx.source_dir, &fx.autograder_dir, None, false)
            .await
            .unwrap();

        assert_eq!(parallel.report, sequential.report);
        assert_eq!(parallel.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_plot_writes_histogram() {
        let fx = fixture();
        let summary = coordinator(GraderConfig::default())
            .run(&fx.source_dir, &fx.autograder_dir, None, true)
            .await
            .unwrap();

        let histogram = fs::read_to_string(summary.histogram_path.unwrap()).unwrap();
        assert_eq!(histogram.lines().count(), 20);
    }

    #[tokio::test]
    async fn test_clear_removes_previous_sessions() {
        let fx = fixture();
        let stale = fx.source_dir.join("grading_20200101_000000");
        let stale_suffixed = fx.source_dir.join("grading_20200101_000000_2");
        fs::create_dir_all(stale.join(ERRORS_DIR)).unwrap();
        fs::create_dir_all(&stale_suffixed).unwrap();
        let rubrics = fx.source_dir.join("grading_rubrics");
        fs::create_dir_all(&rubrics).unwrap();
        fs::write(rubrics.join("rubric.md"), b"# q1").unwrap();

        let mut config = GraderConfig::default();
        config.grading.clear = true;
        let summary = coordinator(config)
            .run(&fx.source_dir, &fx.autograder_dir, None, false)
            .await
            .unwrap();

        assert!(!stale.exists());
        assert!(!stale_suffixed.exists());
        assert!(rubrics.join("rubric.md").is_file());
        assert!(summary.session_dir.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_unreadable_submission_archive_lands_in_errors() {
        let fx = fixture();
        fs::write(
            fx.source_dir.join("export.zip"),
            zip_bytes(&[("Broken Bea_21_assignsubmission_file_/hw.zip", b"not really a zip")]),
        )
        .unwrap();

        let summary = coordinator(GraderConfig::default())
            .run(&fx.source_dir, &fx.autograder_dir, None, false)
            .await
            .unwrap();

        assert!(summary.invalid.is_empty());
        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.errors.len(), 1);
        let errors_dir = summary.session_dir.unwrap().join(ERRORS_DIR);
        assert_eq!(file_names(&errors_dir), vec!["Broken_Bea.zip"]);
        assert_eq!(
            fs::read(errors_dir.join("Broken_Bea.zip")).unwrap(),
            b"not really a zip"
        );
    }

    #[test]
    fn test_session_dir_name_matching() {
        assert!(is_session_dir_name("grading_20240101_120000"));
        assert!(is_session_dir_name("grading_20240101_120000_12"));
        assert!(!is_session_dir_name("grading_rubrics"));
        assert!(!is_session_dir_name("grading_20240101_120000_"));
        assert!(!is_session_dir_name("grading_20240101_120000_old"));
        assert!(!is_session_dir_name("grading_20241399_120000"));
        assert!(!is_session_dir_name("results_20240101_120000"));
    }

    #[tokio::test]
    async fn test_isolated_engine_end_to_end() {
        let fx = fixture();
        let mut config = GraderConfig::default();
        config.grading.max_parallel = 2;
        let engine = EngineCommand::new("sh").with_args([
            "-c",
            r#"case "$1" in
  *Hang_*) sleep 30 ;;
  *Broken_*) echo '{"status":"error","message":"SyntaxError"}'; exit 1 ;;
esac
echo '{"status":"graded","questions":[{"name":"q1","score":1,"possible":1}]}'"#,
            "engine",
            "{submission}",
        ]);
        let worker = IsolatedWorker::new(engine).with_result_grace(Duration::from_secs(2));
        let coordinator = BatchGradingCoordinator::new(config, Arc::new(worker));

        let summary = coordinator
            .run(&fx.source_dir, &fx.autograder_dir, Some(Duration::from_secs(1)), false)
            .await
            .unwrap();

        assert_eq!(summary.report.overall(), vec![1.0, 1.0]);
        let kinds: Vec<_> = summary.outcomes.iter().map(|o| o.kind()).collect();
        assert_eq!(kinds.len(), 4);
        assert_eq!(
            file_names(&summary.session_dir.unwrap().join(ERRORS_DIR)),
            vec!["Broken_Bill.zip", "Hang_Harry.zip"]
        );
    }

    #[test]
    fn test_find_autograder_recursive() {
        let fx = fixture();
        let found = find_autograder(&fx.autograder_dir).unwrap();
        assert!(found.ends_with("dist/hw1-autograder.zip"));

        let missing = find_autograder(&fx.source_dir.join("nowhere"));
        assert!(matches!(missing, Err(GradingError::MissingAutograder(_))));
    }

    #[test]
    fn test_session_dir_collision_gets_suffix() {
        let root = tempfile::tempdir().unwrap();
        let first = create_session_dir(root.path(), "20240101_120000").unwrap();
        let second = create_session_dir(root.path(), "20240101_120000").unwrap();

        assert!(first.ends_with("grading_20240101_120000"));
        assert!(second.ends_with("grading_20240101_120000_1"));
    }
}
