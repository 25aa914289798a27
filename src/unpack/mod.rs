//! Bulk export unpacking
//!
//! An LMS bulk download is one archive holding a directory per student:
//!
//! ```text
//! bulk.zip
//! ├── Doe Jane_4711_assignsubmission_file_/
//! │   └── submission.zip
//! ├── Roe Rick_4712_assignsubmission_file_/
//! │   ├── main.ipynb
//! │   └── data.csv
//! └── __MACOSX/
//! ```
//!
//! The unpacker turns that into one normalized archive per student in the
//! working directory. Directories that cannot be repackaged are moved to the
//! invalid area untouched and never graded.

pub mod repackage;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::core::utils::extract_zip;
use crate::core::{ArchiveNameParser, IdentityRegistry, SubmissionUnit};
use crate::error::{GradingError, Result};

pub use repackage::SubmissionRepackager;

/// Platform metadata directory added by macOS archivers
pub const RESOURCE_FORK_DIR: &str = "__MACOSX";

/// A student directory that was set aside instead of graded
#[derive(Debug, Clone)]
pub struct InvalidSubmission {
    /// Directory name as exported by the LMS
    pub raw_name: String,
    /// Where the directory now lives
    pub path: PathBuf,
    pub reason: String,
}

/// Result of unpacking a bulk export
#[derive(Debug, Default)]
pub struct UnpackedBatch {
    /// Successfully repackaged submissions, ordered by directory name
    pub units: Vec<SubmissionUnit>,
    pub invalid: Vec<InvalidSubmission>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchUnpacker {
    parser: ArchiveNameParser,
    repackager: SubmissionRepackager,
}

impl BatchUnpacker {
    pub fn new(parser: ArchiveNameParser, repackager: SubmissionRepackager) -> Self {
        Self { parser, repackager }
    }

    /// Extract `bulk_archive` and repackage every student directory into
    /// `working_dir`. Rejected directories are moved below `invalid_dir`.
    ///
    /// Extraction failures abort the batch; a single student's failure never does.
    pub fn unpack(
        &self,
        bulk_archive: &Path,
        working_dir: &Path,
        invalid_dir: &Path,
    ) -> Result<UnpackedBatch> {
        let file = match fs::File::open(bulk_archive) {
            Ok(file) if bulk_archive.is_file() => file,
            Ok(_) => return Err(GradingError::MissingBulkArchive(bulk_archive.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(GradingError::MissingBulkArchive(bulk_archive.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };

        fs::create_dir_all(working_dir)?;

        // Extract next to the destination so moves stay on one filesystem
        let extraction = tempfile::Builder::new()
            .prefix(".extract")
            .tempdir_in(working_dir)?;

        extract_zip(io::BufReader::new(file), extraction.path()).map_err(|source| {
            GradingError::Extraction {
                path: bulk_archive.to_path_buf(),
                source,
            }
        })?;
        info!(
            "Extracted {:?} into {:?}",
            bulk_archive,
            extraction.path()
        );

        let mut registry = IdentityRegistry::new(self.parser.clone());
        let mut batch = UnpackedBatch::default();

        // Sorted so duplicate names are disambiguated the same way on every run
        let mut entries = fs::read_dir(extraction.path())?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let raw_name = entry.file_name().to_string_lossy().into_owned();

            if raw_name == RESOURCE_FORK_DIR {
                debug!("Skipping platform metadata directory {:?}", raw_name);
                continue;
            }
            if !entry.file_type()?.is_dir() {
                debug!("Skipping {:?}, not a student directory", raw_name);
                continue;
            }

            let identity = registry.register(&raw_name);
            match self
                .repackager
                .repackage(&entry.path(), &identity, working_dir)
            {
                Ok(unit) => {
                    info!("Unpacked {} -> {:?}", identity, unit.archive_path);
                    batch.units.push(unit);
                }
                Err(e) => {
                    warn!("Invalid submission {:?}: {}", raw_name, e);
                    let path = set_aside(&entry.path(), invalid_dir, &raw_name)?;
                    batch.invalid.push(InvalidSubmission {
                        raw_name,
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Unpacked {} submissions, {} set aside as invalid",
            batch.units.len(),
            batch.invalid.len()
        );

        Ok(batch)
    }
}

fn set_aside(student_dir: &Path, invalid_dir: &Path, raw_name: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(invalid_dir)?;
    let target = invalid_dir.join(raw_name);
    fs::rename(student_dir, &target)?;
    info!("Moved invalid submission to {:?}", target);
    Ok(target)
}
