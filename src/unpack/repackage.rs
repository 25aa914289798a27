//! Turns one LMS per-student directory into a single submission archive
//!
//! A directory holding exactly one archive keeps that archive's entries
//! byte-for-byte (raw copy, no recompression). A directory of loose files has
//! its top-level files packed. Either way an identity record is added as an
//! extra top-level entry. A lone archive that cannot be read is kept as-is,
//! without the record, and left for the grading engine to reject.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::core::utils::find_archives;
use crate::core::{StudentIdentity, SubmissionUnit};
use crate::error::RepackagingError;

/// Default name of the identity record embedded in each archive
pub const DEFAULT_IDENTITY_RECORD: &str = "identity.txt";

#[derive(Debug, Clone)]
pub struct SubmissionRepackager {
    identity_record: String,
}

impl Default for SubmissionRepackager {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTITY_RECORD)
    }
}

impl SubmissionRepackager {
    pub fn new(identity_record: impl Into<String>) -> Self {
        Self {
            identity_record: identity_record.into(),
        }
    }

    /// Repackage `student_dir` into `dest_dir/<normalized name>.zip`.
    ///
    /// On success the staging directory is removed. On failure it is left
    /// untouched so the caller can set it aside.
    pub fn repackage(
        &self,
        student_dir: &Path,
        identity: &StudentIdentity,
        dest_dir: &Path,
    ) -> Result<SubmissionUnit, RepackagingError> {
        let archives = find_archives(student_dir, true)?;
        if archives.len() > 1 {
            return Err(RepackagingError::AmbiguousPayload {
                dir: student_dir.to_path_buf(),
                archives,
            });
        }

        let mut staging = tempfile::Builder::new()
            .prefix(".repackage")
            .suffix(".zip")
            .tempfile_in(dest_dir)?;

        match archives.first() {
            Some(archive) => match ZipArchive::new(fs::File::open(archive)?) {
                Ok(source) => {
                    debug!("Reusing submitted archive {:?} for {}", archive, identity);
                    let mut writer = ZipWriter::new(staging.reopen()?);
                    self.copy_archive_entries(source, identity, &mut writer)?;
                    self.finish(writer, identity, student_dir)?;
                }
                Err(e) => {
                    // Left to the engine to reject, so it ends up in errors/
                    warn!(
                        "Submitted archive {:?} of {} is unreadable ({}), keeping it unchanged",
                        archive, identity, e
                    );
                    io::copy(&mut fs::File::open(archive)?, &mut staging)?;
                }
            },
            None => {
                debug!("Packing loose files of {:?} for {}", student_dir, identity);
                let mut writer = ZipWriter::new(staging.reopen()?);
                self.pack_loose_files(student_dir, identity, &mut writer)?;
                self.finish(writer, identity, student_dir)?;
            }
        }

        let archive_path = dest_dir.join(identity.archive_file_name());
        staging
            .persist_noclobber(&archive_path)
            .map_err(|e| e.error)?;

        fs::remove_dir_all(student_dir)?;

        Ok(SubmissionUnit {
            identity: identity.clone(),
            archive_path,
        })
    }

    /// Append the identity record and close the archive
    fn finish(
        &self,
        mut writer: ZipWriter<fs::File>,
        identity: &StudentIdentity,
        student_dir: &Path,
    ) -> Result<(), RepackagingError> {
        writer.start_file(self.identity_record.as_str(), deflated())?;
        writer.write_all(identity_record_contents(identity, student_dir).as_bytes())?;
        writer.finish()?;
        Ok(())
    }

    fn copy_archive_entries(
        &self,
        mut source: ZipArchive<fs::File>,
        identity: &StudentIdentity,
        writer: &mut ZipWriter<fs::File>,
    ) -> Result<(), RepackagingError> {
        for i in 0..source.len() {
            let entry = source.by_index_raw(i)?;
            if entry.name() == self.identity_record {
                warn!(
                    "Dropping submitted {:?} of {}, it is replaced by the identity record",
                    self.identity_record, identity
                );
                continue;
            }
            writer.raw_copy_file(entry)?;
        }
        Ok(())
    }

    fn pack_loose_files(
        &self,
        student_dir: &Path,
        identity: &StudentIdentity,
        writer: &mut ZipWriter<fs::File>,
    ) -> Result<(), RepackagingError> {
        for path in top_level_files(student_dir)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == self.identity_record {
                warn!(
                    "Dropping submitted {:?} of {}, it is replaced by the identity record",
                    self.identity_record, identity
                );
                continue;
            }
            writer.start_file(name, deflated())?;
            let mut file = fs::File::open(&path)?;
            io::copy(&mut file, writer)?;
        }
        Ok(())
    }
}

fn deflated() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn top_level_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn identity_record_contents(identity: &StudentIdentity, student_dir: &Path) -> String {
    let source = student_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(
        "surname: {}\ngiven_names: {}\nsource: {}\n",
        identity.surname, identity.given_names, source
    )
}
