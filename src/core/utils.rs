use std::fs;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use walkdir::WalkDir;
use zip::result::ZipResult;
use zip::ZipArchive;

/// File extension of archives handled by the grader
pub const ARCHIVE_EXTENSION: &str = "zip";

pub fn extract_zip<R: Read + Seek>(data: R, dest: &Path) -> ZipResult<()> {
    let mut archive = ZipArchive::new(data)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;

        // ZIP Slip vulnerability protection
        // Enforce that the file path is safe and contained within destination
        let file_path = match file.enclosed_name() {
            Some(path) => path.to_owned(),
            None => continue, // Skip potentially malicious paths
        };

        let outpath = dest.join(&file_path);

        if file.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = fs::File::create(&outpath)?;
            io::copy(&mut file, &mut outfile)?;
        }
    }

    Ok(())
}

/// True if `path` has the archive extension (case-insensitive)
pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
        .unwrap_or(false)
}

/// All archive files below `dir`, sorted by path
pub fn find_archives(dir: &Path, recursive: bool) -> io::Result<Vec<PathBuf>> {
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .sort_by_file_name();

    let mut archives = Vec::new();
    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_file() && is_archive(entry.path()) {
            archives.push(entry.into_path());
        }
    }
    Ok(archives)
}

/// Move a file, falling back to copy + remove across filesystems
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(Errno::EXDEV as i32) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}
