//! Collision-free names on the receiving filesystem.
//!
//! Directories get a `_N` suffix (`downloads`, `downloads_1`, ...); files
//! get it before the extension (`report_1.pdf`). Callers that may race on
//! the same directory base path must serialize through the download
//! tracker.

use crate::{FileshareError, Result};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tracing::debug;

/// Upper bound on suffix attempts before giving up.
const MAX_ATTEMPTS: u32 = 10_000;

/// Creates `base`, or the first free `base_N`. An existing directory at the
/// candidate path is reused; an existing non-directory moves on to the next
/// suffix.
pub async fn reserve_dir(base: &Path) -> Result<PathBuf> {
    for attempt in 0..MAX_ATTEMPTS {
        let candidate = dir_candidate(base, attempt);

        match fs::create_dir(&candidate).await {
            Ok(()) => {
                debug!("Created directory {:?}", candidate);
                return Ok(candidate);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let metadata = fs::metadata(&candidate).await.map_err(|e| {
                    FileshareError::FileOperation(format!("Failed to stat {:?}: {}", candidate, e))
                })?;
                if metadata.is_dir() {
                    debug!("Reusing existing directory {:?}", candidate);
                    return Ok(candidate);
                }
                debug!("{:?} exists and is not a directory", candidate);
            }
            Err(e) => {
                return Err(FileshareError::FileOperation(format!(
                    "Failed to create directory {:?}: {}",
                    candidate, e
                )));
            }
        }
    }

    Err(FileshareError::FileOperation(format!(
        "No free directory name for {:?}",
        base
    )))
}

/// Creates a new file at `path` or at the first free suffixed name. Never
/// opens an existing file.
pub async fn reserve_file(path: &Path) -> Result<(PathBuf, File)> {
    for attempt in 0..MAX_ATTEMPTS {
        let candidate = file_candidate(path, attempt);

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(FileshareError::FileOperation(format!(
                    "Failed to create file {:?}: {}",
                    candidate, e
                )));
            }
        }
    }

    Err(FileshareError::FileOperation(format!(
        "No free file name for {:?}",
        path
    )))
}

fn dir_candidate(base: &Path, attempt: u32) -> PathBuf {
    if attempt == 0 {
        return base.to_path_buf();
    }
    let mut name = OsString::from(base.as_os_str());
    name.push(format!("_{}", attempt));
    PathBuf::from(name)
}

fn file_candidate(path: &Path, attempt: u32) -> PathBuf {
    if attempt == 0 {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, attempt, ext.to_string_lossy()),
        None => format!("{}_{}", stem, attempt),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_creates_missing_directory() {
        let root = tempdir().unwrap();
        let base = root.path().join("x");

        let reserved = reserve_dir(&base).await.unwrap();
        assert_eq!(reserved, base);
        assert!(base.is_dir());
    }

    #[tokio::test]
    async fn test_reuses_existing_directory() {
        let root = tempdir().unwrap();
        let base = root.path().join("x");
        std::fs::create_dir(&base).unwrap();

        assert_eq!(reserve_dir(&base).await.unwrap(), base);
    }

    #[tokio::test]
    async fn test_skips_non_directory_entries() {
        let root = tempdir().unwrap();
        let base = root.path().join("x");
        std::fs::write(&base, b"file").unwrap();
        std::fs::write(root.path().join("x_1"), b"file").unwrap();

        let reserved = reserve_dir(&base).await.unwrap();
        assert_eq!(reserved, root.path().join("x_2"));
        assert!(reserved.is_dir());
    }

    #[tokio::test]
    async fn test_suffix_increments_monotonically() {
        let root = tempdir().unwrap();
        let base = root.path().join("x");
        std::fs::write(&base, b"file").unwrap();

        let first = reserve_dir(&base).await.unwrap();
        assert_eq!(first, root.path().join("x_1"));

        // x_1 is now a directory, so it is reused rather than skipped.
        assert_eq!(reserve_dir(&base).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_reserve_file_never_overwrites() {
        let root = tempdir().unwrap();
        let path = root.path().join("report.pdf");
        std::fs::write(&path, b"original").unwrap();

        let (first, _) = reserve_file(&path).await.unwrap();
        let (second, _) = reserve_file(&path).await.unwrap();

        assert_eq!(first, root.path().join("report_1.pdf"));
        assert_eq!(second, root.path().join("report_2.pdf"));
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_reserve_file_without_extension() {
        let root = tempdir().unwrap();
        let path = root.path().join("movie.mkv0");
        std::fs::write(&path, b"stale").unwrap();

        let (reserved, _) = reserve_file(&path).await.unwrap();
        assert_eq!(reserved, root.path().join("movie_1.mkv0"));
    }
}
