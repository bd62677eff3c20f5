//! Diff scan: walk one source root and yield the files the destination lacks.
//!
//! A file is due when:
//! 1. the destination file is absent (or is not a regular file), or
//! 2. its size differs, or
//! 3. the destination mtime is older than the source mtime minus
//!    [`MTIME_TOLERANCE`] (some filesystems store 2-second timestamps).
//!
//! The walk is lazy: [`DiffScan`] is an iterator that stats each destination
//! only when the caller pulls the next record.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use walkdir::{DirEntry, WalkDir};

use crate::error::{io_err, SyncError};

/// Slack allowed between source and destination modification times.
pub const MTIME_TOLERANCE: Duration = Duration::from_secs(2);

/// Directory names never descended into (compared case-insensitively).
pub const EXCLUDED_DIRS: &[&str] = &[
    "$recycle.bin",
    "system volume information",
    "recycler",
    ".trashes",
    ".spotlight-v100",
    ".fseventsd",
    "lost+found",
];

/// One file that needs copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub source_path: PathBuf,
    /// Path below the source root; joined onto the destination root.
    pub relative_path: PathBuf,
    pub size: u64,
    pub source_mtime: SystemTime,
}

impl FileRecord {
    pub fn destination(&self, dest_root: &Path) -> PathBuf {
        dest_root.join(&self.relative_path)
    }

    /// Final path component, used for capture-name parsing.
    pub fn file_name(&self) -> Option<&str> {
        self.relative_path.file_name().and_then(|n| n.to_str())
    }
}

/// Is `name` one of the reserved system directories?
pub fn is_excluded_dir(name: &str) -> bool {
    EXCLUDED_DIRS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// Decide whether a source file with `size`/`mtime` must be copied over `dest`.
pub fn needs_copy(size: u64, mtime: SystemTime, dest: &Path) -> bool {
    let meta = match std::fs::metadata(dest) {
        Ok(meta) => meta,
        Err(_) => return true,
    };
    if !meta.is_file() || meta.len() != size {
        return true;
    }
    match meta.modified() {
        Ok(dest_mtime) => dest_mtime + MTIME_TOLERANCE < mtime,
        Err(_) => true,
    }
}

/// Start a lazy diff scan of `source_root` against `dest_root`.
pub fn scan(source_root: &Path, dest_root: &Path) -> DiffScan {
    let walker = WalkDir::new(source_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_reserved_entry(entry));
    DiffScan {
        source_root: source_root.to_path_buf(),
        dest_root: dest_root.to_path_buf(),
        walker: Box::new(walker),
        newest_mtime: None,
        files_seen: 0,
        skipped_dirs: 0,
    }
}

fn is_reserved_entry(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(is_excluded_dir)
            .unwrap_or(false)
}

/// Finite, single-use iterator over due [`FileRecord`]s.
///
/// Unreadable subdirectories are skipped (counted in [`skipped_dirs`](Self::skipped_dirs));
/// any other enumeration error is yielded as `Err` and should fail the pass.
pub struct DiffScan {
    source_root: PathBuf,
    dest_root: PathBuf,
    walker: Box<dyn Iterator<Item = walkdir::Result<DirEntry>> + Send>,
    newest_mtime: Option<SystemTime>,
    files_seen: u64,
    skipped_dirs: u64,
}

impl DiffScan {
    /// Newest source modification time seen so far, due or not.
    pub fn newest_mtime(&self) -> Option<SystemTime> {
        self.newest_mtime
    }

    pub fn files_seen(&self) -> u64 {
        self.files_seen
    }

    pub fn skipped_dirs(&self) -> u64 {
        self.skipped_dirs
    }

    fn record_for(&mut self, entry: DirEntry) -> Result<Option<FileRecord>, SyncError> {
        if !entry.file_type().is_file() {
            return Ok(None);
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            // Deleted between listing and stat: nothing to copy.
            Err(err) if err.io_error().map(|e| e.kind()) == Some(ErrorKind::NotFound) => {
                return Ok(None)
            }
            Err(err) => {
                return Err(SyncError::Walk {
                    path: entry.path().to_path_buf(),
                    source: err,
                })
            }
        };
        let mtime = meta.modified().map_err(|e| io_err(entry.path(), e))?;
        self.files_seen += 1;
        if self.newest_mtime.map_or(true, |newest| mtime > newest) {
            self.newest_mtime = Some(mtime);
        }

        let relative = entry
            .path()
            .strip_prefix(&self.source_root)
            .unwrap_or(entry.path())
            .to_path_buf();
        let dest = self.dest_root.join(&relative);
        if !needs_copy(meta.len(), mtime, &dest) {
            return Ok(None);
        }
        Ok(Some(FileRecord {
            source_path: entry.path().to_path_buf(),
            relative_path: relative,
            size: meta.len(),
            source_mtime: mtime,
        }))
    }
}

impl Iterator for DiffScan {
    type Item = Result<FileRecord, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let denied =
                        err.io_error().map(|e| e.kind()) == Some(ErrorKind::PermissionDenied);
                    if denied && err.depth() > 0 {
                        self.skipped_dirs += 1;
                        tracing::debug!(
                            "skipping unreadable entry {}",
                            err.path().map(|p| p.display().to_string()).unwrap_or_default()
                        );
                        continue;
                    }
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.source_root.clone());
                    return Some(Err(SyncError::Walk { path, source: err }));
                }
            };
            match self.record_for(entry) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
