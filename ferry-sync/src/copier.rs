//! Parallel, retrying file copier.
//!
//! Every [`FileRecord`] becomes one job. At most `max_parallelism` jobs hold
//! a semaphore permit at once; each job runs its blocking I/O on the tokio
//! blocking pool and retries per [`RetryPolicy`]. A failed file never aborts
//! the batch.
//!
//! Destination writes go straight to the final path (no temp file). After the
//! data is written, source access and modification times are re-applied.
//! Creation time is left to the filesystem.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{io_err, SyncError};
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::scan::FileRecord;

const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOptions {
    pub max_parallelism: usize,
    pub retry: RetryPolicy,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            max_parallelism: 8,
            retry: RetryPolicy::default(),
        }
    }
}

/// Totals for one [`copy_all`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    pub copied_files: u64,
    pub copied_bytes: u64,
    pub failed_files: u64,
    /// The token fired before every job settled.
    pub cancelled: bool,
}

/// Per-file callbacks, invoked from worker threads.
pub trait CopyObserver: Send + Sync {
    /// A job acquired its permit and is about to touch the filesystem.
    fn on_started(&self, _record: &FileRecord) {}

    fn on_copied(&self, record: &FileRecord, bytes: u64);

    /// Retries are exhausted for `record`.
    fn on_failed(&self, record: &FileRecord, error: &SyncError, attempts: u32);

    /// The job was abandoned because of cancellation.
    fn on_cancelled(&self, _record: &FileRecord) {}

    /// A chunk was written; the copy is alive.
    fn on_heartbeat(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CopyObserver for NoopObserver {
    fn on_copied(&self, _record: &FileRecord, _bytes: u64) {}
    fn on_failed(&self, _record: &FileRecord, _error: &SyncError, _attempts: u32) {}
}

enum JobOutcome {
    Copied(u64),
    Failed,
    Cancelled,
}

/// Copy every record under `dest_root`, bounded by `opts.max_parallelism`.
///
/// Returns once all started jobs have settled. When `cancel` fires, no new
/// job or retry starts; a file already streaming is finished.
pub async fn copy_all(
    records: Vec<FileRecord>,
    dest_root: &Path,
    opts: &CopyOptions,
    cancel: &CancellationToken,
    observer: Arc<dyn CopyObserver>,
) -> CopyResult {
    let semaphore = Arc::new(Semaphore::new(opts.max_parallelism.max(1)));
    let mut jobs = JoinSet::new();
    let mut result = CopyResult::default();

    for record in records {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let dest = record.destination(dest_root);
        let observer = Arc::clone(&observer);
        let cancel = cancel.clone();
        let retry = opts.retry;
        jobs.spawn(async move {
            let _permit = permit;
            copy_one(record, dest, retry, cancel, observer).await
        });
    }

    while let Some(joined) = jobs.join_next().await {
        match joined {
            Ok(JobOutcome::Copied(bytes)) => {
                result.copied_files += 1;
                result.copied_bytes += bytes;
            }
            Ok(JobOutcome::Failed) => result.failed_files += 1,
            Ok(JobOutcome::Cancelled) => result.cancelled = true,
            Err(err) => {
                tracing::error!("copy job panicked: {err}");
                result.failed_files += 1;
            }
        }
    }
    if cancel.is_cancelled() {
        result.cancelled = true;
    }
    result
}

async fn copy_one(
    record: FileRecord,
    dest: PathBuf,
    retry: RetryPolicy,
    cancel: CancellationToken,
    observer: Arc<dyn CopyObserver>,
) -> JobOutcome {
    observer.on_started(&record);
    let outcome = retry
        .run(&cancel, |attempt| {
            let src = record.source_path.clone();
            let dst = dest.clone();
            let token = cancel.clone();
            let obs = Arc::clone(&observer);
            async move {
                if attempt > 1 {
                    tracing::debug!("retrying {} (attempt {attempt})", src.display());
                }
                tokio::task::spawn_blocking(move || {
                    copy_file(&src, &dst, &token, &|| obs.on_heartbeat())
                })
                .await
                .map_err(|e| SyncError::Join(e.to_string()))?
            }
        })
        .await;

    match outcome {
        RetryOutcome::Done(bytes) => {
            observer.on_copied(&record, bytes);
            JobOutcome::Copied(bytes)
        }
        RetryOutcome::Exhausted {
            error: SyncError::Cancelled { .. },
            ..
        }
        | RetryOutcome::Cancelled => {
            observer.on_cancelled(&record);
            JobOutcome::Cancelled
        }
        RetryOutcome::Exhausted { error, attempts } => {
            observer.on_failed(&record, &error, attempts);
            JobOutcome::Failed
        }
    }
}

/// Copy `src` to `dst` in chunks, then re-apply the source timestamps.
///
/// Missing parent directories are created. `heartbeat` runs after every
/// chunk. Cancellation is honoured only before the destination is opened, so
/// a file is either untouched or copied in full.
pub fn copy_file(
    src: &Path,
    dst: &Path,
    cancel: &CancellationToken,
    heartbeat: &dyn Fn(),
) -> Result<u64, SyncError> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled {
            path: src.to_path_buf(),
        });
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let mut reader = File::open(src).map_err(|e| io_err(src, e))?;
    let meta = reader.metadata().map_err(|e| io_err(src, e))?;
    let mut writer = File::create(dst).map_err(|e| io_err(dst, e))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_err(src, e)),
        };
        writer.write_all(&buf[..n]).map_err(|e| io_err(dst, e))?;
        written += n as u64;
        heartbeat();
    }
    writer.sync_all().map_err(|e| io_err(dst, e))?;
    drop(writer);

    let atime = FileTime::from_last_access_time(&meta);
    let mtime = FileTime::from_last_modification_time(&meta);
    filetime::set_file_times(dst, atime, mtime).map_err(|e| io_err(dst, e))?;
    Ok(written)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
