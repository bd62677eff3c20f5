//! Size-based rotation for `~/.ferry/logs/ferry.log`.
//!
//! Past [`MAX_LOG_BYTES`] the live file moves to `ferry.log.1`, older copies
//! shift up by one, and anything beyond [`KEEP_ROTATED`] is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
pub const KEEP_ROTATED: usize = 5;

/// Rotate `log` when it has reached `max_bytes`.
///
/// Returns `Ok(true)` when a rotation happened. A missing log is not an
/// error; the sink recreates it on the next line.
pub fn rotate_if_needed(log: &Path, max_bytes: u64, keep: usize) -> io::Result<bool> {
    let len = match fs::metadata(log) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if len < max_bytes || keep == 0 {
        return Ok(false);
    }

    match fs::remove_file(backup_path(log, keep)) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    for n in (1..keep).rev() {
        let from = backup_path(log, n);
        if from.exists() {
            fs::rename(&from, backup_path(log, n + 1))?;
        }
    }
    fs::rename(log, backup_path(log, 1))?;
    Ok(true)
}

/// Rotate the daemon log under `home`; failures are logged, never returned.
pub fn rotate_daemon_log(home: &Path) {
    let log = crate::paths::log_path(home);
    match rotate_if_needed(&log, MAX_LOG_BYTES, KEEP_ROTATED) {
        Ok(true) => tracing::info!(path = %log.display(), "log file rotated"),
        Ok(false) => {}
        Err(err) => tracing::warn!(path = %log.display(), error = %err, "log rotation failed"),
    }
}

fn backup_path(log: &Path, n: usize) -> PathBuf {
    let name = log
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(crate::paths::DAEMON_LOG);
    log.with_file_name(format!("{name}.{n}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SMALL_LIMIT: u64 = 64;

    fn fill(path: &Path, bytes: usize, byte: u8) {
        fs::write(path, vec![byte; bytes]).unwrap();
    }

    #[test]
    fn small_log_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("ferry.log");
        fill(&log, 10, b'a');
        assert!(!rotate_if_needed(&log, SMALL_LIMIT, 3).unwrap());
        assert!(!backup_path(&log, 1).exists());
    }

    #[test]
    fn oversized_log_moves_to_first_backup() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("ferry.log");
        fill(&log, 100, b'a');
        assert!(rotate_if_needed(&log, SMALL_LIMIT, 3).unwrap());
        assert!(!log.exists());
        assert_eq!(fs::read(backup_path(&log, 1)).unwrap().len(), 100);
    }

    #[test]
    fn backups_shift_and_are_capped() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("ferry.log");
        for (round, byte) in [b'1', b'2', b'3', b'4'].into_iter().enumerate() {
            fill(&log, 100 + round, byte);
            rotate_if_needed(&log, SMALL_LIMIT, 3).unwrap();
        }
        assert_eq!(fs::read(backup_path(&log, 1)).unwrap()[0], b'4');
        assert_eq!(fs::read(backup_path(&log, 3)).unwrap()[0], b'2');
        assert!(!backup_path(&log, 4).exists());
    }

    #[test]
    fn missing_log_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(!rotate_if_needed(&dir.path().join("ferry.log"), SMALL_LIMIT, 3).unwrap());
    }
}
