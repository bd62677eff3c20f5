//! File-backed [`LogSink`] for the daemon.
//!
//! Each line is appended as `<rfc3339> <LEVEL> <message>` to the daemon log
//! and mirrored into `tracing`. The file is reopened per line so rotation can
//! rename it underneath us.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use ferry_sync::{LogLevel, LogSink};
use parking_lot::Mutex;

#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, level: LogLevel, line: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(
            file,
            "{} {} {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            level_tag(level),
            line
        )
    }
}

fn level_tag(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "INFO",
        LogLevel::Warn => "WARN",
        LogLevel::Error => "ERROR",
    }
}

impl LogSink for FileSink {
    fn emit(&self, level: LogLevel, line: &str) {
        match level {
            LogLevel::Info => tracing::info!("{line}"),
            LogLevel::Warn => tracing::warn!("{line}"),
            LogLevel::Error => tracing::error!("{line}"),
        }
        if let Err(err) = self.append(level, line) {
            tracing::warn!(
                path = %self.path.display(),
                error = %err,
                "failed to append to log file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appends_timestamped_lines_and_creates_parent() {
        let dir = TempDir::new().unwrap();
        let sink = FileSink::new(dir.path().join("logs/ferry.log"));
        sink.info("first");
        sink.error("second");

        let body = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" INFO first"));
        assert!(lines[1].ends_with(" ERROR second"));
        assert!(lines[0].contains('T'), "rfc3339 timestamp: {}", lines[0]);
    }

    #[test]
    fn recreates_log_after_rotation() {
        let dir = TempDir::new().unwrap();
        let sink = FileSink::new(dir.path().join("ferry.log"));
        sink.info("before");
        std::fs::rename(sink.path(), dir.path().join("ferry.log.1")).unwrap();
        sink.warn("after");

        let body = std::fs::read_to_string(sink.path()).unwrap();
        assert!(body.contains("WARN after"));
        assert!(!body.contains("before"));
    }
}
