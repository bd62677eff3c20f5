//! Log sink abstraction.
//!
//! Copy jobs and capture tracking report human-readable lines through a
//! [`LogSink`] so the daemon can route them to its own file and tests can
//! capture them in memory. The sink is best-effort: emitting never fails.

use parking_lot::Mutex;

/// Severity of a sink line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Destination for operator-facing log lines.
pub trait LogSink: Send + Sync {
    fn emit(&self, level: LogLevel, line: &str);

    fn info(&self, line: &str) {
        self.emit(LogLevel::Info, line);
    }

    fn warn(&self, line: &str) {
        self.emit(LogLevel::Warn, line);
    }

    fn error(&self, line: &str) {
        self.emit(LogLevel::Error, line);
    }
}

/// Forwards every line to the process-wide logging facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeSink;

impl LogSink for FacadeSink {
    fn emit(&self, level: LogLevel, line: &str) {
        match level {
            LogLevel::Info => tracing::info!("{line}"),
            LogLevel::Warn => tracing::warn!("{line}"),
            LogLevel::Error => tracing::error!("{line}"),
        }
    }
}

/// Keeps every line in memory. Used by tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().clone()
    }

    /// Lines containing `needle`, any level.
    pub fn matching(&self, needle: &str) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(_, line)| line.contains(needle))
            .map(|(_, line)| line.clone())
            .collect()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, level: LogLevel, line: &str) {
        self.lines.lock().push((level, line.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_records_levels_in_order() {
        let sink = MemorySink::new();
        sink.info("one");
        sink.warn("two");
        sink.error("three");
        assert_eq!(
            sink.lines(),
            vec![
                (LogLevel::Info, "one".to_string()),
                (LogLevel::Warn, "two".to_string()),
                (LogLevel::Error, "three".to_string()),
            ]
        );
        assert_eq!(sink.matching("tw"), ["two"]);
    }
}
