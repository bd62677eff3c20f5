use std::path::{Path, PathBuf};
use std::time::Duration;

pub use ferry_core::config::ferry_root;

pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const DAEMON_LOG: &str = "ferry.log";

/// Cadence of the in-transfer free-space watchdog.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// How long shutdown waits for live tasks to exit.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// How long an idle stop waits for the cancelled task before moving on.
pub const IDLE_STOP_GRACE: Duration = Duration::from_secs(5);

pub fn socket_path(home: &Path) -> PathBuf {
    ferry_root(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    ferry_root(home).join("logs")
}

pub fn log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_LOG)
}
