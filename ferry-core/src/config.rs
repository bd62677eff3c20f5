//! Flat configuration record consumed by the orchestrator.
//!
//! # Storage layout
//!
//! ```text
//! ~/.ferry/
//!   config.yaml   (mode 0600, written atomically)
//! ```
//!
//! # API pattern
//!
//! Every filesystem function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{NodeName, ProjectName, ShareName};

pub const DEFAULT_IDLE_TIMEOUT_MINUTES: u64 = 10;
pub const DEFAULT_MAX_PARALLELISM: usize = 8;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SAFETY_MARGIN_MB: u64 = 100;
pub const DEFAULT_HARD_FLOOR_MB: u64 = 50;
pub const DEFAULT_OVERDUE_CAPTURE_MINUTES: u64 = 60;
pub const DEFAULT_SOURCE_TEMPLATE: &str = "/mnt/{node}/{share}";

const MB: u64 = 1024 * 1024;

/// Immutable input to the orchestrator. Owned by whoever edits `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub project_name: ProjectName,
    pub destination_root: PathBuf,
    pub nodes: Vec<NodeName>,
    pub shares: Vec<ShareName>,
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u64,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Share root for a source; `{node}` and `{share}` are substituted.
    #[serde(default = "default_source_template")]
    pub source_template: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_safety_margin_mb")]
    pub safety_margin_mb: u64,
    #[serde(default = "default_hard_floor_mb")]
    pub hard_floor_mb: u64,
    /// Sources that must deliver a capture before it counts as complete.
    /// Defaults to every registered source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sources: Option<usize>,
    #[serde(default = "default_overdue_capture_minutes")]
    pub overdue_capture_minutes: u64,
}

fn default_idle_timeout_minutes() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MINUTES
}

fn default_max_parallelism() -> usize {
    DEFAULT_MAX_PARALLELISM
}

fn default_source_template() -> String {
    DEFAULT_SOURCE_TEMPLATE.to_string()
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_safety_margin_mb() -> u64 {
    DEFAULT_SAFETY_MARGIN_MB
}

fn default_hard_floor_mb() -> u64 {
    DEFAULT_HARD_FLOOR_MB
}

fn default_overdue_capture_minutes() -> u64 {
    DEFAULT_OVERDUE_CAPTURE_MINUTES
}

impl SyncConfig {
    /// A config with every optional field at its default.
    pub fn new(
        project_name: impl Into<ProjectName>,
        destination_root: impl Into<PathBuf>,
        nodes: Vec<NodeName>,
        shares: Vec<ShareName>,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            destination_root: destination_root.into(),
            nodes,
            shares,
            idle_timeout_minutes: DEFAULT_IDLE_TIMEOUT_MINUTES,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            source_template: DEFAULT_SOURCE_TEMPLATE.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            safety_margin_mb: DEFAULT_SAFETY_MARGIN_MB,
            hard_floor_mb: DEFAULT_HARD_FLOOR_MB,
            expected_sources: None,
            overdue_capture_minutes: DEFAULT_OVERDUE_CAPTURE_MINUTES,
        }
    }

    /// Size of the closed source universe (nodes × shares).
    pub fn registered_sources(&self) -> usize {
        self.nodes.len() * self.shares.len()
    }

    /// Quorum size for capture completion.
    pub fn expected_sources(&self) -> usize {
        self.expected_sources
            .unwrap_or_else(|| self.registered_sources())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes.saturating_mul(60))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn overdue_capture_age(&self) -> Duration {
        Duration::from_secs(self.overdue_capture_minutes.saturating_mul(60))
    }

    pub fn safety_margin_bytes(&self) -> u64 {
        self.safety_margin_mb.saturating_mul(MB)
    }

    pub fn hard_floor_bytes(&self) -> u64 {
        self.hard_floor_mb.saturating_mul(MB)
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_name.0.trim().is_empty() {
            return Err(ConfigError::Invalid("project_name is empty".into()));
        }
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("at least one node is required".into()));
        }
        if self.shares.is_empty() {
            return Err(ConfigError::Invalid("at least one share is required".into()));
        }
        if let Some(dup) = first_duplicate(self.nodes.iter().map(|n| n.0.as_str())) {
            return Err(ConfigError::Invalid(format!("duplicate node '{dup}'")));
        }
        if let Some(dup) = first_duplicate(self.shares.iter().map(|s| s.0.as_str())) {
            return Err(ConfigError::Invalid(format!("duplicate share '{dup}'")));
        }
        if self.max_parallelism == 0 {
            return Err(ConfigError::Invalid("max_parallelism must be at least 1".into()));
        }
        if self.idle_timeout_minutes == 0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_minutes must be at least 1".into(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be at least 1".into()));
        }
        if !self.source_template.contains("{node}") || !self.source_template.contains("{share}") {
            return Err(ConfigError::Invalid(format!(
                "source_template '{}' must contain {{node}} and {{share}}",
                self.source_template
            )));
        }
        if self.expected_sources == Some(0) {
            return Err(ConfigError::Invalid("expected_sources must be at least 1".into()));
        }
        Ok(())
    }
}

fn first_duplicate<'a>(names: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let mut seen = HashSet::new();
    names.into_iter().find(|name| !seen.insert(name.to_ascii_lowercase()))
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// `<home>/.ferry/`
pub fn ferry_root(home: &Path) -> PathBuf {
    home.join(".ferry")
}

/// `<home>/.ferry/config.yaml`; pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    ferry_root(home).join("config.yaml")
}

/// Load and validate `<home>/.ferry/config.yaml`.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<SyncConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: SyncConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, ConfigError> {
    load_at(&home()?)
}

/// Validate, then atomically save to `<home>/.ferry/config.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &SyncConfig) -> Result<PathBuf, ConfigError> {
    config.validate()?;
    let dir = ferry_root(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(path)
}

/// `save_at` convenience wrapper.
pub fn save(config: &SyncConfig) -> Result<PathBuf, ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
