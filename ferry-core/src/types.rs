//! Domain types shared by the sync engine, the daemon, and the CLI.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.

use std::fmt;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A worker node exposing one or more shares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeName(pub String);

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for NodeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A named share on a worker node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShareName(pub String);

impl fmt::Display for ShareName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ShareName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ShareName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// The project directory pulled from every source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectName(pub String);

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ProjectName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProjectName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Stable identity of one remote source. Ordered by node, then share.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub node: NodeName,
    pub share: ShareName,
}

impl SourceKey {
    pub fn new(node: impl Into<NodeName>, share: impl Into<ShareName>) -> Self {
        Self {
            node: node.into(),
            share: share.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.share)
    }
}

/// A source that resolved during the current poll cycle.
///
/// Never cached across cycles: remote shares come and go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRoot {
    pub key: SourceKey,
    pub project: ProjectName,
    /// `<share root>/<project>` as it exists right now.
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Captures
// ---------------------------------------------------------------------------

/// Normalized capture identifier. Leading zeros are not significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CaptureKey(pub u64);

impl fmt::Display for CaptureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CaptureKey {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

/// Whether a capture was recorded as a test run or for production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    #[default]
    Production,
    Test,
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureKind::Production => write!(f, "production"),
            CaptureKind::Test => write!(f, "test"),
        }
    }
}

// ---------------------------------------------------------------------------
// Task lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of one per-source transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Scanning,
    Copying,
    Completed,
    IdleStopped,
    Failed,
}

impl TaskState {
    /// `Completed`, `IdleStopped` and `Failed` end the task; it is reaped on the next poll.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::IdleStopped | TaskState::Failed
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Scanning => write!(f, "scanning"),
            TaskState::Copying => write!(f, "copying"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::IdleStopped => write!(f, "idle_stopped"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// One row of the live status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub node: NodeName,
    pub share: ShareName,
    /// `None` while no task is live for this source.
    pub state: Option<TaskState>,
    pub last_activity: Option<DateTime<Utc>>,
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub files_failed: u64,
    /// `None` while the total is unknown (nothing scanned yet).
    pub progress_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Integer percentage of `done` over `total`, clamped to 100.
pub fn progress_percent(done: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let pct = (u128::from(done) * 100 / u128::from(total)).min(100);
    Some(pct as u8)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
