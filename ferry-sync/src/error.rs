//! Error types for ferry-sync.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from scanning or copying.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory enumeration failed for a reason other than access denial.
    #[error("scan failed under {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    /// The copy was stopped by its task's cancellation token.
    #[error("copy of {path} cancelled")]
    Cancelled { path: PathBuf },

    /// A blocking copy or scan job panicked or was aborted.
    #[error("background job failed: {0}")]
    Join(String),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
