//! Ferry core library: domain types, configuration, source registry, errors.
//!
//! Public API surface:
//! - [`types`]: newtypes and domain structs
//! - [`config`]: the flat configuration record and its YAML persistence
//! - [`registry`]: [`SourceRegistry`] discovery / resolution
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod registry;
pub mod types;

pub use config::SyncConfig;
pub use error::ConfigError;
pub use registry::SourceRegistry;
pub use types::{
    progress_percent, CaptureKey, CaptureKind, NodeName, ProjectName, ShareName, SourceKey,
    SourceRoot, TaskState, TaskStatus,
};
