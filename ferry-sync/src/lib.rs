//! # ferry-sync
//!
//! Per-source copy machinery: diff scanning, the parallel retrying copier,
//! the destination free-space governor, and capture completion tracking.
//!
//! A typical pass for one source:
//!
//! 1. [`scan`] the source root against the destination and collect the due
//!    [`FileRecord`]s;
//! 2. ask [`ResourceGovernor::can_start`] whether the bytes fit;
//! 3. [`copy_all`] them, feeding a [`CopyObserver`] that forwards copied file
//!    names to the shared [`CaptureTracker`].

pub mod capture;
pub mod capture_name;
pub mod copier;
pub mod error;
pub mod governor;
pub mod retry;
pub mod scan;
pub mod sink;

pub use capture::{CaptureCompletion, CaptureStats, CaptureTracker, OverdueCapture};
pub use capture_name::{parse_capture_name, CaptureName};
pub use copier::{copy_all, copy_file, CopyObserver, CopyOptions, CopyResult, NoopObserver};
pub use error::SyncError;
pub use governor::{
    DiskSpaceProbe, FixedSpaceProbe, GovernorLimits, ResourceGovernor, SpaceProbe, TransferAction,
};
pub use retry::{Backoff, RetryOutcome, RetryPolicy};
pub use scan::{is_excluded_dir, needs_copy, scan, DiffScan, FileRecord, MTIME_TOLERANCE};
pub use sink::{FacadeSink, LogLevel, LogSink, MemorySink};
