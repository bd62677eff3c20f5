//! Resource governor: destination free-space gating and the concurrency cap.
//!
//! Two thresholds apply:
//!
//! | check                     | passes when                               |
//! |---------------------------|-------------------------------------------|
//! | [`ResourceGovernor::can_start`] | `available >= needed + safety_margin` |
//! | [`ResourceGovernor::check_during_transfer`] | `available >= hard_floor` |
//!
//! Free space is probed through [`SpaceProbe`] so tests can script it.

use std::path::{Path, PathBuf};

use ferry_core::SyncConfig;

use crate::error::{io_err, SyncError};

/// Reports free bytes on the volume holding a path.
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> Result<u64, SyncError>;
}

/// Real probe backed by `statvfs`/`GetDiskFreeSpaceEx`.
///
/// The destination may not exist yet, so the nearest existing ancestor is
/// measured instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSpaceProbe;

impl SpaceProbe for DiskSpaceProbe {
    fn available_bytes(&self, path: &Path) -> Result<u64, SyncError> {
        let target = nearest_existing(path);
        fs2::available_space(&target).map_err(|e| io_err(target, e))
    }
}

fn nearest_existing(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorLimits {
    pub safety_margin: u64,
    pub hard_floor: u64,
    pub max_active: usize,
}

impl GovernorLimits {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            safety_margin: config.safety_margin_bytes(),
            hard_floor: config.hard_floor_bytes(),
            max_active: config.registered_sources(),
        }
    }
}

/// Verdict of the in-transfer space check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAction {
    Continue,
    AbortLowSpace { available: u64 },
}

pub struct ResourceGovernor {
    limits: GovernorLimits,
    probe: Box<dyn SpaceProbe>,
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ResourceGovernor {
    pub fn new(limits: GovernorLimits, probe: Box<dyn SpaceProbe>) -> Self {
        Self { limits, probe }
    }

    pub fn with_disk_probe(limits: GovernorLimits) -> Self {
        Self::new(limits, Box::new(DiskSpaceProbe))
    }

    pub fn limits(&self) -> GovernorLimits {
        self.limits
    }

    /// May a pass needing `needed_bytes` start writing under `dest`?
    ///
    /// An unreadable volume counts as full.
    pub fn can_start(&self, dest: &Path, needed_bytes: u64) -> bool {
        match self.probe.available_bytes(dest) {
            Ok(available) => {
                available >= needed_bytes.saturating_add(self.limits.safety_margin)
            }
            Err(err) => {
                tracing::warn!("free-space probe failed: {err}");
                false
            }
        }
    }

    /// Is there room for one more live task?
    pub fn can_admit_more(&self, active: usize) -> bool {
        active < self.limits.max_active
    }

    /// Re-check free space while copies are running.
    ///
    /// A failed probe keeps the transfer going; only a measured shortfall
    /// aborts.
    pub fn check_during_transfer(&self, dest: &Path) -> TransferAction {
        match self.probe.available_bytes(dest) {
            Ok(available) if available < self.limits.hard_floor => {
                TransferAction::AbortLowSpace { available }
            }
            Ok(_) => TransferAction::Continue,
            Err(err) => {
                tracing::warn!("free-space probe failed during transfer: {err}");
                TransferAction::Continue
            }
        }
    }
}

/// Probe returning a scripted value. Shared by tests across the workspace.
#[derive(Debug, Default)]
pub struct FixedSpaceProbe {
    available: std::sync::atomic::AtomicU64,
}

impl FixedSpaceProbe {
    pub fn new(available: u64) -> Self {
        Self {
            available: std::sync::atomic::AtomicU64::new(available),
        }
    }

    pub fn set(&self, available: u64) {
        self.available
            .store(available, std::sync::atomic::Ordering::SeqCst);
    }
}

impl SpaceProbe for FixedSpaceProbe {
    fn available_bytes(&self, _path: &Path) -> Result<u64, SyncError> {
        Ok(self.available.load(std::sync::atomic::Ordering::SeqCst))
    }
}

impl<T: SpaceProbe + ?Sized> SpaceProbe for std::sync::Arc<T> {
    fn available_bytes(&self, path: &Path) -> Result<u64, SyncError> {
        (**self).available_bytes(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;

    const MB: u64 = 1024 * 1024;

    fn governor(available: u64) -> (ResourceGovernor, Arc<FixedSpaceProbe>) {
        let probe = Arc::new(FixedSpaceProbe::new(available));
        let limits = GovernorLimits {
            safety_margin: 100 * MB,
            hard_floor: 50 * MB,
            max_active: 2,
        };
        (ResourceGovernor::new(limits, Box::new(probe.clone())), probe)
    }

    #[rstest]
    #[case::exactly_enough(300 * MB, 200 * MB, true)]
    #[case::one_byte_short(300 * MB - 1, 200 * MB, false)]
    #[case::nothing_needed(100 * MB, 0, true)]
    #[case::margin_not_met(99 * MB, 0, false)]
    fn can_start_applies_safety_margin(
        #[case] available: u64,
        #[case] needed: u64,
        #[case] expected: bool,
    ) {
        let (gov, _) = governor(available);
        assert_eq!(gov.can_start(Path::new("/dest"), needed), expected);
    }

    #[rstest]
    #[case(49 * MB, TransferAction::AbortLowSpace { available: 49 * MB })]
    #[case(50 * MB, TransferAction::Continue)]
    #[case(10_000 * MB, TransferAction::Continue)]
    fn transfer_check_uses_hard_floor(#[case] available: u64, #[case] expected: TransferAction) {
        let (gov, _) = governor(available);
        assert_eq!(gov.check_during_transfer(Path::new("/dest")), expected);
    }

    #[test]
    fn transfer_check_follows_probe_changes() {
        let (gov, probe) = governor(500 * MB);
        assert_eq!(gov.check_during_transfer(Path::new("/d")), TransferAction::Continue);
        probe.set(MB);
        assert_eq!(
            gov.check_during_transfer(Path::new("/d")),
            TransferAction::AbortLowSpace { available: MB }
        );
    }

    #[test]
    fn admission_is_capped() {
        let (gov, _) = governor(0);
        assert!(gov.can_admit_more(0));
        assert!(gov.can_admit_more(1));
        assert!(!gov.can_admit_more(2));
    }

    #[test]
    fn huge_request_does_not_overflow() {
        let (gov, _) = governor(u64::MAX - 1);
        assert!(!gov.can_start(Path::new("/d"), u64::MAX));
    }

    #[test]
    fn disk_probe_measures_missing_destination_via_ancestor() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("not/yet/created");
        assert!(DiskSpaceProbe.available_bytes(&missing).is_ok());
    }
}
