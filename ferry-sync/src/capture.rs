//! Capture completion tracking.
//!
//! Every copied file whose name matches the capture grammar adds its source to
//! the capture's delivered set. When the set reaches the expected source count
//! the capture completes: the caller gets a [`CaptureCompletion`] once, the
//! pending entry is evicted, and the key moves to a bounded ring of recently
//! completed keys so late duplicates cannot complete it again.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use ferry_core::{CaptureKey, CaptureKind, SourceKey};
use parking_lot::Mutex;
use serde::Serialize;

use crate::capture_name::parse_capture_name;

/// How many completed keys are remembered after eviction.
pub const COMPLETED_RING_CAPACITY: usize = 4096;

/// One-shot event for a capture seen on every expected source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCompletion {
    pub key: CaptureKey,
    pub kind: CaptureKind,
    pub sources: BTreeSet<SourceKey>,
}

/// A capture pending for longer than the configured age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverdueCapture {
    pub key: CaptureKey,
    pub kind: CaptureKind,
    pub delivered: BTreeSet<SourceKey>,
    pub age: Duration,
}

/// Counters reported by the daemon `status` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub pending: usize,
    pub completed_production: u64,
    pub completed_test: u64,
}

#[derive(Debug)]
struct Pending {
    kind: CaptureKind,
    delivered: BTreeSet<SourceKey>,
    first_seen: Instant,
    flagged: bool,
}

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<CaptureKey, Pending>,
    recent: VecDeque<CaptureKey>,
    recent_set: HashSet<CaptureKey>,
    stats: CaptureStats,
}

impl Inner {
    fn remember(&mut self, key: CaptureKey, capacity: usize) {
        if self.recent.len() == capacity {
            if let Some(oldest) = self.recent.pop_front() {
                self.recent_set.remove(&oldest);
            }
        }
        self.recent.push_back(key);
        self.recent_set.insert(key);
    }
}

/// Thread-safe tracker shared by every sync task.
#[derive(Debug)]
pub struct CaptureTracker {
    expected: usize,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl CaptureTracker {
    /// `expected` is the number of sources that must deliver a capture.
    pub fn new(expected: usize) -> Self {
        Self::with_capacity(expected, COMPLETED_RING_CAPACITY)
    }

    pub fn with_capacity(expected: usize, capacity: usize) -> Self {
        Self {
            expected: expected.max(1),
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Record that `source` delivered `file_name`.
    ///
    /// Names outside the capture grammar are ignored. Returns the completion
    /// event exactly once per capture.
    pub fn on_file_copied(&self, file_name: &str, source: &SourceKey) -> Option<CaptureCompletion> {
        self.on_file_copied_at(file_name, source, Instant::now())
    }

    pub fn on_file_copied_at(
        &self,
        file_name: &str,
        source: &SourceKey,
        now: Instant,
    ) -> Option<CaptureCompletion> {
        let name = parse_capture_name(file_name)?;
        let mut inner = self.inner.lock();
        if inner.recent_set.contains(&name.key) {
            return None;
        }

        let entry = inner.pending.entry(name.key).or_insert_with(|| Pending {
            kind: name.kind,
            delivered: BTreeSet::new(),
            first_seen: now,
            flagged: false,
        });
        if name.kind == CaptureKind::Test {
            entry.kind = CaptureKind::Test;
        }
        entry.delivered.insert(source.clone());
        if entry.delivered.len() < self.expected {
            return None;
        }

        let done = inner.pending.remove(&name.key)?;
        match done.kind {
            CaptureKind::Production => inner.stats.completed_production += 1,
            CaptureKind::Test => inner.stats.completed_test += 1,
        }
        inner.remember(name.key, self.capacity);
        Some(CaptureCompletion {
            key: name.key,
            kind: done.kind,
            sources: done.delivered,
        })
    }

    /// True while the key is remembered as completed.
    pub fn is_complete(&self, key: CaptureKey) -> bool {
        self.inner.lock().recent_set.contains(&key)
    }

    pub fn is_pending(&self, key: CaptureKey) -> bool {
        self.inner.lock().pending.contains_key(&key)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Pending captures older than `age` not reported before.
    ///
    /// Each capture is returned at most once.
    pub fn overdue_at(&self, now: Instant, age: Duration) -> Vec<OverdueCapture> {
        let mut inner = self.inner.lock();
        let mut out: Vec<OverdueCapture> = inner
            .pending
            .iter_mut()
            .filter_map(|(key, pending)| {
                let waited = now.saturating_duration_since(pending.first_seen);
                if pending.flagged || waited < age {
                    return None;
                }
                pending.flagged = true;
                Some(OverdueCapture {
                    key: *key,
                    kind: pending.kind,
                    delivered: pending.delivered.clone(),
                    age: waited,
                })
            })
            .collect();
        out.sort_by_key(|o| o.key);
        out
    }

    pub fn stats(&self) -> CaptureStats {
        let inner = self.inner.lock();
        CaptureStats {
            pending: inner.pending.len(),
            ..inner.stats
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn n1() -> SourceKey {
        SourceKey::new("n1", "d")
    }

    fn n2() -> SourceKey {
        SourceKey::new("n2", "d")
    }

    #[test]
    fn two_sources_complete_capture_with_leading_zeros() {
        let tracker = CaptureTracker::new(2);
        assert!(tracker
            .on_file_copied("L1_00042_Orion_1_S1.raw", &n1())
            .is_none());
        assert!(!tracker.is_complete(CaptureKey(42)));
        assert!(tracker.is_pending(CaptureKey(42)));

        let done = tracker
            .on_file_copied("L1_42_Orion_1_S1.raw", &n2())
            .expect("completes on second source");
        assert_eq!(done.key, CaptureKey(42));
        assert_eq!(done.kind, CaptureKind::Production);
        assert_eq!(done.sources.len(), 2);
        assert!(tracker.is_complete(CaptureKey(42)));
        assert_eq!(tracker.pending_len(), 0);
    }

    #[test]
    fn completion_is_declared_once() {
        let tracker = CaptureTracker::new(2);
        tracker.on_file_copied("L1_7_P_1_S.raw", &n1());
        assert!(tracker.on_file_copied("L1_7_P_1_S.raw", &n2()).is_some());
        assert!(tracker.on_file_copied("L1_7_P_1_S.raw", &n1()).is_none());
        assert!(tracker.on_file_copied("L1_7_P_1_S.idx", &n2()).is_none());
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(tracker.stats().completed_production, 1);
    }

    #[test]
    fn same_source_twice_does_not_complete() {
        let tracker = CaptureTracker::new(2);
        tracker.on_file_copied("L1_7_P_1_S.raw", &n1());
        assert!(tracker.on_file_copied("L1_7_P_1_S.idx", &n1()).is_none());
        assert!(tracker.is_pending(CaptureKey(7)));
    }

    #[test]
    fn test_marker_on_any_delivery_marks_capture_as_test() {
        let tracker = CaptureTracker::new(2);
        tracker.on_file_copied("L1_9_P_1_S.raw", &n1());
        let done = tracker.on_file_copied("L1_9_test_P_1_S.raw", &n2()).unwrap();
        assert_eq!(done.kind, CaptureKind::Test);
        assert_eq!(tracker.stats().completed_test, 1);
    }

    #[test]
    fn unrelated_names_are_ignored() {
        let tracker = CaptureTracker::new(1);
        assert!(tracker.on_file_copied("README.md", &n1()).is_none());
        assert_eq!(tracker.pending_len(), 0);
    }

    #[test]
    fn ring_forgets_oldest_completed_keys() {
        let tracker = CaptureTracker::with_capacity(1, 2);
        for id in 1..=3 {
            assert!(tracker
                .on_file_copied(&format!("L1_{id}_P_1_S"), &n1())
                .is_some());
        }
        assert!(!tracker.is_complete(CaptureKey(1)));
        assert!(tracker.is_complete(CaptureKey(2)));
        assert!(tracker.is_complete(CaptureKey(3)));
    }

    #[test]
    fn overdue_reports_each_capture_once() {
        let tracker = CaptureTracker::new(3);
        let start = Instant::now();
        tracker.on_file_copied_at("L1_5_P_1_S", &n1(), start);
        tracker.on_file_copied_at("L1_6_P_1_S", &n2(), start + Duration::from_secs(30 * 60));

        let hour = Duration::from_secs(3600);
        assert!(tracker.overdue_at(start + Duration::from_secs(10), hour).is_empty());

        let late = tracker.overdue_at(start + hour, hour);
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].key, CaptureKey(5));
        assert!(late[0].delivered.contains(&n1()));

        assert!(tracker.overdue_at(start + hour, hour).is_empty());
        let later = tracker.overdue_at(start + 2 * hour, hour);
        assert_eq!(later.iter().map(|o| o.key).collect::<Vec<_>>(), [CaptureKey(6)]);
    }

    #[test]
    fn stats_count_pending() {
        let tracker = CaptureTracker::new(2);
        tracker.on_file_copied("L1_1_P_1_S", &n1());
        tracker.on_file_copied("L1_2_P_1_S", &n1());
        assert_eq!(
            tracker.stats(),
            CaptureStats {
                pending: 2,
                completed_production: 0,
                completed_test: 0,
            }
        );
    }
}
