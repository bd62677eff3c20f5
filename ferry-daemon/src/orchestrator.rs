//! The control plane: one poll decides which sources get a sync task.
//!
//! Per poll, in order:
//! 1. reap tasks whose worker has exited, keeping their counters as carry;
//! 2. idle-stop live tasks with no progress for the idle timeout;
//! 3. report captures pending for too long;
//! 4. admit a new task for every resolving source without one.
//!
//! The live-task arena is keyed by [`SourceKey`], so a source never has two
//! tasks at once. A task that ignores an idle stop stays in the arena until
//! its worker exits.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ferry_core::{
    ProjectName, SourceKey, SourceRegistry, SourceRoot, SyncConfig, TaskState, TaskStatus,
};
use ferry_sync::{
    CaptureStats, CaptureTracker, CopyOptions, GovernorLimits, LogSink, ResourceGovernor,
    RetryPolicy,
};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::paths::{IDLE_STOP_GRACE, WATCHDOG_INTERVAL};
use crate::task::{Carry, SyncTask, TaskContext};

/// Tunables derived from [`SyncConfig`]; tests build them directly.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub project: ProjectName,
    /// Shared destination tree every source merges into.
    pub destination: PathBuf,
    pub idle_timeout: Duration,
    pub overdue_capture_age: Duration,
    pub copy: CopyOptions,
    pub watchdog_interval: Duration,
    pub idle_stop_grace: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            project: config.project_name.clone(),
            destination: config.destination_root.join(&config.project_name.0),
            idle_timeout: config.idle_timeout(),
            overdue_capture_age: config.overdue_capture_age(),
            copy: CopyOptions {
                max_parallelism: config.max_parallelism,
                retry: RetryPolicy::default(),
            },
            watchdog_interval: WATCHDOG_INTERVAL,
            idle_stop_grace: IDLE_STOP_GRACE,
        }
    }
}

struct LiveTask {
    task: Arc<SyncTask>,
    handle: JoinHandle<()>,
}

enum Admission {
    Ready { root: SourceRoot, carry: Carry },
    NoSpace(SourceKey),
}

/// What one poll did, mostly for tests and debug logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub reaped: Vec<SourceKey>,
    pub idle_stopped: Vec<SourceKey>,
    pub started: Vec<SourceKey>,
    pub deferred: Vec<SourceKey>,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    registry: SourceRegistry,
    governor: Arc<ResourceGovernor>,
    tracker: Arc<CaptureTracker>,
    sink: Arc<dyn LogSink>,
    root_cancel: CancellationToken,
    live: Mutex<BTreeMap<SourceKey, LiveTask>>,
    history: RwLock<BTreeMap<SourceKey, Carry>>,
}

impl Orchestrator {
    /// Wire an orchestrator from config using the real disk probe.
    pub fn from_config(config: &SyncConfig, sink: Arc<dyn LogSink>) -> Self {
        let registry = SourceRegistry::from_config(config);
        let governor = ResourceGovernor::with_disk_probe(GovernorLimits::from_config(config));
        if let Some(expected) = config.expected_sources {
            if expected != registry.len() {
                sink.warn(&format!(
                    "expected_sources is {expected} but {} sources are registered; \
                     captures complete after {expected} deliveries",
                    registry.len()
                ));
            }
        }
        let tracker = CaptureTracker::new(config.expected_sources());
        Self::new(
            OrchestratorSettings::from_config(config),
            registry,
            governor,
            tracker,
            sink,
        )
    }

    pub fn new(
        settings: OrchestratorSettings,
        registry: SourceRegistry,
        governor: ResourceGovernor,
        tracker: CaptureTracker,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            settings,
            registry,
            governor: Arc::new(governor),
            tracker: Arc::new(tracker),
            sink,
            root_cancel: CancellationToken::new(),
            live: Mutex::new(BTreeMap::new()),
            history: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &CaptureTracker {
        &self.tracker
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.tracker.stats()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub async fn poll_once(&self) -> PollReport {
        self.poll_once_at(Instant::now()).await
    }

    /// Run one control cycle as if the clock read `now`.
    pub async fn poll_once_at(&self, now: Instant) -> PollReport {
        let mut report = PollReport::default();
        if self.root_cancel.is_cancelled() {
            return report;
        }
        self.reap(&mut report);
        self.stop_idle(now, &mut report).await;
        self.flag_overdue(now);
        self.admit(&mut report).await;
        tracing::debug!(
            reaped = report.reaped.len(),
            idle_stopped = report.idle_stopped.len(),
            started = report.started.len(),
            deferred = report.deferred.len(),
            "poll complete"
        );
        report
    }

    fn reap(&self, report: &mut PollReport) {
        let finished: Vec<(SourceKey, LiveTask)> = {
            let mut live = self.live.lock();
            let keys: Vec<SourceKey> = live
                .iter()
                .filter(|(_, entry)| entry.handle.is_finished())
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| live.remove(&key).map(|entry| (key, entry)))
                .collect()
        };
        for (key, entry) in finished {
            self.retire(&key, &entry.task);
            report.reaped.push(key);
        }
    }

    async fn stop_idle(&self, now: Instant, report: &mut PollReport) {
        let idle: Vec<(SourceKey, LiveTask)> = {
            let mut live = self.live.lock();
            let keys: Vec<SourceKey> = live
                .iter()
                .filter(|(_, entry)| {
                    !entry.task.state().is_terminal()
                        && entry.task.is_idle_at(now, self.settings.idle_timeout)
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| live.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        for (key, mut entry) in idle {
            entry.task.finish(
                TaskState::IdleStopped,
                Some(format!(
                    "no progress for {}s",
                    self.settings.idle_timeout.as_secs()
                )),
            );
            entry.task.cancel_token().cancel();
            self.sink
                .info(&format!("[{key}] idle timeout reached, stopping"));

            match tokio::time::timeout(self.settings.idle_stop_grace, &mut entry.handle).await {
                Ok(_) => self.retire(&key, &entry.task),
                Err(_) => {
                    tracing::warn!(
                        source = %key,
                        "idle-stopped task still running after grace period"
                    );
                    self.live.lock().insert(key.clone(), entry);
                }
            }
            report.idle_stopped.push(key);
        }
    }

    fn flag_overdue(&self, now: Instant) {
        for overdue in self
            .tracker
            .overdue_at(now, self.settings.overdue_capture_age)
        {
            let missing: Vec<String> = self
                .registry
                .discover(&self.settings.project)
                .into_iter()
                .filter(|key| !overdue.delivered.contains(key))
                .map(|key| key.to_string())
                .collect();
            self.sink.warn(&format!(
                "capture {} ({}) pending for {} min, missing: {}",
                overdue.key,
                overdue.kind,
                overdue.age.as_secs() / 60,
                missing.join(", ")
            ));
        }
    }

    /// Resolve and space-check every idle key off the runtime, then spawn
    /// tasks under a short lock. `live` is never held across filesystem I/O.
    async fn admit(&self, report: &mut PollReport) {
        let candidates: Vec<(SourceKey, Carry)> = {
            let live = self.live.lock();
            let history = self.history.read();
            self.registry
                .discover(&self.settings.project)
                .into_iter()
                .filter(|key| !live.contains_key(key))
                .map(|key| {
                    let carry = history.get(&key).cloned().unwrap_or_default();
                    (key, carry)
                })
                .collect()
        };
        if candidates.is_empty() {
            return;
        }

        let registry = self.registry.clone();
        let governor = Arc::clone(&self.governor);
        let project = self.settings.project.clone();
        let destination = self.settings.destination.clone();
        let checked = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .filter_map(|(key, carry)| {
                    let root = registry.resolve(&key, &project)?;
                    let fits = governor.can_start(&destination, carry.outstanding_bytes());
                    Some(if fits {
                        Admission::Ready { root, carry }
                    } else {
                        Admission::NoSpace(key)
                    })
                })
                .collect::<Vec<_>>()
        })
        .await;
        let admissions = match checked {
            Ok(admissions) => admissions,
            Err(err) => {
                tracing::error!(error = %err, "source admission check failed");
                return;
            }
        };

        for admission in admissions {
            let (root, carry) = match admission {
                Admission::Ready { root, carry } => (root, carry),
                Admission::NoSpace(key) => {
                    self.sink.warn(&format!(
                        "[{key}] not started: insufficient destination space"
                    ));
                    report.deferred.push(key);
                    continue;
                }
            };
            let key = root.key.clone();
            let mut live = self.live.lock();
            if self.root_cancel.is_cancelled() {
                return;
            }
            if live.contains_key(&key) {
                continue;
            }
            if !self.governor.can_admit_more(live.len()) {
                break;
            }

            let task = Arc::new(SyncTask::new(
                key.clone(),
                self.root_cancel.child_token(),
                &carry,
            ));
            let ctx = TaskContext {
                root,
                destination: self.settings.destination.clone(),
                governor: Arc::clone(&self.governor),
                tracker: Arc::clone(&self.tracker),
                sink: Arc::clone(&self.sink),
                copy: self.settings.copy,
                watchdog_interval: self.settings.watchdog_interval,
            };
            let handle = tokio::spawn(Arc::clone(&task).run(ctx));
            live.insert(key.clone(), LiveTask { task, handle });
            tracing::debug!(source = %key, "sync task started");
            report.started.push(key);
        }
    }

    fn retire(&self, key: &SourceKey, task: &SyncTask) {
        let carry = task.carry();
        tracing::debug!(source = %key, state = ?carry.last_state, "sync task retired");
        self.history.write().insert(key.clone(), carry);
    }

    /// One row per registered source, in key order. Never waits on workers.
    pub fn snapshot(&self) -> Vec<TaskStatus> {
        let live = self.live.lock();
        let history = self.history.read();
        self.registry
            .discover(&self.settings.project)
            .iter()
            .map(|key| match live.get(key) {
                Some(entry) => entry.task.status(),
                None => history
                    .get(key)
                    .cloned()
                    .unwrap_or_default()
                    .idle_status(key),
            })
            .collect()
    }

    /// Cancel every live task and wait up to `grace` for them to exit.
    pub async fn stop(&self, grace: Duration) {
        self.root_cancel.cancel();
        let entries: Vec<(SourceKey, LiveTask)> =
            std::mem::take(&mut *self.live.lock()).into_iter().collect();
        let deadline = tokio::time::Instant::now() + grace;
        for (key, mut entry) in entries {
            if tokio::time::timeout_at(deadline, &mut entry.handle)
                .await
                .is_err()
            {
                tracing::warn!(source = %key, "task did not stop within grace period");
                entry.handle.abort();
            }
            self.retire(&key, &entry.task);
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_stuck_task(&self, key: SourceKey) -> Arc<SyncTask> {
        let task = Arc::new(SyncTask::new(
            key.clone(),
            self.root_cancel.child_token(),
            &Carry::default(),
        ));
        let token = task.cancel_token().clone();
        let handle = tokio::spawn(async move { token.cancelled().await });
        self.live.lock().insert(
            key,
            LiveTask {
                task: Arc::clone(&task),
                handle,
            },
        );
        task
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{NodeName, ShareName};
    use ferry_sync::{Backoff, FixedSpaceProbe, MemorySink, SpaceProbe, SyncError};
    use std::fs;
    use tempfile::TempDir;

    const GB: u64 = 1024 * 1024 * 1024;

    struct Fixture {
        mounts: TempDir,
        dest: TempDir,
        sink: Arc<MemorySink>,
        probe: Arc<FixedSpaceProbe>,
        orch: Orchestrator,
    }

    fn orchestrator(
        mounts: &TempDir,
        dest: &TempDir,
        expected: usize,
        sink: Arc<MemorySink>,
        probe: Box<dyn SpaceProbe>,
    ) -> Orchestrator {
        let registry = SourceRegistry::new(
            vec![NodeName::from("n1"), NodeName::from("n2")],
            vec![ShareName::from("d")],
            format!("{}/{{node}}/{{share}}", mounts.path().display()),
        );
        let governor = ResourceGovernor::new(
            GovernorLimits {
                safety_margin: 1024,
                hard_floor: 512,
                max_active: 2,
            },
            probe,
        );
        let settings = OrchestratorSettings {
            project: ProjectName::from("orion"),
            destination: dest.path().join("orion"),
            idle_timeout: Duration::from_secs(600),
            overdue_capture_age: Duration::from_secs(3600),
            copy: CopyOptions {
                max_parallelism: 2,
                retry: RetryPolicy {
                    max_attempts: 1,
                    backoff: Backoff::None,
                },
            },
            watchdog_interval: Duration::from_millis(50),
            idle_stop_grace: Duration::from_secs(2),
        };
        Orchestrator::new(settings, registry, governor, CaptureTracker::new(expected), sink)
    }

    fn fixture(expected: usize) -> Fixture {
        let mounts = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let probe = Arc::new(FixedSpaceProbe::new(10 * GB));
        let sink = Arc::new(MemorySink::new());
        let orch = orchestrator(&mounts, &dest, expected, sink.clone(), Box::new(probe.clone()));
        Fixture {
            mounts,
            dest,
            sink,
            probe,
            orch,
        }
    }

    fn seed(fx: &Fixture, node: &str, rel: &str) {
        let path = fx.mounts.path().join(node).join("d/orion").join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, rel.as_bytes()).unwrap();
    }

    async fn settle(orch: &Orchestrator) {
        for _ in 0..200 {
            let busy = orch
                .live
                .lock()
                .values()
                .any(|entry| !entry.handle.is_finished());
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tasks did not finish");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn only_resolving_sources_get_tasks() {
        let fx = fixture(2);
        seed(&fx, "n1", "a.raw");

        let report = fx.orch.poll_once().await;
        assert_eq!(report.started, vec![SourceKey::new("n1", "d")]);
        settle(&fx.orch).await;

        let rows = fx.orch.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].state, Some(TaskState::Completed));
        assert_eq!(rows[0].files_copied, 1);
        assert_eq!(rows[1].state, None);
        assert_eq!(rows[1].progress_percent, None);
        assert!(fx.dest.path().join("orion/a.raw").is_file());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finished_tasks_are_reaped_and_restarted_with_carry() {
        let fx = fixture(2);
        seed(&fx, "n1", "a.raw");
        fx.orch.poll_once().await;
        settle(&fx.orch).await;

        seed(&fx, "n1", "b.raw");
        let report = fx.orch.poll_once().await;
        assert_eq!(report.reaped, vec![SourceKey::new("n1", "d")]);
        assert_eq!(report.started, vec![SourceKey::new("n1", "d")]);
        settle(&fx.orch).await;

        let row = &fx.orch.snapshot()[0];
        assert_eq!(row.files_copied, 2);
        assert_eq!(row.progress_percent, Some(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn polls_without_progress_keep_last_activity() {
        let fx = fixture(2);
        seed(&fx, "n1", "a.raw");
        fx.orch.poll_once().await;
        settle(&fx.orch).await;
        let first = fx.orch.snapshot()[0].last_activity;
        assert!(first.is_some());

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            fx.orch.poll_once().await;
            settle(&fx.orch).await;
        }

        let row = &fx.orch.snapshot()[0];
        assert_eq!(row.files_copied, 1);
        assert_eq!(row.last_activity, first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn successor_task_inherits_the_quiet_clock() {
        let fx = fixture(2);
        let key = SourceKey::new("n1", "d");
        seed(&fx, "n1", "a.raw");
        fx.orch.poll_once().await;
        settle(&fx.orch).await;

        let later = Instant::now() + Duration::from_secs(601);
        let report = fx.orch.poll_once_at(later).await;
        assert_eq!(report.reaped, vec![key.clone()]);
        assert_eq!(report.started, vec![key.clone()]);

        let idle = fx.orch.live.lock()[&key]
            .task
            .is_idle_at(later, fx.orch.settings().idle_timeout);
        assert!(idle, "a fresh task must not reset the source's idle clock");
        settle(&fx.orch).await;
    }

    /// Disk whose free-space query stalls, like statvfs on a wedged mount.
    struct SlowDisk(Duration);

    impl SpaceProbe for SlowDisk {
        fn available_bytes(&self, _path: &std::path::Path) -> Result<u64, SyncError> {
            std::thread::sleep(self.0);
            Ok(10 * GB)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn snapshot_does_not_wait_for_admission_io() {
        let mounts = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::create_dir_all(mounts.path().join("n1/d/orion")).unwrap();
        let orch = Arc::new(orchestrator(
            &mounts,
            &dest,
            2,
            Arc::new(MemorySink::new()),
            Box::new(SlowDisk(Duration::from_secs(2))),
        ));

        let polling = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.poll_once().await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let rows = orch.snapshot();
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "snapshot waited {:?}",
            started.elapsed()
        );
        assert_eq!(rows.len(), 2);
        assert!(!polling.is_finished());

        let report = polling.await.unwrap();
        assert_eq!(report.started, vec![SourceKey::new("n1", "d")]);
        orch.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_task_is_stopped_on_next_poll_and_key_freed() {
        let fx = fixture(2);
        let key = SourceKey::new("n2", "d");
        let task = fx.orch.insert_stuck_task(key.clone());

        let later = Instant::now() + Duration::from_secs(601);
        let report = fx.orch.poll_once_at(later).await;

        assert_eq!(report.idle_stopped, vec![key.clone()]);
        assert_eq!(task.state(), TaskState::IdleStopped);
        assert!(task.cancel_token().is_cancelled());
        assert_eq!(fx.orch.live_count(), 0);
        assert_eq!(fx.sink.matching("idle timeout").len(), 1);

        // Source now resolves: the freed key is admitted again.
        seed(&fx, "n2", "x.raw");
        let report = fx.orch.poll_once().await;
        assert_eq!(report.started, vec![key]);
        settle(&fx.orch).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fresh_task_is_not_idle_stopped() {
        let fx = fixture(2);
        fx.orch.insert_stuck_task(SourceKey::new("n1", "d"));
        let report = fx.orch.poll_once().await;
        assert!(report.idle_stopped.is_empty());
        assert_eq!(fx.orch.live_count(), 1);
        fx.orch.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn low_space_defers_admission() {
        let fx = fixture(2);
        seed(&fx, "n1", "a.raw");
        fx.probe.set(100);

        let report = fx.orch.poll_once().await;
        assert!(report.started.is_empty());
        assert_eq!(report.deferred, vec![SourceKey::new("n1", "d")]);
        assert_eq!(fx.sink.matching("insufficient destination space").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capture_completes_across_two_sources() {
        let fx = fixture(2);
        seed(&fx, "n1", "L1_00042_Orion_001_S1.raw");
        seed(&fx, "n2", "L1_42_Orion_002_S1.raw");

        fx.orch.poll_once().await;
        settle(&fx.orch).await;

        assert!(fx.orch.tracker().is_complete(ferry_core::CaptureKey(42)));
        assert_eq!(fx.sink.matching("capture 42 complete").len(), 1);
        assert_eq!(fx.orch.capture_stats().completed_production, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overdue_capture_is_reported_once_with_missing_source() {
        let fx = fixture(2);
        seed(&fx, "n1", "L1_7_Orion_1_S.raw");
        fx.orch.poll_once().await;
        settle(&fx.orch).await;

        let later = Instant::now() + Duration::from_secs(3601);
        fx.orch.poll_once_at(later).await;
        fx.orch.poll_once_at(later).await;

        let warnings = fx.sink.matching("capture 7 (production) pending");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].ends_with("missing: n2/d"), "{}", warnings[0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_cancels_live_tasks_and_blocks_new_ones() {
        let fx = fixture(2);
        let task = fx.orch.insert_stuck_task(SourceKey::new("n1", "d"));
        fx.orch.stop(Duration::from_secs(1)).await;

        assert!(task.cancel_token().is_cancelled());
        assert_eq!(fx.orch.live_count(), 0);

        seed(&fx, "n1", "a.raw");
        assert!(fx.orch.poll_once().await.started.is_empty());
    }
}
