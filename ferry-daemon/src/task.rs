//! One sync pass for one source: scan, admission re-check, copy.
//!
//! A [`SyncTask`] is shared between its worker future and the orchestrator.
//! The worker moves it through `Pending → Scanning → Copying → Completed`;
//! the orchestrator may force `IdleStopped`, the free-space watchdog may force
//! `Failed`. Whoever lands a terminal state first wins.
//!
//! Counters are cumulative per source: a fresh task starts from the
//! [`Carry`] of the one it replaces so UI totals never go backwards.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use ferry_core::{progress_percent, SourceKey, SourceRoot, TaskState, TaskStatus};
use ferry_sync::{
    copy_all, scan, CaptureTracker, CopyObserver, CopyOptions, FileRecord, LogSink,
    ResourceGovernor, SyncError, TransferAction,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub const DEFERRED_DETAIL: &str = "deferred: insufficient destination space";
pub const LOW_SPACE_DETAIL: &str = "aborted: destination below free-space floor";

/// Counters and markers handed from a finished task to its successor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Carry {
    pub total_files: u64,
    pub total_bytes: u64,
    pub copied_files: u64,
    pub copied_bytes: u64,
    pub failed_files: u64,
    pub newest_mtime: Option<SystemTime>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Monotonic twin of `last_activity`; the successor's idle clock starts here.
    pub last_activity_at: Option<Instant>,
    /// Final state and detail of the task this was taken from.
    pub last_state: Option<TaskState>,
    pub last_detail: Option<String>,
}

impl Carry {
    /// Bytes admitted in earlier passes but never copied.
    pub fn outstanding_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.copied_bytes)
    }

    /// Status row for a source with no live task.
    pub fn idle_status(&self, key: &SourceKey) -> TaskStatus {
        TaskStatus {
            node: key.node.clone(),
            share: key.share.clone(),
            state: None,
            last_activity: self.last_activity,
            files_copied: self.copied_files,
            bytes_copied: self.copied_bytes,
            files_failed: self.failed_files,
            progress_percent: progress_percent(self.copied_bytes, self.total_bytes),
            detail: self.last_detail.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    at: Instant,
    wall: DateTime<Utc>,
}

impl Activity {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }

    /// Resume the predecessor's clock; a source with no history starts now.
    fn resumed(carry: &Carry) -> Self {
        match (carry.last_activity_at, carry.last_activity) {
            (Some(at), Some(wall)) => Self { at, wall },
            _ => Self::now(),
        }
    }
}

/// Everything a task needs from its environment.
#[derive(Clone)]
pub struct TaskContext {
    pub root: SourceRoot,
    pub destination: PathBuf,
    pub governor: Arc<ResourceGovernor>,
    pub tracker: Arc<CaptureTracker>,
    pub sink: Arc<dyn LogSink>,
    pub copy: CopyOptions,
    pub watchdog_interval: Duration,
}

#[derive(Debug)]
pub struct SyncTask {
    key: SourceKey,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: Mutex<(TaskState, Option<String>)>,
    total_files: AtomicU64,
    total_bytes: AtomicU64,
    copied_files: AtomicU64,
    copied_bytes: AtomicU64,
    failed_files: AtomicU64,
    newest_mtime: Mutex<Option<SystemTime>>,
    last_activity: Mutex<Activity>,
    heartbeat: Mutex<Instant>,
    in_flight: AtomicUsize,
}

impl SyncTask {
    pub fn new(key: SourceKey, cancel: CancellationToken, carry: &Carry) -> Self {
        Self {
            key,
            created_at: Utc::now(),
            cancel,
            state: Mutex::new((TaskState::Pending, None)),
            total_files: AtomicU64::new(carry.total_files),
            total_bytes: AtomicU64::new(carry.total_bytes),
            copied_files: AtomicU64::new(carry.copied_files),
            copied_bytes: AtomicU64::new(carry.copied_bytes),
            failed_files: AtomicU64::new(carry.failed_files),
            newest_mtime: Mutex::new(carry.newest_mtime),
            last_activity: Mutex::new(Activity::resumed(carry)),
            heartbeat: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> TaskState {
        self.state.lock().0
    }

    pub fn detail(&self) -> Option<String> {
        self.state.lock().1.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Move to a non-terminal state unless a terminal one already landed.
    fn advance(&self, next: TaskState) -> bool {
        let mut state = self.state.lock();
        if state.0.is_terminal() {
            return false;
        }
        state.0 = next;
        true
    }

    /// Land a terminal state. Returns `false` if one was already set.
    pub fn finish(&self, terminal: TaskState, detail: Option<String>) -> bool {
        let mut state = self.state.lock();
        if state.0.is_terminal() {
            return false;
        }
        *state = (terminal, detail);
        true
    }

    fn touch_activity(&self) {
        *self.last_activity.lock() = Activity::now();
    }

    fn touch_heartbeat(&self) {
        *self.heartbeat.lock() = Instant::now();
    }

    /// Refresh activity when `mtime` is newer than anything seen for this source.
    pub fn observe_mtime(&self, mtime: SystemTime) {
        let mut newest = self.newest_mtime.lock();
        if newest.map_or(true, |seen| mtime > seen) {
            *newest = Some(mtime);
            drop(newest);
            self.touch_activity();
        }
    }

    /// Has the task made no progress for `timeout` with no live copy to show
    /// for it?
    pub fn is_idle_at(&self, now: Instant, timeout: Duration) -> bool {
        let quiet = now.saturating_duration_since(self.last_activity.lock().at);
        if quiet < timeout {
            return false;
        }
        let streaming = self.in_flight() > 0
            && now.saturating_duration_since(*self.heartbeat.lock()) < timeout;
        !streaming
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, by: Duration) {
        let mut activity = self.last_activity.lock();
        if let Some(at) = activity.at.checked_sub(by) {
            activity.at = at;
        }
        let mut heartbeat = self.heartbeat.lock();
        if let Some(at) = heartbeat.checked_sub(by) {
            *heartbeat = at;
        }
    }

    pub fn carry(&self) -> Carry {
        let (state, detail) = self.state.lock().clone();
        let activity = *self.last_activity.lock();
        Carry {
            total_files: self.total_files.load(Ordering::SeqCst),
            total_bytes: self.total_bytes.load(Ordering::SeqCst),
            copied_files: self.copied_files.load(Ordering::SeqCst),
            copied_bytes: self.copied_bytes.load(Ordering::SeqCst),
            failed_files: self.failed_files.load(Ordering::SeqCst),
            newest_mtime: *self.newest_mtime.lock(),
            last_activity: Some(activity.wall),
            last_activity_at: Some(activity.at),
            last_state: Some(state),
            last_detail: detail,
        }
    }

    pub fn status(&self) -> TaskStatus {
        let (state, detail) = self.state.lock().clone();
        let copied_bytes = self.copied_bytes.load(Ordering::SeqCst);
        TaskStatus {
            node: self.key.node.clone(),
            share: self.key.share.clone(),
            state: Some(state),
            last_activity: Some(self.last_activity.lock().wall),
            files_copied: self.copied_files.load(Ordering::SeqCst),
            bytes_copied: copied_bytes,
            files_failed: self.failed_files.load(Ordering::SeqCst),
            progress_percent: progress_percent(
                copied_bytes,
                self.total_bytes.load(Ordering::SeqCst),
            ),
            detail,
        }
    }

    /// Worker body. Never returns an error: every fault lands in `Failed`.
    pub async fn run(self: Arc<Self>, ctx: TaskContext) {
        let key = self.key.clone();
        if let Err(err) = Arc::clone(&self).pass(&ctx).await {
            ctx.sink.error(&format!("[{key}] sync failed: {err}"));
            self.finish(TaskState::Failed, Some(err.to_string()));
        }
    }

    async fn pass(self: Arc<Self>, ctx: &TaskContext) -> Result<(), SyncError> {
        let key = self.key.clone();
        if !self.advance(TaskState::Scanning) {
            return Ok(());
        }
        tracing::debug!(source = %key, root = %ctx.root.path.display(), "scanning");

        let records = {
            let task = Arc::clone(&self);
            let source_root = ctx.root.path.clone();
            let destination = ctx.destination.clone();
            tokio::task::spawn_blocking(move || task.collect_due(&source_root, &destination))
                .await
                .map_err(|e| SyncError::Join(e.to_string()))??
        };
        if self.cancel.is_cancelled() {
            self.finish(TaskState::IdleStopped, Some("cancelled".to_string()));
            return Ok(());
        }

        let due_bytes: u64 = records.iter().map(|r| r.size).sum();
        if !records.is_empty() && !ctx.governor.can_start(&ctx.destination, due_bytes) {
            ctx.sink.warn(&format!(
                "[{key}] {} files ({due_bytes} bytes) due, {DEFERRED_DETAIL}",
                records.len()
            ));
            self.finish(TaskState::Completed, Some(DEFERRED_DETAIL.to_string()));
            return Ok(());
        }
        self.total_files
            .fetch_add(records.len() as u64, Ordering::SeqCst);
        self.total_bytes.fetch_add(due_bytes, Ordering::SeqCst);

        if !self.advance(TaskState::Copying) {
            return Ok(());
        }
        if !records.is_empty() {
            ctx.sink.info(&format!(
                "[{key}] copying {} files ({due_bytes} bytes)",
                records.len()
            ));
        }

        let watchdog_stop = self.cancel.child_token();
        let watchdog = tokio::spawn(watch_free_space(
            Arc::clone(&self),
            ctx.clone(),
            watchdog_stop.clone(),
        ));
        let observer = Arc::new(TaskObserver {
            task: Arc::clone(&self),
            tracker: Arc::clone(&ctx.tracker),
            sink: Arc::clone(&ctx.sink),
        });
        let result = copy_all(records, &ctx.destination, &ctx.copy, &self.cancel, observer).await;
        watchdog_stop.cancel();
        let _ = watchdog.await;

        let touched = result.copied_files + result.failed_files > 0;
        if result.cancelled {
            self.finish(TaskState::IdleStopped, Some("cancelled".to_string()));
        } else if self.finish(TaskState::Completed, None) && touched {
            ctx.sink.info(&format!(
                "[{key}] pass complete: {} copied ({} bytes), {} failed",
                result.copied_files, result.copied_bytes, result.failed_files
            ));
        }
        Ok(())
    }

    /// Drain the lazy scan, stopping early on cancellation.
    fn collect_due(
        &self,
        source_root: &std::path::Path,
        destination: &std::path::Path,
    ) -> Result<Vec<FileRecord>, SyncError> {
        let mut diff = scan(source_root, destination);
        let mut records = Vec::new();
        for item in diff.by_ref() {
            if self.cancel.is_cancelled() {
                break;
            }
            let record = item?;
            self.observe_mtime(record.source_mtime);
            records.push(record);
        }
        if let Some(newest) = diff.newest_mtime() {
            self.observe_mtime(newest);
        }
        if diff.skipped_dirs() > 0 {
            tracing::warn!(
                source = %self.key,
                skipped = diff.skipped_dirs(),
                "unreadable directories skipped during scan"
            );
        }
        Ok(records)
    }
}

async fn watch_free_space(task: Arc<SyncTask>, ctx: TaskContext, stop: CancellationToken) {
    let mut interval = tokio::time::interval(ctx.watchdog_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = interval.tick() => {
                let governor = Arc::clone(&ctx.governor);
                let destination = ctx.destination.clone();
                let action = tokio::task::spawn_blocking(move || {
                    governor.check_during_transfer(&destination)
                })
                .await
                .unwrap_or(TransferAction::Continue);
                if let TransferAction::AbortLowSpace { available } = action {
                    ctx.sink.error(&format!(
                        "[{}] {LOW_SPACE_DETAIL} ({available} bytes free)",
                        task.key
                    ));
                    task.finish(TaskState::Failed, Some(LOW_SPACE_DETAIL.to_string()));
                    task.cancel.cancel();
                    return;
                }
            }
        }
    }
}

/// Bridges copier callbacks into task counters, the tracker, and the sink.
struct TaskObserver {
    task: Arc<SyncTask>,
    tracker: Arc<CaptureTracker>,
    sink: Arc<dyn LogSink>,
}

impl CopyObserver for TaskObserver {
    fn on_started(&self, _record: &FileRecord) {
        self.task.in_flight.fetch_add(1, Ordering::SeqCst);
        self.task.touch_heartbeat();
    }

    fn on_copied(&self, record: &FileRecord, bytes: u64) {
        let task = &self.task;
        task.in_flight.fetch_sub(1, Ordering::SeqCst);
        task.copied_files.fetch_add(1, Ordering::SeqCst);
        task.copied_bytes.fetch_add(bytes, Ordering::SeqCst);
        task.touch_activity();

        let Some(name) = record.file_name() else {
            return;
        };
        if let Some(done) = self.tracker.on_file_copied(name, &task.key) {
            let sources: Vec<String> = done.sources.iter().map(ToString::to_string).collect();
            self.sink.info(&format!(
                "capture {} complete ({}) on {}",
                done.key,
                done.kind,
                sources.join(", ")
            ));
        }
    }

    fn on_failed(&self, record: &FileRecord, error: &SyncError, attempts: u32) {
        self.task.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.task.failed_files.fetch_add(1, Ordering::SeqCst);
        self.sink.error(&format!(
            "[{}] giving up on {} after {attempts} attempts: {error}",
            self.task.key,
            record.source_path.display()
        ));
    }

    fn on_cancelled(&self, _record: &FileRecord) {
        self.task.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn on_heartbeat(&self) {
        self.task.touch_heartbeat();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
