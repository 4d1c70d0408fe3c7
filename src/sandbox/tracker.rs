//! In-flight execution registry and aggregate counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::sandbox::ExecutionStatus;

/// Fires once to ask an in-flight execution to stop.
#[derive(Debug, Clone)]
pub struct CancelTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelTrigger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// The live thing a Kill has to terminate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunHandle {
    Container(String),
    Process(Option<u32>),
}

#[derive(Debug, Clone)]
struct TrackedRun {
    handle: RunHandle,
    cancel: CancelTrigger,
    started_at: DateTime<Utc>,
}

/// Atomic execution counters, owned by whoever constructs the executor.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    killed: AtomicU64,
    active: AtomicI64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active: i64,
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub timeout: u64,
    pub killed: u64,
    pub backend: String,
    pub features: Vec<String>,
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one finished execution.
    pub fn record(&self, status: ExecutionStatus) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            ExecutionStatus::Completed => &self.success,
            ExecutionStatus::Timeout => &self.timed_out,
            ExecutionStatus::Killed => &self.killed,
            ExecutionStatus::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an execution that errored before producing a result.
    pub fn record_error(&self) {
        self.record(ExecutionStatus::Failed);
    }

    fn inc_active(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeout: self.timed_out.load(Ordering::Relaxed),
            killed: self.killed.load(Ordering::Relaxed),
            backend: String::new(),
            features: Vec::new(),
        }
    }
}

/// Concurrent registry of in-flight executions keyed by execution ID.
#[derive(Debug)]
pub struct ExecutionTracker {
    runs: Mutex<HashMap<String, TrackedRun>>,
    stats: Arc<ExecutionStats>,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new(Arc::new(ExecutionStats::new()))
    }
}

impl ExecutionTracker {
    pub fn new(stats: Arc<ExecutionStats>) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ExecutionStats> {
        &self.stats
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedRun>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a run; the returned guard unregisters it when dropped.
    ///
    /// Fails if another run with the same ID is still in flight.
    pub fn track_start(
        self: &Arc<Self>,
        id: &str,
        handle: RunHandle,
        cancel: CancelTrigger,
    ) -> Result<TrackedGuard> {
        {
            let mut runs = self.lock();
            if runs.contains_key(id) {
                return Err(SandboxError::DuplicateExecution { id: id.to_string() });
            }
            runs.insert(
                id.to_string(),
                TrackedRun {
                    handle,
                    cancel,
                    started_at: Utc::now(),
                },
            );
        }
        self.stats.inc_active();
        debug!(execution_id = %id, "Execution tracked");
        Ok(TrackedGuard {
            tracker: Arc::clone(self),
            id: id.to_string(),
        })
    }

    /// Unregister a run. Unknown IDs are ignored.
    pub fn track_stop(&self, id: &str) {
        if let Some(run) = self.lock().remove(id) {
            self.stats.dec_active();
            let elapsed_ms = (Utc::now() - run.started_at).num_milliseconds();
            debug!(execution_id = %id, elapsed_ms, "Execution untracked");
        }
    }

    /// Update the handle of a tracked run (e.g. once a process id is known).
    pub fn set_handle(&self, id: &str, handle: RunHandle) {
        if let Some(run) = self.lock().get_mut(id) {
            run.handle = handle;
        }
    }

    /// Fire the cancellation trigger of a tracked run.
    ///
    /// Returns the handle to force-terminate, or `None` when the run was
    /// already cancelled and teardown is in flight.
    pub fn cancel(&self, id: &str) -> Result<Option<RunHandle>> {
        let runs = self.lock();
        let run = runs
            .get(id)
            .ok_or_else(|| SandboxError::ExecutionNotFound { id: id.to_string() })?;
        if run.cancel.is_cancelled() {
            return Ok(None);
        }
        run.cancel.cancel();
        Ok(Some(run.handle.clone()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

/// Scoped tracker registration.
#[derive(Debug)]
pub struct TrackedGuard {
    tracker: Arc<ExecutionTracker>,
    id: String,
}

impl Drop for TrackedGuard {
    fn drop(&mut self) {
        self.tracker.track_stop(&self.id);
    }
}
