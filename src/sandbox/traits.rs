use std::sync::Arc;

use async_trait::async_trait;

use crate::config::IsolationMode;
use crate::error::Result;
use crate::sandbox::quota::ResourceQuota;
use crate::sandbox::template::LanguageTemplate;
use crate::sandbox::tracker::{ExecutionTracker, RunHandle, StatsSnapshot};
use crate::sandbox::{ExecuteRequest, ExecuteResult};

/// A fully resolved execution: the request plus everything looked up for it.
#[derive(Debug, Clone)]
pub struct Job {
    /// The request, with its ID assigned
    pub request: ExecuteRequest,
    pub template: LanguageTemplate,
    pub quota: ResourceQuota,
    pub isolation: IsolationMode,
}

/// Strategy for running a job under one family of isolation modes.
///
/// This trait abstracts the execution environment, allowing container
/// runtimes and external VM proxies to be driven interchangeably.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Returns the backend name (e.g., "docker", "firecracker-proxy")
    fn name(&self) -> &str;

    /// Isolation modes this backend can serve
    fn modes(&self) -> &[IsolationMode];

    /// Run the job to a terminal state.
    ///
    /// The backend registers the run with `tracker` for its whole lifetime
    /// and stops it when the tracker's cancellation fires.
    async fn run(&self, job: &Job, tracker: &Arc<ExecutionTracker>) -> Result<ExecuteResult>;

    /// Force-terminate a run whose cancellation has already been fired.
    async fn terminate(&self, handle: &RunHandle) -> Result<()>;
}

/// Public contract for running code in a sandbox.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one request to completion, timeout or kill.
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult>;

    /// Stop an in-flight execution by ID.
    ///
    /// Killing a run that is already being torn down is a no-op. Unknown
    /// IDs fail with a not-found error.
    async fn kill(&self, execution_id: &str) -> Result<()>;

    /// Number of executions currently in flight
    fn active_count(&self) -> usize;

    fn stats(&self) -> StatsSnapshot;

    /// Stop every in-flight execution.
    /// Default implementation is a no-op for stateless executors.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
