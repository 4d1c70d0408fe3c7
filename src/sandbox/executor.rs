use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::IsolationMode;
use crate::error::{Result, SandboxError};
use crate::sandbox::backends::{ContainerBackend, ContainerRuntime, DockerCli, ProxyBackend};
use crate::sandbox::manager::Manager;
use crate::sandbox::tracker::{ExecutionStats, ExecutionTracker, RunHandle, StatsSnapshot};
use crate::sandbox::traits::{Executor, IsolationBackend, Job};
use crate::sandbox::{ExecuteRequest, ExecuteResult};

const FEATURES: &[&str] = &[
    "docker-cli",
    "gvisor-runtime",
    "firecracker-proxy",
    "per-language-quotas",
    "package-cache-mounts",
];

/// Runs requests under the isolation mode each one asks for.
///
/// `docker` and `gvisor` go to the container backend; `firecracker` is
/// delegated to the proxy backend. All runs share one tracker.
pub struct SandboxExecutor {
    manager: Arc<Manager>,
    tracker: Arc<ExecutionTracker>,
    container: ContainerBackend,
    proxy: ProxyBackend,
}

impl SandboxExecutor {
    /// Create an executor driving the `docker` CLI against the configured host.
    pub fn new(manager: Arc<Manager>) -> Self {
        let runtime = Arc::new(DockerCli::new(manager.config().docker_host.clone()));
        Self::with_runtime(manager, runtime, Arc::new(ExecutionStats::new()))
    }

    /// Create an executor over an arbitrary container runtime.
    pub fn with_runtime(
        manager: Arc<Manager>,
        runtime: Arc<dyn ContainerRuntime>,
        stats: Arc<ExecutionStats>,
    ) -> Self {
        Self {
            tracker: Arc::new(ExecutionTracker::new(stats)),
            container: ContainerBackend::new(Arc::clone(&manager), runtime),
            proxy: ProxyBackend::new(Arc::clone(&manager)),
            manager,
        }
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    fn backend_for(&self, mode: IsolationMode) -> Result<&dyn IsolationBackend> {
        let backends: [&dyn IsolationBackend; 2] = [&self.container, &self.proxy];
        backends
            .into_iter()
            .find(|backend| backend.modes().contains(&mode))
            .ok_or_else(|| SandboxError::Config(format!("no backend serves isolation mode {}", mode)))
    }

    /// Validate a request and look up its template, quota and isolation mode.
    pub fn resolve(&self, mut request: ExecuteRequest) -> Result<Job> {
        if request.language.trim().is_empty() {
            return Err(SandboxError::MissingLanguage);
        }
        let template = self.manager.get_template(&request.language).ok_or_else(|| {
            SandboxError::UnsupportedLanguage {
                language: request.language.clone(),
            }
        })?;
        if request.id.trim().is_empty() {
            request.id = Uuid::new_v4().to_string();
        }

        let isolation = request
            .isolation
            .unwrap_or(self.manager.config().default_isolation);
        let quota = self.manager.effective_quota(&template.language);

        Ok(Job {
            request,
            template,
            quota,
            isolation,
        })
    }
}

#[async_trait]
impl Executor for SandboxExecutor {
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult> {
        let job = self.resolve(request)?;
        let outcome = match self.backend_for(job.isolation) {
            Ok(backend) => {
                debug!(
                    execution_id = %job.request.id,
                    language = %job.template.language,
                    isolation = %job.isolation,
                    backend = backend.name(),
                    "Dispatching execution"
                );
                backend.run(&job, &self.tracker).await
            }
            Err(e) => Err(e),
        };

        let stats = self.tracker.stats();
        match outcome {
            Ok(result) => {
                stats.record(result.status);
                info!(
                    execution_id = %result.id,
                    status = %result.status,
                    exit_code = result.exit_code,
                    duration_ms = result.duration.as_millis() as u64,
                    "Execution finished"
                );
                Ok(result)
            }
            Err(e) => {
                stats.record_error();
                warn!(execution_id = %job.request.id, error = %e, "Execution failed");
                Err(e)
            }
        }
    }

    async fn kill(&self, execution_id: &str) -> Result<()> {
        let Some(handle) = self.tracker.cancel(execution_id)? else {
            debug!(execution_id = %execution_id, "Kill already in progress");
            return Ok(());
        };
        info!(execution_id = %execution_id, "Killing execution");
        match handle {
            RunHandle::Container(_) => self.container.terminate(&handle).await,
            RunHandle::Process(_) => self.proxy.terminate(&handle).await,
        }
    }

    fn active_count(&self) -> usize {
        self.tracker.active_count()
    }

    fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.tracker.stats().snapshot();
        snapshot.backend = self.container.name().to_string();
        snapshot.features = FEATURES.iter().map(|f| f.to_string()).collect();
        snapshot
    }

    async fn close(&self) -> Result<()> {
        for id in self.tracker.ids() {
            match self.kill(&id).await {
                Ok(()) | Err(SandboxError::ExecutionNotFound { .. }) => {}
                Err(e) => warn!(execution_id = %id, error = %e, "Failed to kill on close"),
            }
        }
        Ok(())
    }
}
