use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::types::ENV_GVISOR_RUNTIME;
use crate::config::IsolationMode;
use crate::error::{Result, SandboxError};
use crate::sandbox::backends::runtime::{BindMount, ContainerRuntime, ContainerSpec};
use crate::sandbox::manager::Manager;
use crate::sandbox::quota::FLOOR_TIMEOUT;
use crate::sandbox::tracker::{CancelTrigger, ExecutionTracker, RunHandle};
use crate::sandbox::traits::{IsolationBackend, Job};
use crate::sandbox::workspace::{execution_leaf, StagedEntry, Workspace};
use crate::sandbox::{ExecuteResult, ExecutionStatus};

/// Upper bound on each teardown step once the run is over.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(10);

const CONTAINER_NAME_PREFIX: &str = "polysandbox-";
const LABEL_EXECUTION_ID: &str = "polysandbox.execution-id";
const LABEL_PROJECT: &str = "polysandbox.project";

/// How the wait phase ended.
enum Outcome {
    Exited(i64),
    TimedOut,
    Killed,
}

/// Deadline for a run: the request timeout if set, else the quota's,
/// never below the floor.
pub fn effective_timeout(requested: Option<Duration>, quota_timeout: Duration) -> Duration {
    let timeout = requested
        .filter(|t| !t.is_zero())
        .unwrap_or(quota_timeout);
    if timeout.is_zero() {
        FLOOR_TIMEOUT
    } else {
        timeout
    }
}

async fn within<T, F>(deadline: Instant, stage: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| SandboxError::DeadlineExceeded {
            stage: stage.to_string(),
        })?
}

/// Force-removes a container when released or dropped.
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id,
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        match tokio::time::timeout(TEARDOWN_GRACE, self.runtime.remove(&self.id)).await {
            Ok(Ok(())) => debug!(container_id = %self.id, "Container removed"),
            Ok(Err(e)) => warn!(container_id = %self.id, error = %e, "Failed to remove container"),
            Err(_) => warn!(container_id = %self.id, "Timed out removing container"),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Dropped mid-run: the caller went away, so remove in the background
        let runtime = Arc::clone(&self.runtime);
        let id = std::mem::take(&mut self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = runtime.remove(&id).await {
                    warn!(container_id = %id, error = %e, "Failed to remove abandoned container");
                }
            });
        } else {
            warn!(container_id = %id, "No runtime to remove abandoned container");
        }
    }
}

/// Runs jobs in hardened, single-use containers (`docker` and `gvisor`).
pub struct ContainerBackend {
    manager: Arc<Manager>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerBackend {
    pub fn new(manager: Arc<Manager>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { manager, runtime }
    }

    /// OCI runtime for a mode, checked against the allow-list.
    fn runtime_for(&self, mode: IsolationMode) -> Result<Option<String>> {
        let config = self.manager.config();
        let runtime = match mode {
            IsolationMode::Docker => String::new(),
            IsolationMode::Gvisor => {
                if config.gvisor_runtime.trim().is_empty() {
                    return Err(SandboxError::Config(format!(
                        "gVisor isolation requested but {} is empty",
                        ENV_GVISOR_RUNTIME
                    )));
                }
                config.gvisor_runtime.trim().to_string()
            }
            IsolationMode::Firecracker => {
                return Err(SandboxError::Config(format!(
                    "unsupported container isolation mode: {}",
                    mode
                )))
            }
        };
        if runtime.is_empty() {
            return Ok(None);
        }
        if !config.is_allowed_runtime(&runtime) {
            return Err(SandboxError::RuntimeNotAllowed { runtime });
        }
        Ok(Some(runtime))
    }

    /// Build the hardened container spec for a staged job.
    pub async fn build_spec(
        &self,
        job: &Job,
        entry: &StagedEntry,
        workspace_dir: &Path,
    ) -> Result<ContainerSpec> {
        let config = self.manager.config();
        let request = &job.request;
        let template = &job.template;

        let runtime = self.runtime_for(job.isolation)?;

        let command = template.render_command(&entry.file_name);
        if command.is_empty() {
            return Err(SandboxError::Config(format!(
                "language template {} has an empty command",
                template.language
            )));
        }

        let mut mounts = vec![BindMount {
            source: workspace_dir.to_path_buf(),
            target: template.work_dir.clone(),
            read_only: false,
        }];

        // Precedence: template < normalization < cache mounts < request
        let mut env: BTreeMap<String, String> = template.env.clone();
        env.extend(entry.env.clone());
        for cache in &template.cache_mounts {
            let Some(host_path) = self
                .manager
                .package_cache_path(&request.project_id, &cache.name)
                .await
                .map_err(|e| SandboxError::Config(format!("cache mount {}: {}", cache.name, e)))?
            else {
                continue;
            };
            mounts.push(BindMount {
                source: host_path,
                target: cache.container_path.clone(),
                read_only: false,
            });
            env.extend(cache.env.clone());
        }
        env.extend(request.env.clone());

        let mut security_opt = Vec::new();
        if config.no_new_privileges {
            security_opt.push("no-new-privileges:true".to_string());
        }

        let labels = BTreeMap::from([
            (LABEL_EXECUTION_ID.to_string(), request.id.clone()),
            (LABEL_PROJECT.to_string(), request.project_id.clone()),
        ]);

        let quota = job.quota.with_floors();
        Ok(ContainerSpec {
            name: format!("{}{}", CONTAINER_NAME_PREFIX, execution_leaf(&request.id)),
            image: template.image.clone(),
            work_dir: template.work_dir.clone(),
            command,
            env,
            labels,
            mounts,
            open_stdin: request.stdin.as_deref().is_some_and(|s| !s.is_empty()),
            network_enabled: config.network_enabled,
            read_only_rootfs: config.read_only_rootfs,
            security_opt,
            cap_drop: vec!["ALL".to_string()],
            runtime,
            tmpfs: BTreeMap::from([(
                "/tmp".to_string(),
                format!("rw,noexec,nosuid,size={}", config.default_tmpfs_size),
            )]),
            shm_size: config.default_shared_mem_size,
            memory_bytes: quota.memory_bytes,
            memory_swap_bytes: quota.memory_bytes,
            nano_cpus: quota.nano_cpus(),
            pids_limit: quota.pids_limit,
        })
    }

    async fn ensure_image(&self, image: &str, deadline: Instant) -> Result<()> {
        if within(deadline, "inspecting image", self.runtime.image_exists(image)).await? {
            return Ok(());
        }
        if !self.manager.config().pull_images {
            return Err(SandboxError::ImageUnavailable {
                image: image.to_string(),
                reason: "not present locally and image pulling is disabled".to_string(),
            });
        }
        within(deadline, "pulling image", self.runtime.pull_image(image)).await
    }

    /// Start the container and drive it to a terminal state.
    async fn drive(
        &self,
        job: &Job,
        container_id: &str,
        cancel: &CancelTrigger,
        deadline: Instant,
        result: &mut ExecuteResult,
    ) -> Result<()> {
        let request = &job.request;
        within(deadline, "starting container", self.runtime.start(container_id)).await?;

        let mut warnings = Vec::new();
        if let Some(input) = request.stdin.as_deref().filter(|s| !s.is_empty()) {
            match tokio::time::timeout_at(deadline, self.runtime.attach_stdin(container_id, input))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warnings.push(format!("stdin attach warning: {}", e)),
                Err(_) => warnings.push("stdin attach warning: deadline exceeded".to_string()),
            }
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Killed,
            _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
            status = self.runtime.wait(container_id) => Outcome::Exited(status?),
        };

        let (status, exit_code) = match outcome {
            Outcome::Exited(code) => {
                let code = i32::try_from(code).unwrap_or(i32::MAX);
                (ExecutionStatus::from_exit_code(code), code)
            }
            Outcome::TimedOut => {
                info!(execution_id = %request.id, "Execution deadline reached, killing container");
                self.force_kill(container_id).await;
                (ExecutionStatus::Timeout, 0)
            }
            Outcome::Killed => {
                info!(execution_id = %request.id, "Execution cancelled, killing container");
                self.force_kill(container_id).await;
                (ExecutionStatus::Killed, 0)
            }
        };

        let limit = job.quota.with_floors().max_output_bytes;
        match tokio::time::timeout(TEARDOWN_GRACE, self.runtime.logs(container_id, limit)).await {
            Ok(Ok(logs)) => {
                if let Some(e) = logs.error {
                    warnings.push(format!("log read warning: {}", e));
                }
                result.stdout = logs.stdout.into_string();
                result.stderr = logs.stderr.into_string();
            }
            Ok(Err(e)) => warnings.push(format!("log read warning: {}", e)),
            Err(_) => warnings.push("log read warning: timed out reading logs".to_string()),
        }
        for warning in warnings {
            result.warn(warning);
        }

        result.finish(status, exit_code);
        Ok(())
    }

    /// The daemon may have created the container even though the create
    /// call failed or was abandoned at the deadline.
    async fn remove_by_name(&self, name: &str) {
        match tokio::time::timeout(TEARDOWN_GRACE, self.runtime.remove(name)).await {
            Ok(Ok(())) => debug!(container = %name, "Removed partially created container"),
            Ok(Err(e)) => debug!(container = %name, error = %e, "No container left after failed create"),
            Err(_) => warn!(container = %name, "Timed out removing partially created container"),
        }
    }

    async fn force_kill(&self, container_id: &str) {
        match tokio::time::timeout(TEARDOWN_GRACE, self.runtime.kill(container_id)).await {
            Ok(Ok(())) => {}
            // Usually means it already exited
            Ok(Err(e)) => debug!(container_id = %container_id, error = %e, "Kill failed"),
            Err(_) => warn!(container_id = %container_id, "Timed out killing container"),
        }
    }
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn name(&self) -> &str {
        self.runtime.name()
    }

    fn modes(&self) -> &[IsolationMode] {
        &[IsolationMode::Docker, IsolationMode::Gvisor]
    }

    async fn run(&self, job: &Job, tracker: &Arc<ExecutionTracker>) -> Result<ExecuteResult> {
        let request = &job.request;
        let timeout = effective_timeout(request.timeout, job.quota.timeout);
        let deadline = Instant::now() + timeout;

        if job.template.image.is_empty() {
            return Err(SandboxError::Config(format!(
                "missing image for language template {}",
                job.template.language
            )));
        }

        if tracker.contains(&request.id) {
            return Err(SandboxError::DuplicateExecution {
                id: request.id.clone(),
            });
        }

        let project_root = self.manager.workspace_root_for_project(&request.project_id);
        let mut workspace = Workspace::create(&project_root, &request.id).await.map_err(|e| match e {
            SandboxError::Io(io) if io.kind() == std::io::ErrorKind::AlreadyExists => {
                SandboxError::DuplicateExecution {
                    id: request.id.clone(),
                }
            }
            other => other,
        })?;
        let entry = workspace
            .stage(&job.template, &request.code, &request.files)
            .await?;
        let spec = self.build_spec(job, &entry, workspace.path()).await?;

        self.ensure_image(&spec.image, deadline).await?;

        let container_id =
            match within(deadline, "creating container", self.runtime.create(&spec)).await {
                Ok(id) => id,
                Err(e) => {
                    self.remove_by_name(&spec.name).await;
                    return Err(e);
                }
            };
        let container = ContainerGuard::new(Arc::clone(&self.runtime), container_id.clone());

        let cancel = CancelTrigger::new();
        let outcome = match tracker.track_start(
            &request.id,
            RunHandle::Container(container_id.clone()),
            cancel.clone(),
        ) {
            Ok(_tracked) => {
                info!(
                    execution_id = %request.id,
                    container_id = %container_id,
                    language = %job.template.language,
                    isolation = %job.isolation,
                    timeout_secs = timeout.as_secs(),
                    "Execution started"
                );
                let mut result = ExecuteResult::started(&request.id, job.isolation, &spec.image);
                result.container_id = Some(container_id.clone());
                self.drive(job, &container_id, &cancel, deadline, &mut result)
                    .await
                    .map(|()| result)
            }
            Err(e) => Err(e),
        };

        container.release().await;
        if let Err(e) = workspace.cleanup().await {
            warn!(workspace = %workspace.path().display(), error = %e, "Failed to remove workspace");
        }
        outcome
    }

    async fn terminate(&self, handle: &RunHandle) -> Result<()> {
        if let RunHandle::Container(id) = handle {
            self.force_kill(id).await;
        }
        Ok(())
    }
}
