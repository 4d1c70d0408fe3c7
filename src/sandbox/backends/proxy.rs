use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::types::ENV_FIRECRACKER_PROXY_CMD;
use crate::config::IsolationMode;
use crate::error::{Result, SandboxError};
use crate::sandbox::backends::runtime::read_capped;
use crate::sandbox::manager::Manager;
use crate::sandbox::quota::ResourceQuota;
use crate::sandbox::template::LanguageTemplate;
use crate::sandbox::tracker::{CancelTrigger, ExecutionTracker, RunHandle};
use crate::sandbox::traits::{IsolationBackend, Job};
use crate::sandbox::{ExecuteResult, ExecutionStatus};

/// Room for JSON framing around the captured streams.
const PROXY_ENVELOPE_BYTES: u64 = 1 << 20;

/// Payload written to the proxy's stdin.
#[derive(Debug, Serialize)]
struct ProxyRequest<'a> {
    id: &'a str,
    project: &'a str,
    language: &'a str,
    code: &'a str,
    stdin: &'a str,
    env: &'a BTreeMap<String, String>,
    files: &'a BTreeMap<String, String>,
    template: &'a LanguageTemplate,
    quota: &'a ResourceQuota,
}

/// Result document read from the proxy's stdout. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProxyResult {
    status: Option<ExecutionStatus>,
    #[serde(alias = "output")]
    stdout: String,
    #[serde(alias = "error_output")]
    stderr: String,
    exit_code: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    timed_out: bool,
    killed: bool,
    image: String,
    container_id: Option<String>,
    warnings: Vec<String>,
}

impl ProxyResult {
    fn into_result(self, id: &str, started_at: DateTime<Utc>) -> ExecuteResult {
        let exit_code = self.exit_code.unwrap_or(0);
        let status = match self.status {
            Some(status) => status,
            None if self.timed_out => ExecutionStatus::Timeout,
            None if self.killed => ExecutionStatus::Killed,
            None => ExecutionStatus::from_exit_code(exit_code),
        };

        let mut result = ExecuteResult::started(id, IsolationMode::Firecracker, &self.image);
        result.started_at = self.started_at.unwrap_or(started_at);
        result.stdout = self.stdout;
        result.stderr = self.stderr;
        result.container_id = self.container_id.filter(|c| !c.is_empty());
        result.warnings = self.warnings;
        result.status = status;
        result.exit_code = exit_code;
        result.timed_out = self.timed_out || status == ExecutionStatus::Timeout;
        result.killed = self.killed || status == ExecutionStatus::Killed;
        result.completed_at = self.completed_at.unwrap_or_else(Utc::now);
        result.duration = (result.completed_at - result.started_at)
            .to_std()
            .unwrap_or_default();
        result
    }
}

/// Delegates `firecracker` runs to an operator-supplied proxy command.
///
/// The command is run through `sh -lc` with a JSON job on stdin and must
/// print one JSON result on stdout. Resource enforcement is the proxy's job.
pub struct ProxyBackend {
    manager: Arc<Manager>,
}

impl ProxyBackend {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    fn proxy_command(&self) -> Result<String> {
        let cmd = self.manager.config().firecracker_proxy_cmd.trim();
        if cmd.is_empty() {
            return Err(SandboxError::ProxyNotConfigured {
                mode: IsolationMode::Firecracker.to_string(),
                env_var: ENV_FIRECRACKER_PROXY_CMD.to_string(),
            });
        }
        Ok(cmd.to_string())
    }
}

#[async_trait]
impl IsolationBackend for ProxyBackend {
    fn name(&self) -> &str {
        "firecracker-proxy"
    }

    fn modes(&self) -> &[IsolationMode] {
        &[IsolationMode::Firecracker]
    }

    async fn run(&self, job: &Job, tracker: &Arc<ExecutionTracker>) -> Result<ExecuteResult> {
        let proxy_cmd = self.proxy_command()?;
        let request = &job.request;

        let payload = serde_json::to_vec(&ProxyRequest {
            id: &request.id,
            project: &request.project_id,
            language: &job.template.language,
            code: &request.code,
            stdin: request.stdin.as_deref().unwrap_or_default(),
            env: &request.env,
            files: &request.files,
            template: &job.template,
            quota: &job.quota,
        })?;

        let cancel = CancelTrigger::new();
        let _tracked = tracker.track_start(&request.id, RunHandle::Process(None), cancel.clone())?;

        let started_at = Utc::now();
        let mut child = Command::new("sh")
            .args(["-lc", &proxy_cmd])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Proxy(format!("failed to spawn proxy: {}", e)))?;
        tracker.set_handle(&request.id, RunHandle::Process(child.id()));
        info!(
            execution_id = %request.id,
            pid = ?child.id(),
            language = %job.template.language,
            "Execution delegated to firecracker proxy"
        );

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Proxy("proxy has no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Proxy("proxy has no stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Proxy("proxy has no stderr pipe".to_string()))?;

        let output_limit = job.quota.max_output_bytes;
        let stdout_limit = output_limit
            .saturating_mul(2)
            .saturating_add(PROXY_ENVELOPE_BYTES);

        let feed = async move {
            if let Err(e) = stdin.write_all(&payload).await {
                // The proxy may exit without reading the job
                debug!(error = %e, "Proxy stdin closed early");
            }
            drop(stdin);
        };
        // The child moves in, so losing the race drops and kills it
        let collect = async move {
            let (_, out, err, status) = tokio::join!(
                feed,
                read_capped(stdout, stdout_limit),
                read_capped(stderr, output_limit),
                child.wait()
            );
            (out, err, status)
        };

        let (out, err, status) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(execution_id = %request.id, "Proxy execution killed");
                let mut result =
                    ExecuteResult::started(&request.id, IsolationMode::Firecracker, "");
                result.started_at = started_at;
                result.finish(ExecutionStatus::Killed, 0);
                return Ok(result);
            }
            collected = collect => collected,
        };

        let status = status.map_err(|e| SandboxError::Proxy(e.to_string()))?;
        let stderr_text = err.map(|e| e.into_string()).unwrap_or_default();
        if !status.success() {
            return Err(SandboxError::Proxy(format!(
                "firecracker proxy failed: {}: {}",
                status,
                stderr_text.trim()
            )));
        }

        let out = out.map_err(|e| SandboxError::Proxy(format!("reading proxy output: {}", e)))?;
        if out.truncated() {
            return Err(SandboxError::Proxy(format!(
                "firecracker proxy output exceeded {} bytes",
                stdout_limit
            )));
        }
        let parsed: ProxyResult = serde_json::from_slice(&out.bytes).map_err(|e| {
            SandboxError::Proxy(format!("firecracker proxy returned invalid JSON: {}", e))
        })?;

        let result = parsed.into_result(&request.id, started_at);
        debug!(execution_id = %request.id, status = %result.status, "Proxy result parsed");
        Ok(result)
    }

    async fn terminate(&self, _handle: &RunHandle) -> Result<()> {
        // The run loop observes the cancellation and drops the child
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_defaults_missing_fields() {
        let started = Utc::now();
        let parsed: ProxyResult = serde_json::from_str(r#"{"output": "hi\n"}"#).unwrap();
        let result = parsed.into_result("abc", started);
        assert_eq!(result.id, "abc");
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.started_at, started);
        assert!(result.completed_at >= started);
        assert_eq!(result.isolation, IsolationMode::Firecracker);
    }

    #[test]
    fn test_result_respects_reported_status() {
        let parsed: ProxyResult = serde_json::from_str(
            r#"{
                "status": "timeout",
                "exit_code": 124,
                "started_at": "2024-01-01T00:00:00Z",
                "completed_at": "2024-01-01T00:00:02Z",
                "isolation": "docker"
            }"#,
        )
        .unwrap();
        let result = parsed.into_result("abc", Utc::now());
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(result.timed_out);
        assert_eq!(result.duration, std::time::Duration::from_secs(2));
        // Isolation is always reported as the mode that was requested
        assert_eq!(result.isolation, IsolationMode::Firecracker);
    }

    #[test]
    fn test_result_status_from_exit_code() {
        let parsed: ProxyResult =
            serde_json::from_str(r#"{"exit_code": 2, "error_output": "boom"}"#).unwrap();
        let result = parsed.into_result("abc", Utc::now());
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.stderr, "boom");
        assert_eq!(result.exit_code, 2);
    }
}
