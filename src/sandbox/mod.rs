mod backends;
mod executor;
mod manager;
pub mod normalize;
pub mod quota;
pub mod template;
pub mod tracker;
mod traits;
pub mod workspace;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::units;
use crate::config::IsolationMode;

pub use backends::{
    create_args, effective_timeout, read_capped, BindMount, CappedOutput, ContainerBackend,
    ContainerLogs, ContainerRuntime, ContainerSpec, DockerCli, ProxyBackend, TEARDOWN_GRACE,
};
pub use executor::SandboxExecutor;
pub use manager::Manager;
pub use quota::ResourceQuota;
pub use template::{CacheMountSpec, LanguageTemplate};
pub use tracker::{ExecutionStats, ExecutionTracker, StatsSnapshot};
pub use traits::{Executor, IsolationBackend, Job};

/// Exit code reported for runs stopped by the deadline.
pub const EXIT_CODE_TIMEOUT: i32 = 124;
/// Exit code reported for runs stopped by Kill.
pub const EXIT_CODE_KILLED: i32 = 137;

/// A request to run one piece of code.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    /// Execution ID; generated when empty
    pub id: String,
    pub project_id: String,
    pub language: String,
    pub code: String,
    pub stdin: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Auxiliary files, relative path to content
    pub files: BTreeMap<String, String>,
    /// Isolation mode; the manager default when unset
    pub isolation: Option<IsolationMode>,
    pub timeout: Option<Duration>,
}

impl ExecuteRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationMode) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Terminal state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Timeout,
    Killed,
    /// Non-zero exit; also absorbs unknown statuses reported by a proxy
    #[serde(other)]
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
        }
    }

    /// Status of a run that exited on its own.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Completed
        } else {
            Self::Failed
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub id: String,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", with = "units::millis")]
    pub duration: Duration,
    pub timed_out: bool,
    pub killed: bool,
    pub isolation: IsolationMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Best-effort problems that did not abort the run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ExecuteResult {
    pub(crate) fn started(id: &str, isolation: IsolationMode, image: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            status: ExecutionStatus::Failed,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            started_at: now,
            completed_at: now,
            duration: Duration::ZERO,
            timed_out: false,
            killed: false,
            isolation,
            image: image.to_string(),
            container_id: None,
            warnings: Vec::new(),
        }
    }

    /// Set the terminal status and the flags and exit code that go with it.
    pub(crate) fn finish(&mut self, status: ExecutionStatus, exit_code: i32) {
        self.status = status;
        self.timed_out = status == ExecutionStatus::Timeout;
        self.killed = status == ExecutionStatus::Killed;
        self.exit_code = match status {
            ExecutionStatus::Timeout => EXIT_CODE_TIMEOUT,
            ExecutionStatus::Killed => EXIT_CODE_KILLED,
            _ => exit_code,
        };
        self.completed_at = Utc::now();
        self.duration = (self.completed_at - self.started_at)
            .to_std()
            .unwrap_or_default();
    }

    /// Record a best-effort warning in both the structured list and stderr.
    pub(crate) fn warn(&mut self, warning: String) {
        if !self.stderr.is_empty() && !self.stderr.ends_with('\n') {
            self.stderr.push('\n');
        }
        self.stderr.push_str(&warning);
        self.warnings.push(warning);
    }
}
