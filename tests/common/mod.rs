#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use polysandbox::config::ManagerConfig;
use polysandbox::error::{Result, SandboxError};
use polysandbox::sandbox::{
    read_capped, ContainerLogs, ContainerRuntime, ContainerSpec, ExecutionStats, Manager,
    SandboxExecutor,
};

/// How every fake container behaves.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` runs until killed
    pub run_for: Option<Duration>,
    pub image_present: bool,
    pub fail_attach: bool,
    /// Delay after the container exists but before `create` returns
    pub create_delay: Option<Duration>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            run_for: Some(Duration::from_millis(5)),
            image_present: true,
            fail_attach: false,
            create_delay: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedContainer {
    pub spec: ContainerSpec,
    /// Files present in the workspace mount at create time
    pub staged: HashMap<String, String>,
}

/// In-memory container runtime recording every call.
#[derive(Default)]
pub struct FakeRuntime {
    pub behavior: Mutex<Behavior>,
    pub created: Mutex<HashMap<String, CreatedContainer>>,
    pub removed: Mutex<Vec<String>>,
    pub killed: Mutex<Vec<String>>,
    pub stdin: Mutex<Vec<(String, String)>>,
    pub pulled: Mutex<Vec<String>>,
    kill_notify: Mutex<HashMap<String, Arc<Notify>>>,
    next_id: AtomicUsize,
}

impl FakeRuntime {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            ..Self::default()
        })
    }

    fn behavior(&self) -> Behavior {
        self.behavior.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.lock().unwrap().len()
    }

    pub fn only_container(&self) -> CreatedContainer {
        let created = self.created.lock().unwrap();
        assert_eq!(created.len(), 1, "expected exactly one container");
        created.values().next().unwrap().clone()
    }

    /// Containers that were created but never removed.
    pub fn orphans(&self) -> Vec<String> {
        let removed = self.removed.lock().unwrap();
        self.created
            .lock()
            .unwrap()
            .keys()
            .filter(|id| !removed.contains(id))
            .cloned()
            .collect()
    }
}

fn snapshot_dir(root: &Path) -> HashMap<String, String> {
    let mut files = HashMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
                files.insert(rel, std::fs::read_to_string(&path).unwrap_or_default());
            }
        }
    }
    files
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn image_exists(&self, _image: &str) -> Result<bool> {
        Ok(self.behavior().image_present)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.pulled.lock().unwrap().push(image.to_string());
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let staged = snapshot_dir(&spec.mounts[0].source);
        self.created.lock().unwrap().insert(
            id.clone(),
            CreatedContainer {
                spec: spec.clone(),
                staged,
            },
        );
        self.kill_notify
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::new(Notify::new()));
        if let Some(delay) = self.behavior().create_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn start(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn attach_stdin(&self, id: &str, input: &str) -> Result<()> {
        if self.behavior().fail_attach {
            return Err(SandboxError::Runtime("attach refused".to_string()));
        }
        self.stdin
            .lock()
            .unwrap()
            .push((id.to_string(), input.to_string()));
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let behavior = self.behavior();
        let notify = self.kill_notify.lock().unwrap().get(id).cloned();
        let notify = notify.ok_or_else(|| SandboxError::Runtime(format!("no such container {id}")))?;
        match behavior.run_for {
            Some(d) => tokio::select! {
                _ = tokio::time::sleep(d) => Ok(behavior.exit_code),
                _ = notify.notified() => Ok(137),
            },
            None => {
                notify.notified().await;
                Ok(137)
            }
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.killed.lock().unwrap().push(id.to_string());
        if let Some(n) = self.kill_notify.lock().unwrap().get(id) {
            n.notify_waiters();
        }
        Ok(())
    }

    async fn remove(&self, id_or_name: &str) -> Result<()> {
        // Like `docker rm`, accept either the container id or its name
        let id = self
            .created
            .lock()
            .unwrap()
            .iter()
            .find(|(id, c)| id.as_str() == id_or_name || c.spec.name == id_or_name)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| SandboxError::Runtime(format!("no such container {id_or_name}")))?;
        self.removed.lock().unwrap().push(id);
        Ok(())
    }

    async fn logs(&self, _id: &str, limit: u64) -> Result<ContainerLogs> {
        let behavior = self.behavior();
        Ok(ContainerLogs {
            stdout: read_capped(&behavior.stdout[..], limit).await?,
            stderr: read_capped(&behavior.stderr[..], limit).await?,
            error: None,
        })
    }
}

pub fn test_config(root: &Path) -> ManagerConfig {
    ManagerConfig {
        workspace_root: root.join("workspaces"),
        package_cache_root: root.join("cache"),
        ..ManagerConfig::default()
    }
}

pub fn executor_with(config: ManagerConfig, runtime: Arc<FakeRuntime>) -> SandboxExecutor {
    let manager = Arc::new(Manager::new(config).unwrap());
    SandboxExecutor::with_runtime(manager, runtime, Arc::new(ExecutionStats::new()))
}

/// Poll until `cond` holds or a second passes.
pub async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Every directory left under the workspace root, excluding project buckets.
pub fn leftover_workspaces(root: &Path) -> Vec<String> {
    let mut left = Vec::new();
    let Ok(projects) = std::fs::read_dir(root.join("workspaces")) else {
        return left;
    };
    for project in projects {
        let project = project.unwrap().path();
        for ws in std::fs::read_dir(&project).unwrap() {
            left.push(ws.unwrap().path().display().to_string());
        }
    }
    left
}
