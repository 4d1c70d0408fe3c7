use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Result, SandboxError};
use crate::sandbox::backends::runtime::{
    read_capped, ContainerLogs, ContainerRuntime, ContainerSpec,
};

const DEFAULT_BINARY: &str = "docker";

/// Container runtime driven through the `docker` CLI.
///
/// Every operation spawns one CLI process. The daemon endpoint comes from
/// `DOCKER_HOST` when set.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    host: String,
}

impl DockerCli {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
            host: host.into(),
        }
    }

    /// Check if the daemon is reachable.
    pub async fn is_available(&self) -> bool {
        match self
            .command()
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if !self.host.is_empty() {
            cmd.env("DOCKER_HOST", &self.host);
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a CLI subcommand to completion and return its trimmed stdout.
    async fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = self.command();
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            SandboxError::Runtime(format!("Failed to run {}: {}", self.binary, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Runtime(stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Translate a container spec into `docker create` arguments.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];

    if spec.open_stdin {
        args.push("--interactive".to_string());
    }
    if !spec.work_dir.is_empty() {
        args.extend(["--workdir".to_string(), spec.work_dir.clone()]);
    }
    for (key, value) in &spec.env {
        args.extend(["--env".to_string(), format!("{}={}", key, value)]);
    }
    for (key, value) in &spec.labels {
        args.extend(["--label".to_string(), format!("{}={}", key, value)]);
    }
    for mount in &spec.mounts {
        let mut m = format!(
            "type=bind,source={},target={}",
            mount.source.display(),
            mount.target
        );
        if mount.read_only {
            m.push_str(",readonly");
        }
        args.extend(["--mount".to_string(), m]);
    }

    let network = if spec.network_enabled { "bridge" } else { "none" };
    args.push(format!("--network={}", network));

    if spec.read_only_rootfs {
        args.push("--read-only".to_string());
    }
    for opt in &spec.security_opt {
        args.extend(["--security-opt".to_string(), opt.clone()]);
    }
    for cap in &spec.cap_drop {
        args.extend(["--cap-drop".to_string(), cap.clone()]);
    }
    if let Some(runtime) = &spec.runtime {
        args.push(format!("--runtime={}", runtime));
    }
    for (path, opts) in &spec.tmpfs {
        let value = if opts.is_empty() {
            path.clone()
        } else {
            format!("{}:{}", path, opts)
        };
        args.extend(["--tmpfs".to_string(), value]);
    }
    if spec.shm_size > 0 {
        args.push(format!("--shm-size={}", spec.shm_size));
    }
    if spec.memory_bytes > 0 {
        args.push(format!("--memory={}", spec.memory_bytes));
        args.push(format!("--memory-swap={}", spec.memory_swap_bytes));
    }
    if spec.nano_cpus > 0 {
        args.push(format!("--cpus={}", spec.nano_cpus as f64 / 1e9));
    }
    if spec.pids_limit > 0 {
        args.push(format!("--pids-limit={}", spec.pids_limit));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        "docker-cli"
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let status = self
            .command()
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| SandboxError::Runtime(format!("Failed to run {}: {}", self.binary, e)))?;
        Ok(status.success())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, "Pulling image");
        self.run(["pull", "--quiet", image]).await.map_err(|e| {
            SandboxError::ImageUnavailable {
                image: image.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self
            .run(create_args(spec))
            .await
            .map_err(|e| SandboxError::Runtime(format!("container create failed: {}", e)))?;
        debug!(container_id = %id, name = %spec.name, "Container created");
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run(["start", id])
            .await
            .map_err(|e| SandboxError::Runtime(format!("container start failed: {}", e)))?;
        Ok(())
    }

    async fn attach_stdin(&self, id: &str, input: &str) -> Result<()> {
        let mut child = self
            .command()
            .args(["attach", "--sig-proxy=false", id])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SandboxError::Runtime(format!("Failed to run {}: {}", self.binary, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Runtime("attach has no stdin pipe".to_string()))?;
        stdin.write_all(input.as_bytes()).await?;
        stdin.shutdown().await?;
        drop(stdin);

        // The attach client exits once the container's stdin closes
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let out = self
            .run(["wait", id])
            .await
            .map_err(|e| SandboxError::Runtime(format!("container wait failed: {}", e)))?;
        out.lines()
            .last()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| SandboxError::Runtime(format!("unexpected wait output: {:?}", out)))
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.run(["kill", "--signal", "KILL", id]).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.run(["rm", "--force", "--volumes", id]).await?;
        Ok(())
    }

    async fn logs(&self, id: &str, limit: u64) -> Result<ContainerLogs> {
        let mut child = self
            .command()
            .args(["logs", id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::Runtime(format!("Failed to run {}: {}", self.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Runtime("logs has no stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Runtime("logs has no stderr pipe".to_string()))?;

        let (out, err, status) = tokio::join!(
            read_capped(stdout, limit),
            read_capped(stderr, limit),
            child.wait()
        );

        let mut logs = ContainerLogs::default();
        let mut problems = Vec::new();
        match out {
            Ok(o) => logs.stdout = o,
            Err(e) => problems.push(format!("stdout: {}", e)),
        }
        match err {
            Ok(e) => logs.stderr = e,
            Err(e) => problems.push(format!("stderr: {}", e)),
        }
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => {
                // On failure the CLI's own complaint is on stderr, not container output
                let msg = String::from_utf8_lossy(&logs.stderr.bytes).trim().to_string();
                logs.stderr = Default::default();
                problems.push(format!("{} logs exited with {}: {}", self.binary, s, msg));
            }
            Err(e) => problems.push(e.to_string()),
        }
        if !problems.is_empty() {
            logs.error = Some(problems.join("; "));
        }
        Ok(logs)
    }
}
