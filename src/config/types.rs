use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::config::units;
use crate::error::SandboxError;
use crate::sandbox::quota::ResourceQuota;
use crate::sandbox::template::LanguageTemplate;

pub const ENV_DOCKER_HOST: &str = "DOCKER_HOST";
pub const ENV_ISOLATION: &str = "SANDBOX_V2_ISOLATION";
pub const ENV_GVISOR_RUNTIME: &str = "SANDBOX_V2_GVISOR_RUNTIME";
pub const ENV_FIRECRACKER_PROXY_CMD: &str = "SANDBOX_V2_FIRECRACKER_PROXY_CMD";
pub const ENV_WORKSPACE_ROOT: &str = "SANDBOX_V2_WORKSPACE_ROOT";
pub const ENV_PACKAGE_CACHE_ROOT: &str = "SANDBOX_V2_PACKAGE_CACHE_ROOT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolysandboxConfig {
    pub sandbox: ManagerConfig,
}

/// The isolation strategy used for a run.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Standard container under the default runtime
    #[default]
    Docker,
    /// Container under a runtime with stronger syscall filtering (runsc)
    Gvisor,
    /// MicroVM through an external proxy command
    Firecracker,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Gvisor => "gvisor",
            Self::Firecracker => "firecracker",
        }
    }

    /// Whether runs in this mode are delegated to the external proxy.
    pub fn uses_proxy(&self) -> bool {
        matches!(self, Self::Firecracker)
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "docker" | "standard" | "runc" => Ok(Self::Docker),
            "gvisor" | "runsc" => Ok(Self::Gvisor),
            "firecracker" | "vm" | "microvm" => Ok(Self::Firecracker),
            other => Err(SandboxError::Config(format!(
                "Unknown isolation mode: {}",
                other
            ))),
        }
    }
}

/// Process-wide sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Container runtime connection target
    pub docker_host: String,
    /// Isolation mode used when a request does not pick one
    pub default_isolation: IsolationMode,
    /// Runtime name used for gVisor isolation
    pub gvisor_runtime: String,
    /// Shell command that runs a request inside a microVM
    pub firecracker_proxy_cmd: String,
    /// Host directory holding per-execution workspaces
    pub workspace_root: PathBuf,
    /// Host directory holding per-project package caches
    pub package_cache_root: PathBuf,
    /// Mount package caches into runs
    pub enable_package_cache: bool,
    /// Give runs a bridged network instead of none
    pub network_enabled: bool,
    /// Mount the container root filesystem read-only
    pub read_only_rootfs: bool,
    /// Set no-new-privileges on every container
    pub no_new_privileges: bool,
    /// Pull images that are missing locally
    pub pull_images: bool,
    /// Size of the noexec /tmp tmpfs (e.g. "64m")
    pub default_tmpfs_size: String,
    /// Shared memory size in bytes
    #[serde(with = "units::byte_size")]
    pub default_shared_mem_size: u64,
    /// Runtime names the operator permits ("" is the daemon default)
    pub allowed_runtimes: Vec<String>,
    /// Quota applied to every language
    pub default_quota: ResourceQuota,
    /// Per-language overrides layered on the built-in ones
    pub language_quotas: HashMap<String, ResourceQuota>,
    /// Templates layered on the built-in ones
    pub templates: HashMap<String, LanguageTemplate>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            docker_host: "unix:///var/run/docker.sock".to_string(),
            default_isolation: IsolationMode::Docker,
            gvisor_runtime: "runsc".to_string(),
            firecracker_proxy_cmd: String::new(),
            workspace_root: tmp.join("apex-sandbox-v2"),
            package_cache_root: tmp.join("apex-sandbox-v2-cache"),
            enable_package_cache: true,
            network_enabled: false,
            read_only_rootfs: true,
            no_new_privileges: true,
            pull_images: false,
            default_tmpfs_size: "64m".to_string(),
            default_shared_mem_size: 64 * 1024 * 1024,
            allowed_runtimes: vec![String::new(), "runc".to_string(), "runsc".to_string()],
            default_quota: ResourceQuota::production_default(),
            language_quotas: HashMap::new(),
            templates: HashMap::new(),
        }
    }
}

impl ManagerConfig {
    /// Apply `DOCKER_HOST` and `SANDBOX_V2_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides using an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(host) = get(ENV_DOCKER_HOST) {
            self.docker_host = host;
        }
        if let Some(mode) = get(ENV_ISOLATION) {
            // Unknown values fall back to standard isolation
            self.default_isolation = mode.parse().unwrap_or_default();
        }
        if let Some(runtime) = get(ENV_GVISOR_RUNTIME) {
            self.gvisor_runtime = runtime;
        }
        if let Some(cmd) = get(ENV_FIRECRACKER_PROXY_CMD) {
            self.firecracker_proxy_cmd = cmd;
        }
        if let Some(root) = get(ENV_WORKSPACE_ROOT) {
            self.workspace_root = PathBuf::from(root);
        }
        if let Some(root) = get(ENV_PACKAGE_CACHE_ROOT) {
            self.package_cache_root = PathBuf::from(root);
        }
    }

    /// Whether `runtime` appears on the operator allow-list.
    pub fn is_allowed_runtime(&self, runtime: &str) -> bool {
        runtime.is_empty() || self.allowed_runtimes.iter().any(|r| r == runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_mode_parse() {
        assert_eq!("gvisor".parse::<IsolationMode>().unwrap(), IsolationMode::Gvisor);
        assert_eq!("RUNSC".parse::<IsolationMode>().unwrap(), IsolationMode::Gvisor);
        assert_eq!("".parse::<IsolationMode>().unwrap(), IsolationMode::Docker);
        assert_eq!(
            "firecracker".parse::<IsolationMode>().unwrap(),
            IsolationMode::Firecracker
        );
        assert!("kata".parse::<IsolationMode>().is_err());
        assert!(IsolationMode::Firecracker.uses_proxy());
        assert!(!IsolationMode::Gvisor.uses_proxy());
    }

    #[test]
    fn test_apply_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_ISOLATION, "firecracker"),
            (ENV_FIRECRACKER_PROXY_CMD, "fc-proxy --json"),
            (ENV_WORKSPACE_ROOT, "/srv/ws"),
            (ENV_GVISOR_RUNTIME, "   "),
        ]);

        let mut config = ManagerConfig::default();
        config.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.default_isolation, IsolationMode::Firecracker);
        assert_eq!(config.firecracker_proxy_cmd, "fc-proxy --json");
        assert_eq!(config.workspace_root, PathBuf::from("/srv/ws"));
        // Blank values are ignored
        assert_eq!(config.gvisor_runtime, "runsc");
    }

    #[test]
    fn test_unknown_env_isolation_falls_back() {
        let mut config = ManagerConfig {
            default_isolation: IsolationMode::Gvisor,
            ..ManagerConfig::default()
        };
        config.apply_env_from(|k| (k == ENV_ISOLATION).then(|| "bogus".to_string()));
        assert_eq!(config.default_isolation, IsolationMode::Docker);
    }

    #[test]
    fn test_allowed_runtimes() {
        let config = ManagerConfig::default();
        assert!(config.is_allowed_runtime(""));
        assert!(config.is_allowed_runtime("runsc"));
        assert!(!config.is_allowed_runtime("kata-runtime"));
    }

    #[test]
    fn test_parse_config_file() {
        let config: PolysandboxConfig = toml::from_str(
            r#"
            [sandbox]
            default_isolation = "gvisor"
            pull_images = true
            default_shared_mem_size = "128m"

            [sandbox.default_quota]
            memory_bytes = "1g"
            cpu_cores = 2.0
            timeout = "1m"

            [sandbox.language_quotas.python]
            memory_bytes = "512m"
            "#,
        )
        .unwrap();

        let sandbox = config.sandbox;
        assert_eq!(sandbox.default_isolation, IsolationMode::Gvisor);
        assert!(sandbox.pull_images);
        assert!(sandbox.read_only_rootfs);
        assert_eq!(sandbox.default_shared_mem_size, 128 << 20);
        assert_eq!(sandbox.default_quota.memory_bytes, 1 << 30);
        assert_eq!(sandbox.language_quotas["python"].memory_bytes, 512 << 20);
        assert_eq!(sandbox.language_quotas["python"].cpu_cores, 0.0);
    }
}
