use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::units;

/// Floors applied when a quota leaves a ceiling unset.
pub const FLOOR_MEMORY_BYTES: u64 = 256 * 1024 * 1024;
pub const FLOOR_CPU_CORES: f64 = 0.5;
pub const FLOOR_PIDS_LIMIT: u64 = 128;
pub const FLOOR_TIMEOUT: Duration = Duration::from_secs(30);
pub const FLOOR_MAX_OUTPUT_BYTES: u64 = 1 << 20;

/// Hard ceilings applied to one run.
///
/// In a per-language override a zero field means "inherit the default".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceQuota {
    #[serde(with = "units::byte_size")]
    pub memory_bytes: u64,
    pub cpu_cores: f64,
    pub pids_limit: u64,
    #[serde(with = "units::duration")]
    pub timeout: Duration,
    #[serde(with = "units::byte_size")]
    pub max_output_bytes: u64,
}

impl Default for ResourceQuota {
    /// The zero quota: every field inherits.
    fn default() -> Self {
        Self {
            memory_bytes: 0,
            cpu_cores: 0.0,
            pids_limit: 0,
            timeout: Duration::ZERO,
            max_output_bytes: 0,
        }
    }
}

impl ResourceQuota {
    pub const fn new(
        memory_bytes: u64,
        cpu_cores: f64,
        pids_limit: u64,
        timeout: Duration,
        max_output_bytes: u64,
    ) -> Self {
        Self {
            memory_bytes,
            cpu_cores,
            pids_limit,
            timeout,
            max_output_bytes,
        }
    }

    /// Production default applied to every language without an override.
    pub fn production_default() -> Self {
        Self::new(
            512 * 1024 * 1024,
            1.0,
            128,
            Duration::from_secs(45),
            1 << 20,
        )
    }

    /// Layer `overrides` on top of `self`; only positive fields win.
    pub fn merged_with(mut self, overrides: &ResourceQuota) -> Self {
        if overrides.memory_bytes > 0 {
            self.memory_bytes = overrides.memory_bytes;
        }
        if overrides.cpu_cores > 0.0 {
            self.cpu_cores = overrides.cpu_cores;
        }
        if overrides.pids_limit > 0 {
            self.pids_limit = overrides.pids_limit;
        }
        if !overrides.timeout.is_zero() {
            self.timeout = overrides.timeout;
        }
        if overrides.max_output_bytes > 0 {
            self.max_output_bytes = overrides.max_output_bytes;
        }
        self
    }

    /// Replace any field still at zero with its hard floor.
    pub fn with_floors(mut self) -> Self {
        if self.memory_bytes == 0 {
            self.memory_bytes = FLOOR_MEMORY_BYTES;
        }
        if self.cpu_cores <= 0.0 {
            self.cpu_cores = FLOOR_CPU_CORES;
        }
        if self.pids_limit == 0 {
            self.pids_limit = FLOOR_PIDS_LIMIT;
        }
        if self.timeout.is_zero() {
            self.timeout = FLOOR_TIMEOUT;
        }
        if self.max_output_bytes == 0 {
            self.max_output_bytes = FLOOR_MAX_OUTPUT_BYTES;
        }
        self
    }

    /// CPU share expressed in nano-CPUs as container runtimes expect.
    pub fn nano_cpus(&self) -> u64 {
        (self.cpu_cores * 1_000_000_000.0) as u64
    }
}

/// Built-in per-language overrides.
pub fn default_language_quotas() -> HashMap<String, ResourceQuota> {
    const MIB: u64 = 1024 * 1024;
    let secs = Duration::from_secs;
    HashMap::from([
        ("python".to_string(), ResourceQuota::new(256 * MIB, 0.5, 64, secs(30), 1 << 20)),
        ("javascript".to_string(), ResourceQuota::new(256 * MIB, 0.75, 96, secs(30), 1 << 20)),
        ("typescript".to_string(), ResourceQuota::new(512 * MIB, 1.0, 128, secs(45), 1 << 20)),
        ("go".to_string(), ResourceQuota::new(768 * MIB, 1.5, 192, secs(60), 1 << 20)),
        ("rust".to_string(), ResourceQuota::new(1024 * MIB, 2.0, 256, secs(90), 1 << 20)),
        ("java".to_string(), ResourceQuota::new(1024 * MIB, 1.5, 256, secs(90), 1 << 20)),
        ("c".to_string(), ResourceQuota::new(384 * MIB, 1.0, 128, secs(45), 1 << 20)),
        ("cpp".to_string(), ResourceQuota::new(512 * MIB, 1.25, 160, secs(60), 1 << 20)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_override_only_positive_fields() {
        let base = ResourceQuota::new(256 * MB, 1.0, 64, Duration::from_secs(10), 1024);
        let overrides = ResourceQuota {
            memory_bytes: 512 * MB,
            ..ResourceQuota::default()
        };

        let merged = base.merged_with(&overrides);
        assert_eq!(merged.memory_bytes, 512 * MB);
        assert_eq!(merged.cpu_cores, 1.0);
        assert_eq!(merged.pids_limit, 64);
        assert_eq!(merged.timeout, Duration::from_secs(10));
        assert_eq!(merged.max_output_bytes, 1024);
    }

    #[test]
    fn test_floors_fill_zero_fields() {
        let q = ResourceQuota {
            cpu_cores: 2.0,
            ..ResourceQuota::default()
        }
        .with_floors();
        assert_eq!(q.memory_bytes, FLOOR_MEMORY_BYTES);
        assert_eq!(q.cpu_cores, 2.0);
        assert_eq!(q.pids_limit, FLOOR_PIDS_LIMIT);
        assert_eq!(q.timeout, FLOOR_TIMEOUT);
        assert_eq!(q.max_output_bytes, FLOOR_MAX_OUTPUT_BYTES);
    }

    #[test]
    fn test_nano_cpus() {
        let q = ResourceQuota::new(0, 1.5, 0, Duration::ZERO, 0);
        assert_eq!(q.nano_cpus(), 1_500_000_000);
    }

    #[test]
    fn test_deserialize_humane_units() {
        let q: ResourceQuota = toml::from_str(
            r#"
            memory_bytes = "512m"
            timeout = "90s"
            "#,
        )
        .unwrap();
        assert_eq!(q.memory_bytes, 512 * MB);
        assert_eq!(q.timeout, Duration::from_secs(90));
        assert_eq!(q.cpu_cores, 0.0);
    }
}
