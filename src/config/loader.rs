use std::path::{Path, PathBuf};

use crate::config::types::PolysandboxConfig;
use crate::error::{Result, SandboxError};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "polysandbox", "polysandbox") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".polysandbox").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values, then
/// apply environment overrides.
///
/// An explicitly requested path must exist; the default path is optional.
pub fn load_config(config_path: Option<&Path>) -> Result<PolysandboxConfig> {
    let mut config = match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(SandboxError::ConfigNotFound {
                    path: path.display().to_string(),
                });
            }
            read_config(path)?
        }
        None => {
            let path = get_config_path();
            if path.exists() {
                read_config(&path)?
            } else {
                PolysandboxConfig::default()
            }
        }
    };

    config.sandbox.apply_env();
    Ok(config)
}

fn read_config(path: &Path) -> Result<PolysandboxConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| SandboxError::TomlParse(e.to_string()))
}

/// Render the default configuration as TOML.
pub fn default_config_toml() -> Result<String> {
    toml::to_string_pretty(&PolysandboxConfig::default())
        .map_err(|e| SandboxError::TomlParse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_explicit_path_is_error() {
        let err = load_config(Some(Path::new("/nonexistent/polysandbox.toml"))).unwrap_err();
        assert!(matches!(err, SandboxError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_default_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, default_config_toml().unwrap()).unwrap();

        let config = read_config(&path).unwrap();
        assert_eq!(config.sandbox.gvisor_runtime, "runsc");
        assert_eq!(config.sandbox.default_tmpfs_size, "64m");
    }

    #[test]
    fn test_bad_toml_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sandbox\npull_images = ").unwrap();

        let err = read_config(&path).unwrap_err();
        assert!(matches!(err, SandboxError::TomlParse(_)));
    }
}
