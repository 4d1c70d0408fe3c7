use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::config::ManagerConfig;
use crate::error::{Result, SandboxError};
use crate::sandbox::quota::{default_language_quotas, ResourceQuota};
use crate::sandbox::template::{default_templates, normalize_language, LanguageTemplate};
use crate::sandbox::workspace::sanitize_id;

const ANONYMOUS_PROJECT: &str = "anonymous";
const SHARED_PROJECT: &str = "shared";

/// Composition root for templates, quotas and host storage roots.
///
/// Built-in templates and quotas are loaded first; entries from the config
/// are layered on top, keyed by canonical language.
#[derive(Debug)]
pub struct Manager {
    config: ManagerConfig,
    templates: RwLock<HashMap<String, LanguageTemplate>>,
    language_quotas: HashMap<String, ResourceQuota>,
}

impl Manager {
    /// Create the manager and the host directories it owns.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        if config.workspace_root.as_os_str().is_empty() {
            return Err(SandboxError::Config("workspace root is required".to_string()));
        }
        fs::create_dir_all(&config.workspace_root).map_err(|e| {
            SandboxError::Config(format!(
                "create workspace root {}: {}",
                config.workspace_root.display(),
                e
            ))
        })?;

        if config.enable_package_cache {
            if config.package_cache_root.as_os_str().is_empty() {
                return Err(SandboxError::Config(
                    "package cache root is required when caching is enabled".to_string(),
                ));
            }
            fs::create_dir_all(&config.package_cache_root).map_err(|e| {
                SandboxError::Config(format!(
                    "create package cache root {}: {}",
                    config.package_cache_root.display(),
                    e
                ))
            })?;
        }

        let mut templates = default_templates();
        for template in config.templates.values() {
            let template = template.clone().normalized();
            templates.insert(template.language.clone(), template);
        }

        let mut language_quotas = default_language_quotas();
        for (language, quota) in &config.language_quotas {
            language_quotas.insert(normalize_language(language), *quota);
        }

        info!(
            workspace_root = %config.workspace_root.display(),
            package_cache = config.enable_package_cache,
            default_isolation = %config.default_isolation,
            templates = templates.len(),
            "Sandbox manager initialized"
        );

        Ok(Self {
            config,
            templates: RwLock::new(templates),
            language_quotas,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn read_templates(&self) -> RwLockReadGuard<'_, HashMap<String, LanguageTemplate>> {
        self.templates.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_templates(&self) -> RwLockWriteGuard<'_, HashMap<String, LanguageTemplate>> {
        self.templates.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Look up the template for a language or one of its aliases.
    pub fn get_template(&self, language: &str) -> Option<LanguageTemplate> {
        self.read_templates()
            .get(&normalize_language(language))
            .cloned()
    }

    /// Add or replace a template; last write wins.
    pub fn register_template(&self, template: LanguageTemplate) {
        let template = template.normalized();
        debug!(language = %template.language, image = %template.image, "Template registered");
        self.write_templates()
            .insert(template.language.clone(), template);
    }

    /// All registered templates, sorted by language.
    pub fn templates(&self) -> Vec<LanguageTemplate> {
        let mut list: Vec<LanguageTemplate> = self.read_templates().values().cloned().collect();
        list.sort_by(|a, b| a.language.cmp(&b.language));
        list
    }

    /// Default quota merged with the language override, floors filled.
    pub fn effective_quota(&self, language: &str) -> ResourceQuota {
        let base = self.config.default_quota;
        let quota = match self.language_quotas.get(&normalize_language(language)) {
            Some(overrides) => base.merged_with(overrides),
            None => base,
        };
        quota.with_floors()
    }

    /// Project-scoped workspace root; unusable IDs share the anonymous bucket.
    pub fn workspace_root_for_project(&self, project_id: &str) -> PathBuf {
        let project = sanitize_id(project_id);
        let project = if project.is_empty() {
            ANONYMOUS_PROJECT.to_string()
        } else {
            project
        };
        self.config.workspace_root.join(project)
    }

    /// Host directory for a project's package cache, created on demand.
    ///
    /// Returns `None` when package caching is disabled.
    pub async fn package_cache_path(
        &self,
        project_id: &str,
        cache_name: &str,
    ) -> Result<Option<PathBuf>> {
        if !self.config.enable_package_cache {
            return Ok(None);
        }

        let project = sanitize_id(project_id);
        let project = if project.is_empty() {
            SHARED_PROJECT.to_string()
        } else {
            project
        };
        let cache = sanitize_id(cache_name);
        if cache.is_empty() {
            return Err(SandboxError::Config(format!(
                "invalid cache name: {:?}",
                cache_name
            )));
        }

        let path = self.config.package_cache_root.join(project).join(cache);
        tokio::fs::create_dir_all(&path).await?;
        Ok(Some(path))
    }
}
