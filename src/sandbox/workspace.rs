//! Per-execution workspace staging.
//!
//! A `Workspace` exclusively owns `<project-root>/<execution-id>/` and removes
//! it when dropped, so every exit path of an execution releases it.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::sandbox::normalize::normalize_primary_code;
use crate::sandbox::template::LanguageTemplate;

/// Fallback entry file when a template declares none.
const FALLBACK_ENTRY_FILE: &str = "main.txt";

/// Longest readable prefix kept in an execution leaf name.
const LEAF_PREFIX_LEN: usize = 40;

/// Restrict an identifier to `[a-z0-9_-]`, mapping everything else to `-`
/// and trimming leading/trailing dashes.
pub fn sanitize_id(input: &str) -> String {
    let lowered = input.trim().to_lowercase();
    let mapped: String = lowered
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => c,
            _ => '-',
        })
        .collect();
    mapped.trim_matches('-').to_string()
}

/// Host-safe name for an execution: a readable prefix of the sanitized ID
/// plus a digest of the raw ID, so distinct IDs never share a name.
pub fn execution_leaf(execution_id: &str) -> String {
    let mut digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, execution_id.as_bytes())
        .simple()
        .to_string();
    digest.truncate(12);
    let sanitized = sanitize_id(execution_id);
    let prefix: String = sanitized.chars().take(LEAF_PREFIX_LEN).collect();
    let prefix = prefix.trim_end_matches('-');
    if prefix.is_empty() {
        digest
    } else {
        format!("{}-{}", prefix, digest)
    }
}

/// Resolve a request-relative path, rejecting anything that escapes the root.
///
/// `..` segments that climb above the root, absolute paths, and paths that
/// resolve to the root itself are all rejected.
pub fn resolve_relative(rel: &str) -> Result<PathBuf> {
    let invalid = || SandboxError::InvalidPath {
        path: rel.to_string(),
    };

    if rel.contains('\0') {
        return Err(invalid());
    }

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(invalid());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(invalid()),
        }
    }

    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts.iter().collect())
}

/// Entry file and extra env produced by staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEntry {
    pub file_name: String,
    pub env: BTreeMap<String, String>,
}

/// Exclusively owned execution directory, removed on drop.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Create `<project_root>/<execution_leaf(id)>`. Fails if it already exists.
    pub async fn create(project_root: &Path, execution_id: &str) -> Result<Self> {
        fs::create_dir_all(project_root).await?;
        let dir = project_root.join(execution_leaf(execution_id));
        fs::create_dir(&dir).await.map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("Failed to create workspace {}: {}", dir.display(), e),
            )
        })?;

        debug!(workspace = %dir.display(), "Workspace created");
        Ok(Self {
            dir,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write the normalized entry file and every auxiliary file.
    ///
    /// All paths are validated before anything is written, and every
    /// written file is re-checked to resolve inside the workspace.
    pub async fn stage(
        &self,
        template: &LanguageTemplate,
        code: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<StagedEntry> {
        let mut resolved: BTreeMap<PathBuf, &str> = BTreeMap::new();
        for (rel, content) in files {
            resolved.insert(resolve_relative(rel)?, content.as_str());
        }

        let mut entry = StagedEntry {
            file_name: if template.file_name.is_empty() {
                FALLBACK_ENTRY_FILE.to_string()
            } else {
                template.file_name.clone()
            },
            env: BTreeMap::new(),
        };

        let normalized;
        if !code.is_empty() {
            normalized = normalize_primary_code(template, code);
            entry.file_name = normalized.file_name.clone();
            entry.env = normalized.env.clone();
            resolved.insert(resolve_relative(&entry.file_name)?, normalized.content.as_str());
        }

        if resolved.is_empty() {
            return Err(SandboxError::NoCode);
        }

        let root = fs::canonicalize(&self.dir).await?;
        for (rel, content) in &resolved {
            let target = self.dir.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
                if !fs::canonicalize(parent).await?.starts_with(&root) {
                    return Err(SandboxError::InvalidPath {
                        path: rel.display().to_string(),
                    });
                }
            }
            fs::write(&target, content).await?;
        }

        debug!(
            workspace = %self.dir.display(),
            files = resolved.len(),
            entry = %entry.file_name,
            "Workspace staged"
        );
        Ok(entry)
    }

    /// Remove the workspace directory now instead of on drop.
    pub async fn cleanup(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        // No executor to await on here
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(workspace = %self.dir.display(), error = %e, "Failed to remove workspace")
            }
        }
    }
}
