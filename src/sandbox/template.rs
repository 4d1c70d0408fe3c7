use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

pub const FILE_PLACEHOLDER: &str = "{{file}}";
pub const DEFAULT_WORKDIR: &str = "/workspace";

/// A package-cache mount and the env vars pointing the toolchain at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMountSpec {
    pub name: String,
    pub container_path: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CacheMountSpec {
    fn new(name: &str, container_path: &str, env_var: &str) -> Self {
        Self {
            name: name.to_string(),
            container_path: container_path.to_string(),
            env: BTreeMap::from([(env_var.to_string(), container_path.to_string())]),
        }
    }
}

/// Execution recipe for one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageTemplate {
    pub language: String,
    pub file_name: String,
    pub image: String,
    #[serde(default)]
    pub work_dir: String,
    pub command_template: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cache_mounts: Vec<CacheMountSpec>,
}

impl LanguageTemplate {
    /// Canonicalize the language key and fill defaults.
    pub fn normalized(mut self) -> Self {
        self.language = normalize_language(&self.language);
        if self.work_dir.is_empty() {
            self.work_dir = DEFAULT_WORKDIR.to_string();
        }
        self
    }

    /// Substitute the entry file into every command token.
    pub fn render_command(&self, entry_file: &str) -> Vec<String> {
        self.command_template
            .iter()
            .map(|part| part.replace(FILE_PLACEHOLDER, entry_file))
            .collect()
    }
}

/// Map language aliases onto their canonical key.
pub fn normalize_language(language: &str) -> String {
    let lang = language.trim().to_lowercase();
    match lang.as_str() {
        "js" | "node" | "nodejs" => "javascript".to_string(),
        "ts" => "typescript".to_string(),
        "py" | "python3" => "python".to_string(),
        "golang" => "go".to_string(),
        "c++" => "cpp".to_string(),
        _ => lang,
    }
}

fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn command(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

/// Built-in templates keyed by canonical language.
pub fn default_templates() -> HashMap<String, LanguageTemplate> {
    let templates = vec![
        LanguageTemplate {
            language: "python".into(),
            file_name: "main.py".into(),
            image: "python:3.12-slim-bookworm".into(),
            work_dir: DEFAULT_WORKDIR.into(),
            command_template: command(&["python3", "-u", FILE_PLACEHOLDER]),
            env: env(&[
                ("PYTHONDONTWRITEBYTECODE", "1"),
                ("PYTHONUNBUFFERED", "1"),
                ("PIP_DISABLE_PIP_VERSION_CHECK", "1"),
            ]),
            cache_mounts: vec![CacheMountSpec::new("pip", "/cache/pip", "PIP_CACHE_DIR")],
        },
        LanguageTemplate {
            language: "javascript".into(),
            file_name: "main.js".into(),
            image: "node:20-slim".into(),
            work_dir: DEFAULT_WORKDIR.into(),
            command_template: command(&["node", FILE_PLACEHOLDER]),
            env: env(&[("NODE_ENV", "production")]),
            cache_mounts: vec![CacheMountSpec::new("npm", "/cache/npm", "NPM_CONFIG_CACHE")],
        },
        LanguageTemplate {
            language: "typescript".into(),
            file_name: "main.ts".into(),
            image: "node:20-slim".into(),
            work_dir: DEFAULT_WORKDIR.into(),
            command_template: command(&[
                "sh",
                "-lc",
                "npm --yes --cache /cache/npm exec tsx {{file}}",
            ]),
            env: env(&[("NODE_ENV", "production")]),
            cache_mounts: vec![CacheMountSpec::new("npm", "/cache/npm", "NPM_CONFIG_CACHE")],
        },
        // `/tmp` is mounted noexec, so compiled programs live under `.build`
        // in the workspace mount
        LanguageTemplate {
            language: "go".into(),
            file_name: "main.go".into(),
            image: "golang:1.22-bookworm".into(),
            work_dir: DEFAULT_WORKDIR.into(),
            command_template: command(&[
                "sh",
                "-lc",
                "mkdir -p .build/tmp && GOTMPDIR=\"$PWD/.build/tmp\" go run {{file}}",
            ]),
            env: env(&[("CGO_ENABLED", "0")]),
            cache_mounts: vec![
                CacheMountSpec::new("go-build", "/cache/go-build", "GOCACHE"),
                CacheMountSpec::new("go-mod", "/cache/go-mod", "GOMODCACHE"),
            ],
        },
        LanguageTemplate {
            language: "rust".into(),
            file_name: "main.rs".into(),
            image: "rust:1.75-slim-bookworm".into(),
            work_dir: DEFAULT_WORKDIR.into(),
            command_template: command(&[
                "sh",
                "-lc",
                "mkdir -p .build && rustc {{file}} -O -o .build/main && ./.build/main",
            ]),
            env: BTreeMap::new(),
            cache_mounts: vec![
                CacheMountSpec::new("cargo-home", "/cache/cargo-home", "CARGO_HOME"),
                CacheMountSpec::new("cargo-target", "/cache/cargo-target", "CARGO_TARGET_DIR"),
            ],
        },
        LanguageTemplate {
            language: "java".into(),
            file_name: "Main.java".into(),
            image: "eclipse-temurin:21-jdk-jammy".into(),
            work_dir: DEFAULT_WORKDIR.into(),
            command_template: command(&[
                "sh",
                "-lc",
                "javac {{file}} && java ${APEX_JAVA_CLASS:-Main}",
            ]),
            env: BTreeMap::new(),
            cache_mounts: vec![CacheMountSpec::new("m2", "/cache/m2", "MAVEN_CONFIG")],
        },
        LanguageTemplate {
            language: "c".into(),
            file_name: "main.c".into(),
            image: "gcc:13-bookworm".into(),
            work_dir: DEFAULT_WORKDIR.into(),
            command_template: command(&[
                "sh",
                "-lc",
                "mkdir -p .build && gcc -O2 {{file}} -o .build/main -lm && ./.build/main",
            ]),
            env: BTreeMap::new(),
            cache_mounts: Vec::new(),
        },
        LanguageTemplate {
            language: "cpp".into(),
            file_name: "main.cpp".into(),
            image: "gcc:13-bookworm".into(),
            work_dir: DEFAULT_WORKDIR.into(),
            command_template: command(&[
                "sh",
                "-lc",
                "mkdir -p .build && g++ -O2 -std=c++17 {{file}} -o .build/main && ./.build/main",
            ]),
            env: BTreeMap::new(),
            cache_mounts: Vec::new(),
        },
    ];

    templates
        .into_iter()
        .map(|t| (t.language.clone(), t))
        .collect()
}
