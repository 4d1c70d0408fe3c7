use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Runtime '{runtime}' is not allowed")]
    RuntimeNotAllowed { runtime: String },

    #[error("{mode} isolation requested but {env_var} is not configured")]
    ProxyNotConfigured { mode: String, env_var: String },

    // Input errors
    #[error("Language is required")]
    MissingLanguage,

    #[error("Unsupported language: {language}")]
    UnsupportedLanguage { language: String },

    #[error("Invalid file path in request: {path}")]
    InvalidPath { path: String },

    #[error("No code or files provided")]
    NoCode,

    // Infrastructure errors
    #[error("Image '{image}' is not available: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Isolation proxy failed: {0}")]
    Proxy(String),

    #[error("Deadline exceeded while {stage}")]
    DeadlineExceeded { stage: String },

    // Tracker errors
    #[error("Execution not found: {id}")]
    ExecutionNotFound { id: String },

    #[error("Execution already in flight: {id}")]
    DuplicateExecution { id: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SandboxError {
    /// Infrastructure failures the caller may choose to retry with a new execution.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Runtime(_)
                | Self::ImageUnavailable { .. }
                | Self::DeadlineExceeded { .. }
                | Self::Proxy(_)
        )
    }

    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::MissingLanguage
                | Self::UnsupportedLanguage { .. }
                | Self::InvalidPath { .. }
                | Self::NoCode
        )
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
