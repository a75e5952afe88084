use thiserror::Error;

/// Gateway-level error aggregate. The per-concern crates carry their own
/// error enums; this is what HTTP handlers and the worker loop surface.
#[derive(Debug, Error)]
pub enum RasilError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Credential vault error: {0}")]
    Vault(String),

    #[error("Transport error ({channel}): {reason}")]
    Transport {
        channel: String,
        reason: String,
        retryable: bool,
    },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Analyzer error: {0}")]
    Analyzer(String),

    #[error("Task queue error: {0}")]
    Queue(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RasilError {
    /// Short error code string used in HTTP error bodies and WS frames.
    pub fn code(&self) -> &'static str {
        match self {
            RasilError::Config(_) => "CONFIG_ERROR",
            RasilError::Database(_) => "DATABASE_ERROR",
            RasilError::Vault(_) => "VAULT_ERROR",
            RasilError::Transport { .. } => "TRANSPORT_ERROR",
            RasilError::RateLimited(_) => "RATE_LIMITED",
            RasilError::Analyzer(_) => "ANALYZER_ERROR",
            RasilError::Queue(_) => "QUEUE_ERROR",
            RasilError::Validation(_) => "VALIDATION_ERROR",
            RasilError::NotFound(_) => "NOT_FOUND",
            RasilError::Serialization(_) => "SERIALIZATION_ERROR",
            RasilError::Io(_) => "IO_ERROR",
            RasilError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the task worker should re-queue the failed task.
    pub fn is_retryable(&self) -> bool {
        match self {
            RasilError::Transport { retryable, .. } => *retryable,
            RasilError::RateLimited(_) | RasilError::Database(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RasilError>;
