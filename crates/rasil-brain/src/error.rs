use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrainError {
    #[error("store error: {0}")]
    Store(#[from] rasil_store::StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] rasil_cache::CacheError),

    /// Provider 429: cooldown is set, the message keeps its placeholder and
    /// the scheduler's retry pass re-attempts it.
    #[error("provider rate limited, cooldown set")]
    ProviderRateLimited,

    #[error("analyzer error: {0}")]
    Analyzer(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BrainError>;
