use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("event bus closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, CacheError>;
