use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] rasil_store::StoreError),

    #[error("task payload error: {0}")]
    Payload(serde_json::Error),

    #[error("claimed task {0} vanished")]
    Missing(i64),
}

pub type Result<T> = std::result::Result<T, QueueError>;
