use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("store error: {0}")]
    Store(#[from] rasil_store::StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] rasil_queue::QueueError),

    #[error("transport error: {0}")]
    Transport(#[from] rasil_channels::TransportError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] rasil_dispatch::DispatchError),

    #[error("brain error: {0}")]
    Brain(#[from] rasil_brain::BrainError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
