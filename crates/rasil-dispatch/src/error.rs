use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] rasil_store::StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] rasil_channels::TransportError),

    #[error("outbox message {0} not found")]
    NotFound(i64),

    #[error("message can no longer be edited (15-minute window passed)")]
    EditWindowExpired,

    #[error("no recipient on outbox message {0}")]
    NoRecipient(i64),

    #[error("no transport configured for {0}")]
    NoTransport(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
