use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// Unique-constraint violation on (license, channel, channel_message_id).
    /// Callers on the ingest path swallow this as "already ingested".
    #[error("duplicate row: {0}")]
    Duplicate(String),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("column {column}: expected {expected}, got {got}")]
    ColumnType {
        column: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("vault error: {0}")]
    Vault(#[from] rasil_vault::VaultError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
