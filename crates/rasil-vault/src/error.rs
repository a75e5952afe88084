use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;
