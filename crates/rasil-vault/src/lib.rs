//! Symmetric credential encryption for per-license transport tokens and
//! session blobs.
//!
//! Key material comes from a process-wide secret: either a 44-char base64
//! string decoding to 32 raw bytes, or a passphrase run through
//! PBKDF2-HMAC-SHA256. Ciphertext format is base64url(nonce || aead-ct).
//! Records written before encryption was enabled are tolerated on read via
//! a plain base64 fallback.

mod error;

pub use error::{Result, VaultError};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::Sha256;
use tracing::warn;

const NONCE_LEN: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const PBKDF2_SALT: &[u8] = b"rasil_salt_2024";

/// Process-wide credential cipher. Cheap to clone (the key is 32 bytes).
#[derive(Clone)]
pub struct Vault {
    cipher: ChaCha20Poly1305,
}

impl Vault {
    /// Build from the configured secret. A 44-char base64 value is used as
    /// the raw key; anything else is treated as a passphrase and derived.
    pub fn from_secret(secret: &str) -> Result<Self> {
        let key_bytes = if secret.len() == 44 {
            match STANDARD.decode(secret) {
                Ok(raw) if raw.len() == 32 => raw,
                _ => derive_key(secret),
            }
        } else {
            derive_key(secret)
        };

        let key = Key::from_slice(&key_bytes);
        Ok(Self {
            cipher: ChaCha20Poly1305::new(key),
        })
    }

    /// Build with a random throwaway key. Records encrypted with it are
    /// unreadable after restart, so this is only acceptable in development.
    pub fn ephemeral() -> Self {
        warn!("ENCRYPTION_KEY not set — using an ephemeral key; credentials will not survive restart");
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        Self {
            cipher: ChaCha20Poly1305::new(&key),
        }
    }

    /// Encrypt to base64url(nonce || ciphertext). Empty input passes through.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ct = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;

        let mut buf = Vec::with_capacity(NONCE_LEN + ct.len());
        buf.extend_from_slice(&nonce);
        buf.extend_from_slice(&ct);
        Ok(URL_SAFE_NO_PAD.encode(buf))
    }

    /// Decrypt a value produced by [`Vault::encrypt`]. Empty input passes
    /// through; legacy plain-base64 records fall back to a straight decode.
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        if encrypted.is_empty() {
            return Ok(String::new());
        }

        if let Ok(buf) = URL_SAFE_NO_PAD.decode(encrypted) {
            if buf.len() > NONCE_LEN {
                let nonce = Nonce::from_slice(&buf[..NONCE_LEN]);
                if let Ok(pt) = self.cipher.decrypt(nonce, &buf[NONCE_LEN..]) {
                    return String::from_utf8(pt).map_err(|_| VaultError::Decrypt);
                }
            }
        }

        // Legacy fallback: records written before encryption was enabled
        // are plain base64 of the secret.
        match STANDARD.decode(encrypted) {
            Ok(raw) => String::from_utf8(raw).map_err(|_| VaultError::Decrypt),
            Err(_) => Err(VaultError::Decrypt),
        }
    }
}

fn derive_key(passphrase: &str) -> Vec<u8> {
    let mut key = vec![0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        PBKDF2_SALT,
        PBKDF2_ITERATIONS,
        &mut key,
    );
    key
}
