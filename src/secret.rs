//! Secret encoding for credentials and proxy passwords at rest.
//!
//! Components never hold a global codec; callers pass an `Arc<dyn SecretCodec>`
//! to whatever needs to read a stored secret.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

pub const AES_GCM_KEY_LEN: usize = 32;
const AES_GCM_NONCE_LEN: usize = 12;
const AES_GCM_TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("failed to decode secret: {0}")]
    Decode(String),
    #[error("failed to encrypt secret: {0}")]
    Encrypt(String),
    #[error("encryption key must be {AES_GCM_KEY_LEN} bytes, got {len}")]
    InvalidKey { len: usize },
}

pub trait SecretCodec: Send + Sync {
    fn encode(&self, plaintext: &str) -> Result<String, SecretError>;
    fn decode(&self, stored: &str) -> Result<String, SecretError>;
}

pub type SharedSecretCodec = Arc<dyn SecretCodec>;

/// Stores secrets verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSecretCodec;

impl SecretCodec for PlainSecretCodec {
    fn encode(&self, plaintext: &str) -> Result<String, SecretError> {
        Ok(plaintext.to_string())
    }

    fn decode(&self, stored: &str) -> Result<String, SecretError> {
        Ok(stored.to_string())
    }
}

/// Base64 wrapping for directories that only need secrets kept out of plain sight.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64SecretCodec;

impl SecretCodec for Base64SecretCodec {
    fn encode(&self, plaintext: &str) -> Result<String, SecretError> {
        Ok(BASE64.encode(plaintext.as_bytes()))
    }

    fn decode(&self, stored: &str) -> Result<String, SecretError> {
        let bytes = BASE64
            .decode(stored.trim())
            .map_err(|err| SecretError::Decode(err.to_string()))?;
        String::from_utf8(bytes).map_err(|err| SecretError::Decode(err.to_string()))
    }
}

/// AES-256-GCM with a fresh random nonce per secret.
///
/// Stored form is `base64(nonce || ciphertext || tag)`. Anything that fails
/// authentication is rejected, never passed through.
pub struct AesGcmSecretCodec {
    cipher: Aes256Gcm,
}

impl AesGcmSecretCodec {
    pub fn new(key: &[u8]) -> Result<Self, SecretError> {
        if key.len() != AES_GCM_KEY_LEN {
            return Err(SecretError::InvalidKey { len: key.len() });
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| SecretError::InvalidKey { len: key.len() })?;
        Ok(Self { cipher })
    }
}

impl std::fmt::Debug for AesGcmSecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmSecretCodec")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SecretCodec for AesGcmSecretCodec {
    fn encode(&self, plaintext: &str) -> Result<String, SecretError> {
        let mut nonce = [0u8; AES_GCM_NONCE_LEN];
        getrandom::fill(&mut nonce).map_err(|err| SecretError::Encrypt(err.to_string()))?;
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt("aes-gcm seal failed".to_string()))?;

        let mut stored = Vec::with_capacity(AES_GCM_NONCE_LEN + sealed.len());
        stored.extend_from_slice(&nonce);
        stored.extend_from_slice(&sealed);
        Ok(BASE64.encode(stored))
    }

    fn decode(&self, stored: &str) -> Result<String, SecretError> {
        let bytes = BASE64
            .decode(stored.trim())
            .map_err(|err| SecretError::Decode(err.to_string()))?;
        if bytes.len() < AES_GCM_NONCE_LEN + AES_GCM_TAG_LEN {
            return Err(SecretError::Decode("ciphertext too short".to_string()));
        }
        let (nonce, sealed) = bytes.split_at(AES_GCM_NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SecretError::Decode("authentication failed".to_string()))?;
        String::from_utf8(plaintext).map_err(|err| SecretError::Decode(err.to_string()))
    }
}

pub fn plain_codec() -> SharedSecretCodec {
    Arc::new(PlainSecretCodec)
}
