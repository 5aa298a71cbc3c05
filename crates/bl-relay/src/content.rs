//! Payload content hooks applied by the dispatcher before the HTTP call
//!
//! All hooks are synchronous and pure: payload in, payload (or a verdict) out.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Transform failed: {0}")]
    Transform(String),
}

/// Decides whether a payload is sent at all
pub trait Filter: Send + Sync {
    fn accept(&self, channel: &str, payload: &str) -> bool;
}

/// Rewrites a payload before it is sent
pub trait Transformer: Send + Sync {
    fn apply(&self, channel: &str, payload: String) -> Result<String, ContentError>;
}

/// Encrypts a payload with a channel key
pub trait Cipher: Send + Sync {
    fn encrypt(&self, payload: &str, key: &str) -> Result<String, ContentError>;
}

impl<F> Filter for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn accept(&self, channel: &str, payload: &str) -> bool {
        self(channel, payload)
    }
}

/// AES-256-GCM with a base64 32-byte key.
///
/// Output is base64 of `nonce (12 bytes) || ciphertext`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmCipher;

impl AesGcmCipher {
    pub fn new() -> Self {
        Self
    }

    fn cipher_for(key: &str) -> Result<Aes256Gcm, ContentError> {
        let key_bytes = BASE64
            .decode(key.trim())
            .map_err(|e| ContentError::InvalidKey(format!("Invalid base64 key: {}", e)))?;
        if key_bytes.len() != 32 {
            return Err(ContentError::InvalidKey(format!(
                "Key must be 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        Aes256Gcm::new_from_slice(&key_bytes).map_err(|e| ContentError::InvalidKey(e.to_string()))
    }

    /// Reverse of `encrypt`, for receivers and tests
    pub fn decrypt(&self, encoded: &str, key: &str) -> Result<String, ContentError> {
        let cipher = Self::cipher_for(key)?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| ContentError::Encryption(format!("Invalid base64 payload: {}", e)))?;
        if bytes.len() < NONCE_LEN {
            return Err(ContentError::Encryption("Payload shorter than nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| ContentError::Encryption(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| ContentError::Encryption(e.to_string()))
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, payload: &str, key: &str) -> Result<String, ContentError> {
        let cipher = Self::cipher_for(key)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, payload.as_bytes())
            .map_err(|e| ContentError::Encryption(e.to_string()))?;

        let mut output = nonce.to_vec();
        output.extend(ciphertext);
        Ok(BASE64.encode(output))
    }
}

/// Generate a new base64 AES-256 key
pub fn generate_key() -> String {
    BASE64.encode(Aes256Gcm::generate_key(&mut OsRng))
}
