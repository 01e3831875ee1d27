//! Reversible protection for end-user provider keys
//!
//! Browsers send their own API key encrypted; the relay only ever needs the
//! plaintext for the duration of one upstream call. [`KeyCipher`] is the seam,
//! with an AES-256-GCM implementation keyed by a shared secret and a
//! passthrough used when no secret is configured.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

/// Errors from encrypting or decrypting a credential
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Ciphertext is not valid base64 or is too short
    #[error("invalid ciphertext encoding: {0}")]
    InvalidEncoding(String),

    /// Authentication failed or the plaintext is not UTF-8
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),
}

/// Reversible transform protecting a credential in transit
pub trait KeyCipher: Send + Sync {
    fn encrypt(&self, plain_text: &str) -> Result<String, CryptoError>;

    fn decrypt(&self, cipher_text: &str) -> Result<String, CryptoError>;
}

/// AES-256-GCM with a key derived from a shared secret (SHA-256)
///
/// Output is `base64(nonce || ciphertext)`.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }
}

impl KeyCipher for AesGcmCipher {
    fn encrypt(&self, plain_text: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plain_text.as_bytes())
            .map_err(|e| CryptoError::InvalidCiphertext(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    fn decrypt(&self, cipher_text: &str) -> Result<String, CryptoError> {
        let raw = STANDARD
            .decode(cipher_text.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::InvalidEncoding(format!(
                "expected more than {NONCE_LEN} bytes, got {}",
                raw.len()
            )));
        }

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| CryptoError::InvalidCiphertext(e.to_string()))?;

        String::from_utf8(plain).map_err(|e| CryptoError::InvalidCiphertext(e.to_string()))
    }
}

/// Identity transform for deployments that do not encrypt client keys
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCipher;

impl KeyCipher for PassthroughCipher {
    fn encrypt(&self, plain_text: &str) -> Result<String, CryptoError> {
        Ok(plain_text.to_string())
    }

    fn decrypt(&self, cipher_text: &str) -> Result<String, CryptoError> {
        Ok(cipher_text.to_string())
    }
}

/// Pick the cipher for an optional shared secret
pub fn cipher_for(secret: Option<&str>) -> Box<dyn KeyCipher> {
    match secret.filter(|s| !s.trim().is_empty()) {
        Some(secret) => Box::new(AesGcmCipher::new(secret)),
        None => Box::new(PassthroughCipher),
    }
}
