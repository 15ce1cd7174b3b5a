//! Symmetric encryption of token material at rest.
//!
//! Tokens are encrypted with AES-256-GCM. The 256-bit key is the SHA-256
//! digest of the configured encryption key string, and every call to
//! [`Cipher::encrypt`] draws a fresh random 96-bit IV. The stored form is
//! `hex(iv):hex(ciphertext || tag)`.
//!
//! # Example
//!
//! ```
//! use castkeeper_core::cipher::Cipher;
//!
//! let cipher = Cipher::new("correct horse battery staple").unwrap();
//! let sealed = cipher.encrypt("ya29.a0AfH6SM").unwrap();
//! assert_eq!(cipher.decrypt(&sealed).unwrap(), "ya29.a0AfH6SM");
//! ```

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of the IV in bytes (96 bits, standard for GCM).
const IV_SIZE: usize = 12;

/// Error type for cipher operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CipherError {
    /// No encryption key was configured.
    #[error("token encryption key is not configured")]
    MissingKey,

    /// The stored value is not of the `iv:cipher` shape.
    #[error("malformed encrypted token: {reason}")]
    MalformedToken { reason: String },

    /// The key is wrong or the data is corrupted.
    #[error("failed to decrypt token (wrong key or corrupted data)")]
    Decryption,

    /// Encryption itself failed.
    #[error("failed to encrypt token: {message}")]
    Encryption { message: String },
}

/// AES-256-GCM cipher keyed from the configured encryption key.
#[derive(Clone)]
pub struct Cipher {
    aead: Aes256Gcm,
}

impl Cipher {
    /// Derive a cipher from the configured key string.
    ///
    /// An empty (or whitespace-only) key is rejected with
    /// [`CipherError::MissingKey`] instead of being silently defaulted.
    pub fn new(key: &str) -> Result<Self, CipherError> {
        if key.trim().is_empty() {
            return Err(CipherError::MissingKey);
        }

        let digest = Sha256::digest(key.as_bytes());
        let aead = Aes256Gcm::new_from_slice(&digest).map_err(|e| CipherError::Encryption {
            message: e.to_string(),
        })?;

        Ok(Self { aead })
    }

    /// Encrypt `plaintext`, returning `ivHex:cipherHex`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let iv = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext =
            self.aead
                .encrypt(&iv, plaintext.as_bytes())
                .map_err(|e| CipherError::Encryption {
                    message: e.to_string(),
                })?;

        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    /// Decrypt a value produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, sealed: &str) -> Result<String, CipherError> {
        let (iv_hex, cipher_hex) = sealed
            .split_once(':')
            .ok_or_else(|| CipherError::MalformedToken {
                reason: "expected iv:cipher".to_string(),
            })?;

        if iv_hex.is_empty() || cipher_hex.is_empty() {
            return Err(CipherError::MalformedToken {
                reason: "empty iv or cipher segment".to_string(),
            });
        }

        let iv = hex::decode(iv_hex).map_err(|e| CipherError::MalformedToken {
            reason: format!("iv is not hex: {}", e),
        })?;
        if iv.len() != IV_SIZE {
            return Err(CipherError::MalformedToken {
                reason: format!("expected {}-byte iv, got {}", IV_SIZE, iv.len()),
            });
        }

        let ciphertext = hex::decode(cipher_hex).map_err(|e| CipherError::MalformedToken {
            reason: format!("cipher is not hex: {}", e),
        })?;

        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
            .map_err(|_| CipherError::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| CipherError::Decryption)
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}
