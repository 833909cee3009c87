//! AES-GCM encryption for secrets persisted at rest (instance API keys, platform configs).
//!
//! A single master key, resolved once at startup from `AppConfig` (env, file, or CLI flag),
//! backs every encrypt/decrypt call in the process. Ciphertext is stored as `nonce || tag ||
//! data` so each encrypted blob is self-describing and the key never needs to be persisted
//! alongside it.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use thiserror::Error;

/// Failures from encrypting or decrypting a secret field.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The master key was not exactly 32 bytes.
    #[error("master key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    /// Encryption failed (should not happen for a well-formed key).
    #[error("encryption failed")]
    EncryptFailed,
    /// Decryption failed: wrong key, corrupted ciphertext, or truncated input.
    #[error("decryption failed")]
    DecryptFailed,
}

const NONCE_LEN: usize = 12;

/// Holds the process-wide master key and performs AEAD encrypt/decrypt of secret fields.
#[derive(Clone)]
pub struct MasterKey {
    cipher: Aes256Gcm,
}

impl MasterKey {
    /// Builds a master key from exactly 32 raw bytes.
    ///
    /// # Errors
    /// Returns [`CryptoError::InvalidKeyLength`] if `bytes` is not 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        let key = Key::<Aes256Gcm>::from_slice(bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Derives a 32-byte key by SHA-256-hashing an arbitrary-length passphrase. Used when the
    /// operator supplies a human-chosen master key rather than raw key material.
    #[must_use]
    pub fn from_passphrase(passphrase: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let digest = hasher.finalize();
        Self::from_bytes(&digest).expect("SHA-256 digest is always 32 bytes")
    }

    /// Encrypts `plaintext`, returning `nonce || ciphertext`.
    ///
    /// # Errors
    /// Returns [`CryptoError::EncryptFailed`] if the underlying AEAD operation fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut out = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;
        let mut sealed = nonce.to_vec();
        sealed.append(&mut out);
        Ok(sealed)
    }

    /// Decrypts a blob produced by [`MasterKey::encrypt`].
    ///
    /// # Errors
    /// Returns [`CryptoError::DecryptFailed`] if the blob is too short, the key is wrong, or
    /// the ciphertext has been tampered with.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::DecryptFailed);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// Convenience wrapper for encrypting UTF-8 strings (API keys, JSON config blobs).
    ///
    /// # Errors
    /// See [`MasterKey::encrypt`].
    pub fn encrypt_str(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Convenience wrapper for decrypting back to a UTF-8 string.
    ///
    /// # Errors
    /// Returns [`CryptoError::DecryptFailed`] if decryption fails or the plaintext is not
    /// valid UTF-8.
    pub fn decrypt_str(&self, sealed: &[u8]) -> Result<String, CryptoError> {
        let bytes = self.decrypt(sealed)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_secret() {
        let key = MasterKey::from_passphrase("correct horse battery staple");
        let sealed = key.encrypt_str("sk-agent-12345").unwrap();
        assert_ne!(sealed, b"sk-agent-12345");
        assert_eq!(key.decrypt_str(&sealed).unwrap(), "sk-agent-12345");
    }

    #[test]
    fn rejects_wrong_key() {
        let key_a = MasterKey::from_passphrase("key-a");
        let key_b = MasterKey::from_passphrase("key-b");
        let sealed = key_a.encrypt_str("secret").unwrap();
        assert!(key_b.decrypt_str(&sealed).is_err());
    }

    #[test]
    fn rejects_short_key() {
        let err = MasterKey::from_bytes(&[0u8; 16]).unwrap_err();
        assert_eq!(err, CryptoError::InvalidKeyLength(16));
    }
}
