//! Encryption layer using ChaCha20-Poly1305 AEAD
//!
//! Provides symmetric encryption for document payloads using the
//! ChaCha20-Poly1305 authenticated encryption cipher. Each document has
//! its own encryption key; the relay only ever sees ciphertext.

use crate::error::SyncError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Encryption utilities for document payloads using ChaCha20-Poly1305 AEAD.
///
/// Holds a cipher instance initialized with one document's symmetric key.
/// The envelope layer stores the nonce next to the ciphertext, so only the
/// explicit-nonce methods are exposed; a fresh random nonce per message
/// keeps (key, nonce) pairs unique.
///
/// # Example
///
/// ```
/// use quillsync_core::crypto::DocumentCrypto;
///
/// let key = DocumentCrypto::generate_key();
/// let crypto = DocumentCrypto::new(&key);
/// let nonce = DocumentCrypto::generate_nonce();
///
/// let ciphertext = crypto.encrypt_with_nonce(b"chapter draft", &nonce).unwrap();
/// let plaintext = crypto.decrypt_with_nonce(&ciphertext, &nonce).unwrap();
///
/// assert_eq!(plaintext, b"chapter draft");
/// ```
pub struct DocumentCrypto {
    cipher: ChaCha20Poly1305,
}

impl DocumentCrypto {
    /// Create a new DocumentCrypto instance with the given 32-byte key.
    ///
    /// # Arguments
    ///
    /// * `key` - A 32-byte symmetric key
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte encryption key.
    ///
    /// Uses the system's cryptographically secure random number generator.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt data with a fresh random nonce prepended to the output.
    ///
    /// Format: `[nonce (12 bytes)] + [ciphertext + tag]`. Used for
    /// payloads that carry no envelope (presence hints).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SyncError> {
        let nonce = Self::generate_nonce();
        let ciphertext = self.encrypt_with_nonce(plaintext, &nonce)?;
        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data with a prepended nonce.
    ///
    /// Expects format: `[nonce (12 bytes)] + [ciphertext + tag]`
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SyncError> {
        if data.len() < NONCE_SIZE {
            return Err(SyncError::Crypto(
                "Data too short to contain nonce".to_string(),
            ));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[..NONCE_SIZE]);
        self.decrypt_with_nonce(&data[NONCE_SIZE..], &nonce)
    }

    /// Encrypt data using a provided nonce.
    ///
    /// The nonce is NOT prepended to the output; the caller stores it
    /// separately (the envelope carries it as its own field).
    ///
    /// # Arguments
    ///
    /// * `plaintext` - The data to encrypt
    /// * `nonce` - A 12-byte nonce (must be unique per key)
    ///
    /// # Returns
    ///
    /// The ciphertext with authentication tag appended.
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, SyncError> {
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))
    }

    /// Decrypt data using a provided nonce.
    ///
    /// # Arguments
    ///
    /// * `ciphertext` - The encrypted data with authentication tag
    /// * `nonce` - The 12-byte nonce used for encryption
    ///
    /// # Returns
    ///
    /// The decrypted plaintext, or [`SyncError::DecryptionFailed`] if the
    /// key is wrong or the data was tampered with.
    pub fn decrypt_with_nonce(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, SyncError> {
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| SyncError::DecryptionFailed(format!("{}", e)))
    }
}
