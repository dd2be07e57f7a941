//! Content encryption
//!
//! Convergent scheme: the encryption key for a level is the hash of its
//! plaintext, so identical content encrypts to identical blocks and the key
//! travels inside the next level's metadata. AES-256-GCM with the random
//! nonce prepended to the ciphertext.

use crate::error::{Result, TesseraError};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};

/// AES-256 key length in bytes.
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_SIZE: usize = 12;

/// Derive the convergent encryption key for a plaintext.
pub fn derive_content_key(plaintext: &[u8]) -> [u8; KEY_SIZE] {
    *blake3::hash(plaintext).as_bytes()
}

/// Encrypt to `nonce || ciphertext`.
pub fn encrypt_to_bytes(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| TesseraError::Encryption(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| TesseraError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext` buffer.
pub fn decrypt_from_bytes(key: &[u8; KEY_SIZE], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE {
        return Err(TesseraError::Decryption(format!(
            "ciphertext too short: {} bytes",
            data.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| TesseraError::Decryption(e.to_string()))?;

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| TesseraError::Decryption(e.to_string()))
}
