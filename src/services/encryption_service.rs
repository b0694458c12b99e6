use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_SIZE: usize = 12; // AES-GCM standard nonce size

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("Encryption secret must not be empty")]
    EmptySecret,
}

/// Symmetric encryption for stored platform tokens.
///
/// Uses AES-256-GCM. Ciphertexts are hex strings of `nonce || ciphertext`, so they fit
/// in a plain text column.
#[derive(Clone)]
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Derives the 32-byte key from the process-wide secret.
    ///
    /// A 64-character hex string is used as the raw key; anything else is hashed with
    /// SHA-256. The derivation is deterministic, so the same secret always opens the
    /// same ciphertexts.
    pub fn from_secret(secret: &str) -> Result<Self, VaultError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(VaultError::EmptySecret);
        }

        let key: [u8; 32] = match hex::decode(secret) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                key
            }
            _ => Sha256::digest(secret.as_bytes()).into(),
        };

        Ok(Self {
            cipher: Aes256Gcm::new(&key.into()),
        })
    }

    pub fn encrypt(&self, plain_text: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng); // must be unique per encryption
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain_text.as_bytes())
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(hex::encode(result))
    }

    pub fn decrypt(&self, cipher_hex: &str) -> Result<String, VaultError> {
        let encrypted_data = hex::decode(cipher_hex)
            .map_err(|e| VaultError::DecryptionFailed(format!("Invalid hex ciphertext: {e}")))?;
        if encrypted_data.len() < NONCE_SIZE {
            return Err(VaultError::DecryptionFailed(
                "Ciphertext is too short to contain a nonce".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = encrypted_data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let decrypted_bytes = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| VaultError::DecryptionFailed(e.to_string()))?;

        String::from_utf8(decrypted_bytes)
            .map_err(|e| VaultError::DecryptionFailed(format!("Invalid UTF-8 sequence: {e}")))
    }
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionService { .. }")
    }
}
