//! AES-GCM encryption for stored credentials.
//!
//! Ciphertext layout is `nonce (12 bytes) || ciphertext+tag`. The credential
//! key is bound as associated data, so a sealed blob copied onto another
//! credential row fails to open.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;

use crate::error::{AppError, AppResult};

/// Nonce size for AES-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// Key size for AES-256 (256 bits / 32 bytes).
const KEY_SIZE: usize = 32;

/// Cipher for credential material.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Create a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(key_base64: &str) -> AppResult<Self> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .map_err(|e| AppError::Encryption(format!("Invalid base64 key: {}", e)))?;

        if key_bytes.len() != KEY_SIZE {
            return Err(AppError::Encryption(format!(
                "Invalid key length: expected {} bytes, got {}",
                KEY_SIZE,
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| AppError::Encryption(format!("Failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }

    /// Generate a new random key, base64 encoded.
    pub fn generate_key_base64() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill(&mut key[..]);
        BASE64.encode(key)
    }

    /// Encrypt credential data bound to `credential_key`.
    pub fn seal_json(&self, credential_key: &str, data: &serde_json::Value) -> AppResult<Vec<u8>> {
        let plaintext = serde_json::to_vec(data)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &plaintext,
                    aad: credential_key.as_bytes(),
                },
            )
            .map_err(|e| AppError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt credential data sealed for `credential_key`.
    pub fn open_json(&self, credential_key: &str, sealed: &[u8]) -> AppResult<serde_json::Value> {
        if sealed.len() < NONCE_SIZE {
            return Err(AppError::Encryption(
                "Ciphertext too short (missing nonce)".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: credential_key.as_bytes(),
                },
            )
            .map_err(|e| AppError::Encryption(format!("Decryption failed: {}", e)))?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::from_base64(&SecretCipher::generate_key_base64()).unwrap()
    }

    #[test]
    fn test_seal_open() {
        let cipher = cipher();
        let data = serde_json::json!({"username": "admin", "password": "secret123"});

        let sealed = cipher.seal_json("pg_prod", &data).unwrap();
        assert!(!String::from_utf8_lossy(&sealed).contains("secret123"));
        assert_eq!(cipher.open_json("pg_prod", &sealed).unwrap(), data);
    }

    #[test]
    fn test_open_with_other_key_name_fails() {
        let cipher = cipher();
        let sealed = cipher.seal_json("pg_prod", &serde_json::json!("x")).unwrap();
        assert!(cipher.open_json("pg_dev", &sealed).is_err());
    }

    #[test]
    fn test_invalid_keys() {
        assert!(SecretCipher::from_base64("not-valid-base64!!!").is_err());
        assert!(SecretCipher::from_base64(&BASE64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn test_tampered_data() {
        let cipher = cipher();
        let mut sealed = cipher.seal_json("k", &serde_json::json!({"a": 1})).unwrap();
        if let Some(byte) = sealed.last_mut() {
            *byte ^= 0xFF;
        }
        assert!(cipher.open_json("k", &sealed).is_err());
        assert!(cipher.open_json("k", &[1, 2, 3]).is_err());
    }
}
