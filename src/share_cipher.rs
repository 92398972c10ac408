//! Encryption at rest for key material
//!
//! Server key shares (`enc_tss_share`), node-held Shamir shares and stage
//! payloads are sealed with AES-256-GCM under a password-derived key. Every
//! seal draws a fresh salt and nonce; the envelope is a small JSON document.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("decryption error: {0}")]
    Decryption(String),
    #[error("unsupported envelope version {0}")]
    Version(u8),
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedEnvelope {
    version: u8,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Password-keyed AES-256-GCM sealer
#[derive(Clone)]
pub struct ShareCipher {
    password: String,
    domain: &'static str,
}

impl std::fmt::Debug for ShareCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareCipher").field("domain", &self.domain).finish_non_exhaustive()
    }
}

impl ShareCipher {
    /// `domain` separates keys derived for different stores from the same password
    pub fn new(password: impl Into<String>, domain: &'static str) -> Self {
        Self {
            password: password.into(),
            domain,
        }
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.password.as_bytes());
        hasher.update(salt);
        hasher.update(self.domain.as_bytes());
        hasher.finalize().into()
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        let mut salt = [0u8; 16];
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&salt);
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| CipherError::Encryption(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CipherError::Encryption(e.to_string()))?;

        let envelope = SealedEnvelope {
            version: ENVELOPE_VERSION,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, CipherError> {
        let envelope: SealedEnvelope = serde_json::from_str(sealed)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(CipherError::Version(envelope.version));
        }

        let salt = hex::decode(&envelope.salt).map_err(|e| CipherError::Decryption(e.to_string()))?;
        let nonce_bytes =
            hex::decode(&envelope.nonce).map_err(|e| CipherError::Decryption(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(CipherError::Decryption("nonce must be 12 bytes".to_string()));
        }
        let ciphertext =
            hex::decode(&envelope.ciphertext).map_err(|e| CipherError::Decryption(e.to_string()))?;

        let key = self.derive_key(&salt);
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| CipherError::Decryption(e.to_string()))?;
        // A wrong password surfaces here as an authentication failure
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CipherError::Decryption("authentication failed".to_string()))
    }

    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<String, CipherError> {
        let plaintext = serde_json::to_vec(value)?;
        self.seal(&plaintext)
    }

    pub fn open_json<T: DeserializeOwned>(&self, sealed: &str) -> Result<T, CipherError> {
        let plaintext = self.open(sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
