//! Encryption of customer provider keys at rest.
//!
//! Each encryption derives a fresh AEAD key from the process-wide master
//! secret via PBKDF2-HMAC-SHA256 over a random per-encryption salt, then
//! seals the plaintext with AES-256-GCM. What lands in storage is
//! `base64(salt || ciphertext || tag)` plus the base64 nonce, so a leaked
//! database row is useless without the master secret.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// PBKDF2 iteration count for key derivation.
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Per-encryption salt length in bytes.
const SALT_LEN: usize = 16;
/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("master encryption secret is not configured")]
    Config,

    #[error("ciphertext failed to decrypt")]
    Decrypt,

    #[error("stored key material is malformed: {0}")]
    Malformed(String),
}

/// Sealed provider-key material as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedKey {
    /// Base64 of `salt || ciphertext || tag`.
    pub encrypted_key: String,
    /// Base64 of the nonce.
    pub iv: String,
}

/// Authenticated encryption of provider secrets under a master secret.
pub struct Vault {
    master_secret: Vec<u8>,
}

impl Vault {
    /// Build a vault from the injected master secret. Fails with
    /// [`VaultError::Config`] when the secret is absent or empty.
    pub fn new(master_secret: Option<&str>) -> Result<Self, VaultError> {
        match master_secret {
            Some(secret) if !secret.is_empty() => Ok(Self {
                master_secret: secret.as_bytes().to_vec(),
            }),
            _ => Err(VaultError::Config),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> Key<Aes256Gcm> {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(&self.master_secret, salt, PBKDF2_ITERATIONS, &mut key);
        key.into()
    }

    /// Encrypt a provider secret, producing fresh salt and nonce from the
    /// process CSPRNG.
    pub fn encrypt(&self, plaintext: &str) -> Result<SealedKey, VaultError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(&key);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // aes-gcm appends the 16-byte tag to the ciphertext.
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Decrypt)?;

        let mut blob = Vec::with_capacity(SALT_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&ciphertext);

        Ok(SealedKey {
            encrypted_key: BASE64.encode(blob),
            iv: BASE64.encode(nonce_bytes),
        })
    }

    /// Decrypt sealed key material. Any tampering or a wrong master secret
    /// fails tag verification and returns [`VaultError::Decrypt`].
    pub fn decrypt(&self, sealed: &SealedKey) -> Result<String, VaultError> {
        let blob = BASE64
            .decode(&sealed.encrypted_key)
            .map_err(|e| VaultError::Malformed(e.to_string()))?;
        if blob.len() <= SALT_LEN {
            return Err(VaultError::Malformed("ciphertext too short".to_string()));
        }
        let nonce_bytes = BASE64
            .decode(&sealed.iv)
            .map_err(|e| VaultError::Malformed(e.to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(VaultError::Malformed("bad nonce length".to_string()));
        }

        let (salt, ciphertext) = blob.split_at(SALT_LEN);
        let key = self.derive_key(salt);
        let cipher = Aes256Gcm::new(&key);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|e| VaultError::Malformed(e.to_string()))
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the master secret.
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}
