//! Checksum and encryption collaborator
//!
//! Base-backup artifacts and WAL segments are checksummed in plaintext and
//! encrypted before leaving the process. The engines depend only on the
//! [`ArtifactCipher`] trait; [`ChaChaCipher`] is the default implementation
//! with a rotatable keyring.

use std::collections::HashMap;

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the encryption nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Magic bytes identifying an encrypted artifact
pub const ENCRYPTED_MAGIC: &[u8; 8] = b"WVLT_ENC";

/// Encryption format version
const FORMAT_VERSION: u8 = 1;

/// Crypto error
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Decryption failed (wrong key, corrupt ciphertext)
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// Referenced key id is not in the keyring
    #[error("Unknown key id: {0}")]
    UnknownKey(String),

    /// Ciphertext framing is not recognized
    #[error("Invalid ciphertext format: {0}")]
    InvalidFormat(String),
}

/// SHA-256 content checksum, hex-encoded.
///
/// Always computed over plaintext so that key rotation never invalidates
/// recorded checksums.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// An encryption key with zero-on-drop semantics
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Generate a new random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Checksum & encryption collaborator interface
pub trait ArtifactCipher: Send + Sync {
    /// Id of the key new artifacts are encrypted under
    fn active_key_id(&self) -> String;

    /// Encrypt plaintext under the given key id
    fn encrypt(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt ciphertext produced by [`encrypt`](Self::encrypt)
    fn decrypt(&self, ciphertext: &[u8], key_id: &str) -> Result<Vec<u8>, CryptoError>;

    /// Generate a new active key; previous keys remain available for
    /// decryption. Returns the new key id.
    fn rotate_key(&self) -> String;
}

/// ChaCha20-Poly1305 cipher with a rotatable in-memory keyring.
///
/// Ciphertext format:
/// - 8 bytes: magic header "WVLT_ENC"
/// - 1 byte: format version
/// - 12 bytes: nonce
/// - N bytes: ciphertext with authentication tag
pub struct ChaChaCipher {
    keys: RwLock<HashMap<String, EncryptionKey>>,
    active: RwLock<String>,
    generation: RwLock<u32>,
}

impl ChaChaCipher {
    /// Create a cipher with a freshly generated key
    pub fn new() -> Self {
        let key_id = "backup-key-v1".to_string();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), EncryptionKey::generate());
        Self {
            keys: RwLock::new(keys),
            active: RwLock::new(key_id),
            generation: RwLock::new(1),
        }
    }

    /// Create a cipher seeded with a specific key
    pub fn with_key(key_id: impl Into<String>, key: EncryptionKey) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), key);
        Self {
            keys: RwLock::new(keys),
            active: RwLock::new(key_id),
            generation: RwLock::new(1),
        }
    }
}

impl Default for ChaChaCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactCipher for ChaChaCipher {
    fn active_key_id(&self) -> String {
        self.active.read().clone()
    }

    fn encrypt(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>, CryptoError> {
        let keys = self.keys.read();
        let key = keys
            .get(key_id)
            .ok_or_else(|| CryptoError::UnknownKey(key_id.to_string()))?;

        let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut out = Vec::with_capacity(ENCRYPTED_MAGIC.len() + 1 + NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(ENCRYPTED_MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], key_id: &str) -> Result<Vec<u8>, CryptoError> {
        let header_len = ENCRYPTED_MAGIC.len() + 1 + NONCE_SIZE;
        if ciphertext.len() < header_len {
            return Err(CryptoError::InvalidFormat("ciphertext too short".to_string()));
        }
        if &ciphertext[..ENCRYPTED_MAGIC.len()] != ENCRYPTED_MAGIC {
            return Err(CryptoError::InvalidFormat("bad magic header".to_string()));
        }
        let version = ciphertext[ENCRYPTED_MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(CryptoError::InvalidFormat(format!(
                "unsupported format version {}",
                version
            )));
        }

        let keys = self.keys.read();
        let key = keys
            .get(key_id)
            .ok_or_else(|| CryptoError::UnknownKey(key_id.to_string()))?;

        let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
        let nonce = Nonce::from_slice(&ciphertext[ENCRYPTED_MAGIC.len() + 1..header_len]);

        cipher
            .decrypt(nonce, &ciphertext[header_len..])
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }

    fn rotate_key(&self) -> String {
        let mut generation = self.generation.write();
        *generation += 1;
        let key_id = format!("backup-key-v{}", *generation);

        self.keys
            .write()
            .insert(key_id.clone(), EncryptionKey::generate());
        *self.active.write() = key_id.clone();

        info!("Encryption key rotated, active key is now {}", key_id);
        key_id
    }
}
