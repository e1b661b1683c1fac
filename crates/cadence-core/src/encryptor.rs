// Authenticated encryption for the secure input vault
//
// Key model:
// 1. On first run, generate a random 32-byte salt next to the vault files
// 2. Derive an AES-256 key from the salt with Argon2id
// 3. Encrypt each entry with AES-256-GCM and a fresh 96-bit nonce
// 4. Store nonce + ciphertext (includes the 128-bit tag) base64-encoded

use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const KEY_CONTEXT: &[u8] = b"cadence-secure-inputs-v1";

/// One encrypted vault value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedEntry {
    pub nonce: String,
    pub ciphertext: String,
}

/// Vault backing cipher. Injected so tests can swap in a transparent
/// implementation.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEntry>;
    fn decrypt(&self, entry: &EncryptedEntry) -> Result<Vec<u8>>;
}

/// AES-256-GCM encryptor keyed from a machine-local salt file.
pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
}

impl AesGcmEncryptor {
    /// Load (or create on first use) the installation salt and derive the key.
    pub fn from_salt_file(path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let salt = match std::fs::read(&path) {
            Ok(bytes) if bytes.len() == SALT_LEN => bytes,
            Ok(_) => {
                return Err(CadenceError::Vault(format!(
                    "salt file {} is corrupt",
                    path.display()
                )))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut salt = vec![0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, &salt)?;
                salt
            }
            Err(err) => return Err(err.into()),
        };
        Self::from_salt(&salt)
    }

    pub fn from_salt(salt: &[u8]) -> Result<Self> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(KEY_CONTEXT, salt, &mut key)
            .map_err(|e| CadenceError::Vault(format!("key derivation failed: {e}")))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CadenceError::Vault(format!("bad key length: {e}")))?;
        Ok(Self { cipher })
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEntry> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CadenceError::Vault("encryption failed".to_string()))?;
        Ok(EncryptedEntry {
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    fn decrypt(&self, entry: &EncryptedEntry) -> Result<Vec<u8>> {
        let nonce_bytes = BASE64
            .decode(&entry.nonce)
            .map_err(|_| CadenceError::Vault("corrupt nonce encoding".to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CadenceError::Vault("corrupt nonce length".to_string()));
        }
        let ciphertext = BASE64
            .decode(&entry.ciphertext)
            .map_err(|_| CadenceError::Vault("corrupt ciphertext encoding".to_string()))?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CadenceError::Vault("decryption failed (tampered or wrong key)".to_string()))
    }
}
