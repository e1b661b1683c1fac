// Secure input vault
// Sensitive run inputs are persisted encrypted per pipeline, masked on every
// egress path, and merged back into runtime inputs just before dispatch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use cadence_types::MASK_SENTINEL;

use crate::encryptor::{EncryptedEntry, Encryptor};
use crate::error::{CadenceError, Result};
use crate::store::atomic_write;

/// Markers checked against the lowercase alphanumeric projection of an input
/// key, so `API-Key`, `apiKey`, and `api_key` all classify the same way.
const SENSITIVE_MARKERS: &[&str] = &[
    "password",
    "secret",
    "token",
    "apikey",
    "auth",
    "bearer",
    "credential",
    "privatekey",
];

/// Whether an input key should be stored encrypted and masked on egress.
pub fn is_sensitive_key(key: &str) -> bool {
    let projected: String = key
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    SENSITIVE_MARKERS.iter().any(|m| projected.contains(m))
}

/// Split out the sensitive subset of an input map.
pub fn pick_sensitive(inputs: &HashMap<String, String>) -> HashMap<String, String> {
    inputs
        .iter()
        .filter(|(k, _)| is_sensitive_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Replace the named keys with the mask sentinel.
pub fn mask(inputs: &HashMap<String, String>, keys: &[String]) -> HashMap<String, String> {
    inputs
        .iter()
        .map(|(k, v)| {
            if keys.iter().any(|m| m == k) {
                (k.clone(), MASK_SENTINEL.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

/// Merge secure values into runtime inputs. A secure value fills a missing,
/// empty, or masked runtime slot; an explicit runtime value wins otherwise.
pub fn merge(
    runtime: &HashMap<String, String>,
    secure: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = runtime.clone();
    for (key, value) in secure {
        let current = merged.get(key).map(String::as_str);
        match current {
            None => {
                merged.insert(key.clone(), value.clone());
            }
            Some(existing) if existing.is_empty() || existing == MASK_SENTINEL => {
                merged.insert(key.clone(), value.clone());
            }
            Some(_) => {}
        }
    }
    merged
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct VaultFile {
    version: u8,
    entries: HashMap<String, EncryptedEntry>,
}

/// Encrypted per-pipeline secure input storage under
/// `<state>/secure-inputs/<pipelineId>.enc`.
pub struct SecureInputVault {
    dir: PathBuf,
    encryptor: Arc<dyn Encryptor>,
    // File writes are read-modify-write; serialize them.
    write_lock: Mutex<()>,
}

impl SecureInputVault {
    pub fn new(dir: impl Into<PathBuf>, encryptor: Arc<dyn Encryptor>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            encryptor,
            write_lock: Mutex::new(()),
        })
    }

    fn file_path(&self, pipeline_id: &str) -> Result<PathBuf> {
        // Pipeline ids are UUIDs; refuse anything that could escape the dir.
        if pipeline_id.is_empty()
            || pipeline_id
                .chars()
                .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err(CadenceError::Vault(format!(
                "invalid pipeline id '{pipeline_id}'"
            )));
        }
        Ok(self.dir.join(format!("{pipeline_id}.enc")))
    }

    fn load(&self, pipeline_id: &str) -> Result<VaultFile> {
        let path = self.file_path(pipeline_id)?;
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(VaultFile {
                version: 1,
                entries: HashMap::new(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Decrypted secure inputs for a pipeline. Runtime-merge path only; every
    /// other consumer should use [`SecureInputVault::keys`] plus masking.
    pub async fn get(&self, pipeline_id: &str) -> Result<HashMap<String, String>> {
        let file = self.load(pipeline_id)?;
        let mut out = HashMap::with_capacity(file.entries.len());
        for (key, entry) in &file.entries {
            let plaintext = self.encryptor.decrypt(entry)?;
            let value = String::from_utf8(plaintext)
                .map_err(|_| CadenceError::Vault("stored value is not UTF-8".to_string()))?;
            out.insert(key.clone(), value);
        }
        Ok(out)
    }

    /// Stored key names without decrypting any values.
    pub async fn keys(&self, pipeline_id: &str) -> Result<Vec<String>> {
        let file = self.load(pipeline_id)?;
        let mut keys: Vec<String> = file.entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Insert or overwrite entries. Returns the sorted unique union of keys
    /// now stored for the pipeline.
    pub async fn upsert(
        &self,
        pipeline_id: &str,
        partial: &HashMap<String, String>,
    ) -> Result<Vec<String>> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(pipeline_id)?;
        for (key, value) in partial {
            let entry = self.encryptor.encrypt(value.as_bytes())?;
            file.entries.insert(key.clone(), entry);
        }
        let path = self.file_path(pipeline_id)?;
        atomic_write(&path, &serde_json::to_string_pretty(&file)?).await?;
        let mut keys: Vec<String> = file.entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Delete the named keys, or the whole record when `keys` is None.
    pub async fn delete(&self, pipeline_id: &str, keys: Option<&[String]>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.file_path(pipeline_id)?;
        match keys {
            None => {
                if let Err(err) = std::fs::remove_file(&path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        return Err(err.into());
                    }
                }
                Ok(())
            }
            Some(keys) => {
                let mut file = self.load(pipeline_id)?;
                for key in keys {
                    file.entries.remove(key);
                }
                if file.entries.is_empty() {
                    if let Err(err) = std::fs::remove_file(&path) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            return Err(err.into());
                        }
                    }
                } else {
                    atomic_write(&path, &serde_json::to_string_pretty(&file)?).await?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryptor::AesGcmEncryptor;

    fn vault(dir: &std::path::Path) -> SecureInputVault {
        let encryptor = Arc::new(AesGcmEncryptor::from_salt(&[9u8; 32]).unwrap());
        SecureInputVault::new(dir.join("secure-inputs"), encryptor).unwrap()
    }

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn classifier_matches_on_alphanumeric_projection() {
        for key in [
            "password",
            "API_KEY",
            "API-Key",
            "apiKey",
            "github_token",
            "BEARER",
            "ssh-private-key",
            "authHeader",
            "db_credential",
            "client_secret",
        ] {
            assert!(is_sensitive_key(key), "{key} should be sensitive");
        }
        for key in ["task", "branch", "environment", "notes"] {
            assert!(!is_sensitive_key(key), "{key} should not be sensitive");
        }
    }

    #[test]
    fn merge_fills_missing_and_masked_only() {
        let runtime = map(&[("API_KEY", ""), ("branch", "main"), ("DB_PASSWORD", "•••")]);
        let secure = map(&[("API_KEY", "sk-1"), ("DB_PASSWORD", "pg-pass"), ("EXTRA_TOKEN", "t")]);
        let merged = merge(&runtime, &secure);
        assert_eq!(merged.get("API_KEY").unwrap(), "sk-1");
        assert_eq!(merged.get("DB_PASSWORD").unwrap(), "pg-pass");
        assert_eq!(merged.get("EXTRA_TOKEN").unwrap(), "t");
        assert_eq!(merged.get("branch").unwrap(), "main");
    }

    #[test]
    fn mask_then_merge_round_trips() {
        let inputs = map(&[("branch", "main")]);
        let secure = map(&[("API_KEY", "sk-1")]);
        let merged = merge(&inputs, &secure);
        let secure_keys: Vec<String> = secure.keys().cloned().collect();
        let masked = mask(&merged, &secure_keys);
        assert_eq!(masked.get("API_KEY").unwrap(), MASK_SENTINEL);
        assert_eq!(merge(&masked, &secure), merged);
    }

    #[tokio::test]
    async fn upsert_returns_sorted_union_of_keys() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(dir.path());
        let first = vault.upsert("p1", &map(&[("B_TOKEN", "1")])).await.unwrap();
        assert_eq!(first, vec!["B_TOKEN"]);
        let second = vault
            .upsert("p1", &map(&[("A_SECRET", "2")]))
            .await
            .unwrap();
        assert_eq!(second, vec!["A_SECRET", "B_TOKEN"]);
    }

    #[tokio::test]
    async fn values_round_trip_encrypted_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(dir.path());
        vault
            .upsert("p1", &map(&[("API_KEY", "sk-live-1234")]))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(
            dir.path().join("secure-inputs").join("p1.enc"),
        )
        .unwrap();
        assert!(!raw.contains("sk-live-1234"));

        let loaded = vault.get("p1").await.unwrap();
        assert_eq!(loaded.get("API_KEY").unwrap(), "sk-live-1234");
    }

    #[tokio::test]
    async fn delete_removes_keys_then_file() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(dir.path());
        vault
            .upsert("p1", &map(&[("A_TOKEN", "1"), ("B_TOKEN", "2")]))
            .await
            .unwrap();
        vault
            .delete("p1", Some(&["A_TOKEN".to_string()]))
            .await
            .unwrap();
        assert_eq!(vault.keys("p1").await.unwrap(), vec!["B_TOKEN"]);
        vault.delete("p1", None).await.unwrap();
        assert!(vault.keys("p1").await.unwrap().is_empty());
    }

    #[test]
    fn path_traversal_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(dir.path());
        assert!(vault.file_path("../evil").is_err());
        assert!(vault.file_path("").is_err());
    }
}
