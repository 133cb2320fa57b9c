//! Saved remote-host records
//!
//! Hosts are persisted as pretty JSON at `~/.skiff/hosts.json`, written
//! atomically (temp file + rename) with owner-only permissions. A corrupt
//! file is backed up and replaced with an empty store instead of blocking
//! startup.

use std::path::PathBuf;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::{config_dir, StorageError};

/// A saved SSH host configuration.
///
/// At most one of `password`, `private_key_path` (deprecated) and
/// `private_key_encrypted` is populated. The encrypted key blob is
/// `nonce(12) ‖ ciphertext ‖ tag(16)` (see [`crate::config::crypto`]),
/// with the derivation salt stored in `key_encryption_salt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEntry {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Deprecated: path to an on-disk key file, kept for old records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,

    #[serde(default, with = "b64_option", skip_serializing_if = "Option::is_none")]
    pub private_key_encrypted: Option<Vec<u8>>,

    #[serde(default, with = "b64_option", skip_serializing_if = "Option::is_none")]
    pub key_encryption_salt: Option<Vec<u8>>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl HostEntry {
    pub fn new(name: &str, host: &str, port: u16, username: &str) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: format!("{}@{}:{}", username, host, port),
            name: name.to_string(),
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: None,
            private_key_path: None,
            private_key_encrypted: None,
            key_encryption_salt: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach an encrypted private key, clearing the other credential fields
    pub fn set_encrypted_key(&mut self, blob: Vec<u8>, salt: Vec<u8>) {
        self.password = None;
        self.private_key_path = None;
        self.private_key_encrypted = Some(blob);
        self.key_encryption_salt = Some(salt);
        self.updated_at = Utc::now().timestamp();
    }
}

/// On-disk host store
pub struct HostStore {
    hosts: RwLock<Vec<HostEntry>>,
    path: PathBuf,
}

impl HostStore {
    /// Open the store at the default location
    pub async fn open_default() -> Result<Self, StorageError> {
        Ok(Self::with_path(config_dir()?.join("hosts.json")).await)
    }

    /// Open the store at a custom path (used by tests)
    pub async fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(Vec::new()),
            path,
        };
        store.load().await;
        store
    }

    async fn load(&self) {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("Failed to read host store {:?}: {}", self.path, e);
                return;
            }
        };

        match serde_json::from_str::<Vec<HostEntry>>(&contents) {
            Ok(hosts) => {
                info!("Loaded {} saved hosts", hosts.len());
                *self.hosts.write() = hosts;
            }
            Err(e) => {
                warn!("Host store corrupted: {}", e);
                let backup = self.path.with_extension(format!(
                    "json.backup.{}",
                    Utc::now().format("%Y%m%d_%H%M%S")
                ));
                match fs::copy(&self.path, &backup).await {
                    Ok(_) => warn!("Corrupted host store backed up to {:?}", backup),
                    Err(e) => warn!("Failed to back up corrupted host store: {}", e),
                }
            }
        }
    }

    async fn save(&self) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(&*self.hosts.read())?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600));
        }

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub fn list(&self) -> Vec<HostEntry> {
        self.hosts.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<HostEntry> {
        self.hosts
            .read()
            .iter()
            .find(|h| h.name == name || h.id == name)
            .cloned()
    }

    /// Add or replace a host by name
    pub async fn upsert(&self, entry: HostEntry) -> Result<(), StorageError> {
        {
            let mut hosts = self.hosts.write();
            match hosts.iter_mut().find(|h| h.name == entry.name) {
                Some(existing) => *existing = entry,
                None => hosts.push(entry),
            }
        }
        self.save().await
    }

    pub async fn remove(&self, name: &str) -> Result<(), StorageError> {
        {
            let mut hosts = self.hosts.write();
            let before = hosts.len();
            hosts.retain(|h| h.name != name && h.id != name);
            if hosts.len() == before {
                return Err(StorageError::HostNotFound(name.to_string()));
            }
        }
        self.save().await
    }
}

/// Serde adapter: Option<Vec<u8>> as a base64 string
mod b64_option {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&BASE64.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt: Option<String> = Option::deserialize(d)?;
        opt.map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_upsert_and_reload() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("hosts.json");

        let store = HostStore::with_path(path.clone()).await;
        let mut entry = HostEntry::new("web", "web.example.com", 22, "deploy");
        entry.set_encrypted_key(vec![1, 2, 3, 4], vec![9; 32]);
        store.upsert(entry).await.unwrap();

        let reloaded = HostStore::with_path(path).await;
        let got = reloaded.get("web").unwrap();
        assert_eq!(got.host, "web.example.com");
        assert_eq!(got.private_key_encrypted.as_deref(), Some(&[1, 2, 3, 4][..]));
        assert_eq!(got.key_encryption_salt.as_deref().map(|s| s.len()), Some(32));
        assert!(got.password.is_none());
    }

    #[tokio::test]
    async fn test_remove_missing_host() {
        let temp = tempdir().unwrap();
        let store = HostStore::with_path(temp.path().join("hosts.json")).await;

        let result = store.remove("nope").await;
        assert!(matches!(result, Err(StorageError::HostNotFound(_))));
    }

    #[tokio::test]
    async fn test_corrupted_file_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("hosts.json");
        fs::write(&path, "{not json").await.unwrap();

        let store = HostStore::with_path(path).await;
        assert!(store.list().is_empty());

        let backups: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .collect();
        assert_eq!(backups.len(), 1);
    }
}
