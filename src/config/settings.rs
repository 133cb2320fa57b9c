//! Application settings
//!
//! A small JSON settings file beside the host store. The transfer queue
//! reads a snapshot of these at task start; see
//! [`crate::sftp::task_queue::TaskQueue::update_settings`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{config_dir, StorageError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Maximum tasks in Scanning/Transferring at once
    pub max_concurrent_tasks: usize,

    /// Disable the external rsync engine (always use the native SFTP path)
    pub disable_rsync: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            disable_rsync: false,
        }
    }
}

/// On-disk settings store
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn open_default() -> Result<Self, StorageError> {
        Ok(Self {
            path: config_dir()?.join("settings.json"),
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load settings, falling back to defaults when absent or unreadable
    pub async fn load(&self) -> Settings {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Settings file corrupted ({}), using defaults", e);
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }

    pub async fn save(&self, settings: &Settings) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(settings)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_defaults_when_missing() {
        let temp = tempdir().unwrap();
        let store = SettingsStore::with_path(temp.path().join("settings.json"));

        let settings = store.load().await;
        assert_eq!(settings.max_concurrent_tasks, 5);
        assert!(!settings.disable_rsync);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let store = SettingsStore::with_path(temp.path().join("settings.json"));

        let settings = Settings {
            max_concurrent_tasks: 2,
            disable_rsync: true,
        };
        store.save(&settings).await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.max_concurrent_tasks, 2);
        assert!(loaded.disable_rsync);
    }
}
