//! Saved-host credentials and application settings

pub mod crypto;
pub mod hosts;
pub mod settings;

use std::path::PathBuf;

pub use crypto::{decrypt_private_key, encrypt_private_key, CryptoError};
pub use hosts::{HostEntry, HostStore};
pub use settings::{Settings, SettingsStore};

/// Storage errors for the on-disk stores
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No such host: {0}")]
    HostNotFound(String),
}

/// Get the skiff configuration directory (`~/.skiff`)
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".skiff"))
        .ok_or(StorageError::NoConfigDir)
}
