//! Pluggable transfer engines
//!
//! Two ways of moving bytes: a native streaming copy through the SFTP
//! client, and an external rsync subprocess re-using the same credentials.
//! Selection happens once per task and is fixed for its lifetime.

pub mod external;
pub mod native;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::control::CancelToken;
use super::error::TransferError;
use super::session::RemoteFs;
use super::types::TaskKind;
use crate::config::Settings;
use crate::ssh::SshConfig;

pub use external::RsyncEngine;
pub use native::NativeEngine;

/// Progress emitted by an engine during one file (or, for the external
/// engine, one whole-directory) transfer.
#[derive(Debug, Clone, Copy)]
pub enum ProgressEvent<'a> {
    /// Bytes just moved by the native byte-counting copy loop
    Bytes(u64),
    /// One line of external-engine output, with anything the engine could
    /// parse out of it
    Line {
        line: &'a str,
        speed: Option<f64>,
        percent: Option<u8>,
    },
}

/// Engine progress callback; returning an error aborts the transfer
pub type ProgressFn<'a> = dyn Fn(ProgressEvent<'_>) -> Result<(), TransferError> + Send + Sync + 'a;

/// The mechanism actually moving bytes for one task
pub enum TransferEngine {
    Native(NativeEngine),
    External(RsyncEngine),
}

impl TransferEngine {
    /// Pick the engine for a task.
    ///
    /// External is only worth its subprocess overhead for directory
    /// transfers, and only when enabled and actually installed; a missing
    /// binary degrades to native with a once-per-process warning.
    pub fn select(
        settings: &Settings,
        kind: TaskKind,
        remote: Arc<dyn RemoteFs>,
        ssh_config: &SshConfig,
    ) -> Self {
        if !settings.disable_rsync && kind.is_directory() {
            if let Some(path) = find_executable("rsync") {
                info!("Selecting rsync engine ({})", path.display());
                return TransferEngine::External(RsyncEngine::new(ssh_config.clone()));
            }
            static MISSING_WARNED: std::sync::Once = std::sync::Once::new();
            MISSING_WARNED.call_once(|| {
                warn!("rsync enabled but not found in PATH, falling back to native engine");
            });
        } else if settings.disable_rsync {
            debug!("rsync disabled in settings, using native engine");
        }

        TransferEngine::Native(NativeEngine::new(remote))
    }

    pub fn is_external(&self) -> bool {
        matches!(self, TransferEngine::External(_))
    }

    pub async fn upload_file(
        &self,
        token: &CancelToken,
        local_path: &str,
        remote_path: &str,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<(), TransferError> {
        match self {
            TransferEngine::Native(engine) => {
                engine.upload_file(token, local_path, remote_path, progress).await
            }
            TransferEngine::External(engine) => {
                engine.upload(token, local_path, remote_path, progress).await
            }
        }
    }

    pub async fn download_file(
        &self,
        token: &CancelToken,
        remote_path: &str,
        local_path: &str,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<(), TransferError> {
        match self {
            TransferEngine::Native(engine) => {
                engine.download_file(token, remote_path, local_path, progress).await
            }
            TransferEngine::External(engine) => {
                engine.download(token, remote_path, local_path, progress).await
            }
        }
    }
}

/// Locate an executable on PATH
fn find_executable(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{}.exe", name));
            if exe.is_file() {
                return Some(exe);
            }
        }
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::testfs::MemRemoteFs;

    #[test]
    fn test_single_file_tasks_stay_native() {
        let settings = Settings::default();
        let remote: Arc<dyn RemoteFs> = Arc::new(MemRemoteFs::new());

        let engine = TransferEngine::select(
            &settings,
            TaskKind::UploadFile,
            remote.clone(),
            &SshConfig::default(),
        );
        assert!(!engine.is_external());

        let engine = TransferEngine::select(
            &settings,
            TaskKind::DownloadFile,
            remote,
            &SshConfig::default(),
        );
        assert!(!engine.is_external());
    }

    #[test]
    fn test_disable_rsync_forces_native() {
        let settings = Settings {
            disable_rsync: true,
            ..Default::default()
        };
        let remote: Arc<dyn RemoteFs> = Arc::new(MemRemoteFs::new());

        let engine =
            TransferEngine::select(&settings, TaskKind::UploadDir, remote, &SshConfig::default());
        assert!(!engine.is_external());
    }
}
