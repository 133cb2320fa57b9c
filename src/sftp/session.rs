//! SFTP session over an authenticated transport
//!
//! [`SftpSession`] wraps the russh SFTP client with the operations the
//! transfer pipeline needs. The pipeline itself only sees the [`RemoteFs`]
//! trait, so scanner/engine/task-queue tests can run against an in-memory
//! remote instead of a network.

use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpClientError;
use russh_sftp::client::SftpSession as RusshSftpSession;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::error::TransferError;
use super::path_utils::join_remote_path;
use crate::ssh::Transport;

/// Minimal metadata for one remote path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub is_dir: bool,
}

/// One entry of a remote directory listing
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// The remote-filesystem surface the transfer pipeline is written against.
///
/// Streams are plain `AsyncRead`/`AsyncWrite` objects so the native engine
/// can copy through them without knowing the backend. The implementation
/// must be safe to share across the jobs of one task (independent requests
/// are multiplexed over the one SFTP channel).
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn stat(&self, path: &str) -> Result<RemoteStat, TransferError>;

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransferError>;

    /// Create a directory and any missing parents
    async fn mkdir_all(&self, path: &str) -> Result<(), TransferError>;

    async fn open_read(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransferError>;

    /// Open for writing, creating or truncating the file
    async fn open_write(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransferError>;

    async fn remove_file(&self, path: &str) -> Result<(), TransferError>;
}

/// SFTP session wrapper
pub struct SftpSession {
    sftp: RusshSftpSession,
}

impl SftpSession {
    /// Open the SFTP subsystem on an authenticated transport
    pub async fn open(transport: &Transport) -> Result<Self, TransferError> {
        let channel = transport.open_subsystem("sftp").await?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransferError::Channel(e.to_string()))?;

        info!(
            "SFTP subsystem opened for {}@{}",
            transport.config().username,
            transport.config().host
        );

        Ok(Self { sftp })
    }

    /// Resolve `.`-relative and symlinked paths server-side
    pub async fn canonicalize(&self, path: &str) -> Result<String, TransferError> {
        self.sftp
            .canonicalize(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), TransferError> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| map_sftp_error(e, from))
    }

    /// Remove a directory tree bottom-up
    pub async fn remove_dir_all(&self, path: &str) -> Result<(), TransferError> {
        let entries = self.read_dir(path).await?;
        for entry in entries {
            let child = join_remote_path(path, &entry.name);
            if entry.is_dir {
                Box::pin(self.remove_dir_all(&child)).await?;
            } else {
                self.remove_file(&child).await?;
            }
        }
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }
}

#[async_trait]
impl RemoteFs for SftpSession {
    async fn stat(&self, path: &str) -> Result<RemoteStat, TransferError> {
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(RemoteStat {
            size: attrs.size.unwrap_or(0),
            is_dir: attrs.is_dir(),
        })
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransferError> {
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let metadata = entry.metadata();
            entries.push(RemoteEntry {
                name,
                size: metadata.size.unwrap_or(0),
                is_dir: metadata.is_dir(),
                is_symlink: metadata.is_symlink(),
            });
        }
        Ok(entries)
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), TransferError> {
        let mut current = if path.starts_with('/') {
            String::from("/")
        } else {
            String::new()
        };

        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = if current.is_empty() {
                component.to_string()
            } else {
                join_remote_path(&current, component)
            };
            match self.sftp.create_dir(&current).await {
                Ok(()) => debug!("Created remote directory {}", current),
                Err(e) => {
                    // Racing jobs and pre-existing parents both surface as
                    // an error here; only fail if the path is not a dir.
                    match self.sftp.metadata(&current).await {
                        Ok(attrs) if attrs.is_dir() => {}
                        _ => return Err(map_sftp_error(e, &current)),
                    }
                }
            }
        }
        Ok(())
    }

    async fn open_read(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransferError> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(Box::new(file))
    }

    async fn open_write(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransferError> {
        let file = self
            .sftp
            .create(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        Ok(Box::new(file))
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransferError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }
}

/// Map an SFTP status to the error kinds the UI can act on.
///
/// The client library folds server status codes into its error display,
/// so classification goes by message.
fn map_sftp_error(err: SftpClientError, path: &str) -> TransferError {
    let text = err.to_string();
    if text.contains("No such file") || text.contains("not found") {
        TransferError::RemoteMissing(path.to_string())
    } else if text.contains("Permission denied") {
        TransferError::RemotePermission(path.to_string())
    } else {
        TransferError::Protocol(format!("{}: {}", path, text))
    }
}
