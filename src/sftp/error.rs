//! Transfer error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Remote path not found: {0}")]
    RemoteMissing(String),

    #[error("Remote permission denied: {0}")]
    RemotePermission(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Task queue full")]
    QueueFull,

    #[error("External engine failed: {0}")]
    External(String),

    #[error("Scan failed: {0}")]
    Scan(String),
}

impl TransferError {
    /// Cancellation is structurally distinct from failure: tasks that end
    /// with it report `Cancelled`, not `Failed`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

impl From<crate::ssh::SshError> for TransferError {
    fn from(err: crate::ssh::SshError) -> Self {
        TransferError::Channel(err.to_string())
    }
}
