//! Transfer data types

use serde::{Deserialize, Serialize};

/// What a task moves and in which direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    UploadFile,
    UploadDir,
    DownloadFile,
    DownloadDir,
}

impl TaskKind {
    pub fn is_upload(&self) -> bool {
        matches!(self, TaskKind::UploadFile | TaskKind::UploadDir)
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, TaskKind::UploadDir | TaskKind::DownloadDir)
    }
}

/// Task lifecycle state.
///
/// Monotone Pending → Scanning → Transferring → terminal, except that
/// Cancelled may pre-empt any of the first three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Scanning,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

/// A single filesystem-level operation derived from a task during scanning.
///
/// For any non-root job its parent directory job appears earlier in the
/// scanned sequence; the task queue additionally runs all directory jobs
/// before any file job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileJob {
    /// Path relative to the transfer root's parent
    pub rel_path: String,
    /// Absolute source path
    pub source: String,
    /// Absolute destination path
    pub dest: String,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Directory job: "ensure this directory exists at dest"
    pub is_dir: bool,
}

/// An immutable progress snapshot published to the consumer.
///
/// Snapshots for one task are observed in state order; incremental ones
/// may be dropped under backpressure, terminal ones never are. For
/// external-engine directory tasks `total_bytes` stays 0 and
/// `current_speed`/`percentage` come from parsed rsync output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: u64,
    pub state: TaskState,
    pub total_files: u64,
    pub completed_files: u64,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    /// Bytes per second over a ~1s sliding window
    pub current_speed: f64,
    /// Floored integer 0-100; 0 when the total is unknown
    pub percentage: u8,
    /// Most recent engine output line
    pub last_log: String,
    /// Error message, set only on Failed terminal snapshots
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_predicates() {
        assert!(TaskKind::UploadDir.is_upload());
        assert!(TaskKind::UploadDir.is_directory());
        assert!(!TaskKind::DownloadFile.is_upload());
        assert!(!TaskKind::DownloadFile.is_directory());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::Pending.is_live());
        assert!(TaskState::Scanning.is_live());
        assert!(TaskState::Transferring.is_live());
    }
}
