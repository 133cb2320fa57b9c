//! Directory scanning
//!
//! Explodes a local or remote tree into a flat job list with directories
//! ordered before their contents. Relative paths are computed against the
//! parent of the scan root so the top-level directory itself is re-created
//! under the destination root.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use super::control::CancelToken;
use super::error::TransferError;
use super::path_utils::{join_local_path, join_remote_path, remote_parent, to_slash};
use super::session::RemoteFs;
use super::types::FileJob;

/// Incremental "files found" callback, fired every
/// [`FOUND_REPORT_EVERY`] discovered entries
pub type FoundFn = Arc<dyn Fn(usize) + Send + Sync>;

pub const FOUND_REPORT_EVERY: usize = 100;

pub struct DirectoryScanner {
    remote: Arc<dyn RemoteFs>,
}

impl DirectoryScanner {
    pub fn new(remote: Arc<dyn RemoteFs>) -> Self {
        Self { remote }
    }

    /// Scan a local tree rooted at `root`, producing jobs whose
    /// destinations live under the remote `dest_root`.
    ///
    /// Symlinks to directories are skipped (recursing through them risks
    /// cycles and re-creating them as empty dirs helps nobody); symlinks
    /// to regular files are followed. Non-regular files are skipped with
    /// a log entry.
    pub async fn scan_local(
        &self,
        token: &CancelToken,
        root: &str,
        dest_root: &str,
        on_found: Option<FoundFn>,
    ) -> Result<(Vec<FileJob>, u64), TransferError> {
        let root = root.trim_end_matches(['/', '\\']).to_string();
        let dest_root = dest_root.to_string();
        let token = token.clone();

        tokio::fs::metadata(&root).await?;

        // walkdir is synchronous; run the walk off the async threads
        tokio::task::spawn_blocking(move || {
            let base = Path::new(&root)
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default();

            let mut jobs: Vec<FileJob> = Vec::new();
            let mut total_bytes: u64 = 0;

            for entry in walkdir::WalkDir::new(&root).follow_links(false) {
                token.check()?;

                let entry =
                    entry.map_err(|e| TransferError::Scan(format!("walk {}: {}", root, e)))?;
                let path = entry.path();

                let (size, is_dir) = if entry.file_type().is_symlink() {
                    // Follow the link to decide what it points at
                    match std::fs::metadata(path) {
                        Ok(target) if target.is_dir() => {
                            debug!("Skipping symlink to directory: {}", path.display());
                            continue;
                        }
                        Ok(target) if target.is_file() => (target.len(), false),
                        Ok(_) | Err(_) => {
                            debug!("Skipping broken or special symlink: {}", path.display());
                            continue;
                        }
                    }
                } else if entry.file_type().is_dir() {
                    (0, true)
                } else if entry.file_type().is_file() {
                    (
                        entry
                            .metadata()
                            .map_err(|e| TransferError::Scan(e.to_string()))?
                            .len(),
                        false,
                    )
                } else {
                    debug!("Skipping non-regular file: {}", path.display());
                    continue;
                };

                let rel = path
                    .strip_prefix(&base)
                    .map_err(|e| TransferError::Scan(e.to_string()))?
                    .to_string_lossy()
                    .to_string();

                jobs.push(FileJob {
                    dest: join_remote_path(&dest_root, &to_slash(&rel)),
                    source: path.to_string_lossy().to_string(),
                    rel_path: rel,
                    size,
                    is_dir,
                });

                if !is_dir {
                    total_bytes += size;
                }

                if let Some(ref on_found) = on_found {
                    if jobs.len() % FOUND_REPORT_EVERY == 0 {
                        on_found(jobs.len());
                    }
                }
            }

            Ok((jobs, total_bytes))
        })
        .await
        .map_err(|e| TransferError::Scan(format!("scan task panicked: {}", e)))?
    }

    /// Scan a remote tree rooted at `root`, producing jobs whose
    /// destinations live under the local `dest_root`.
    pub async fn scan_remote(
        &self,
        token: &CancelToken,
        root: &str,
        dest_root: &str,
        on_found: Option<FoundFn>,
    ) -> Result<(Vec<FileJob>, u64), TransferError> {
        let root = root.trim_end_matches('/');
        let root = if root.is_empty() { "/" } else { root };

        let root_stat = self.remote.stat(root).await?;
        if !root_stat.is_dir {
            return Err(TransferError::Scan(format!("{} is not a directory", root)));
        }

        let base = remote_parent(root);
        let mut jobs: Vec<FileJob> = Vec::new();
        let mut total_bytes: u64 = 0;

        let mut push_job = |src: String, size: u64, is_dir: bool| {
            let rel = src
                .strip_prefix(base.trim_end_matches('/'))
                .unwrap_or(&src)
                .trim_start_matches('/')
                .to_string();
            jobs.push(FileJob {
                dest: join_local_path(dest_root, &rel),
                source: src,
                rel_path: rel,
                size,
                is_dir,
            });
            if !is_dir {
                total_bytes += size;
            }
            if let Some(ref on_found) = on_found {
                if jobs.len() % FOUND_REPORT_EVERY == 0 {
                    on_found(jobs.len());
                }
            }
        };

        push_job(root.to_string(), 0, true);

        let mut pending = vec![root.to_string()];
        while let Some(dir) = pending.pop() {
            token.check()?;

            for entry in self.remote.read_dir(&dir).await? {
                let src = join_remote_path(&dir, &entry.name);
                if entry.is_dir {
                    push_job(src.clone(), 0, true);
                    pending.push(src);
                } else {
                    push_job(src, entry.size, false);
                }
            }
        }

        Ok((jobs, total_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::testfs::MemRemoteFs;
    use std::fs;
    use tempfile::tempdir;

    fn scanner_with(remote: Arc<MemRemoteFs>) -> DirectoryScanner {
        DirectoryScanner::new(remote)
    }

    #[tokio::test]
    async fn test_scan_local_recreates_root_under_dest() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("photos");
        fs::create_dir_all(root.join("raw")).unwrap();
        fs::write(root.join("a.jpg"), vec![0u8; 10]).unwrap();
        fs::write(root.join("raw/b.raw"), vec![0u8; 30]).unwrap();

        let scanner = scanner_with(Arc::new(MemRemoteFs::new()));
        let token = CancelToken::new();
        let (jobs, total) = scanner
            .scan_local(&token, root.to_str().unwrap(), "/srv/backup", None)
            .await
            .unwrap();

        assert_eq!(total, 40);
        assert_eq!(jobs.len(), 4); // photos, a.jpg, raw, raw/b.raw

        // Root directory job first, re-created under dest_root
        assert!(jobs[0].is_dir);
        assert_eq!(jobs[0].dest, "/srv/backup/photos");

        let file_dests: Vec<_> = jobs
            .iter()
            .filter(|j| !j.is_dir)
            .map(|j| j.dest.as_str())
            .collect();
        assert!(file_dests.contains(&"/srv/backup/photos/a.jpg"));
        assert!(file_dests.contains(&"/srv/backup/photos/raw/b.raw"));
    }

    #[tokio::test]
    async fn test_scan_local_parents_before_children() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("tree");
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::write(root.join("a/b/c/deep.txt"), b"x").unwrap();

        let scanner = scanner_with(Arc::new(MemRemoteFs::new()));
        let token = CancelToken::new();
        let (jobs, _) = scanner
            .scan_local(&token, root.to_str().unwrap(), "/dst", None)
            .await
            .unwrap();

        for (i, job) in jobs.iter().enumerate() {
            if job.is_dir {
                continue;
            }
            let parent = crate::sftp::path_utils::remote_parent(&job.dest);
            let parent_idx = jobs.iter().position(|j| j.is_dir && j.dest == parent);
            assert!(
                matches!(parent_idx, Some(p) if p < i),
                "file {} appears before its parent dir",
                job.rel_path
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_local_symlink_handling() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().unwrap();
        let root = temp.path().join("src");
        fs::create_dir_all(root.join("real_dir")).unwrap();
        fs::write(root.join("real.txt"), b"hello").unwrap();
        symlink(root.join("real_dir"), root.join("link_dir")).unwrap();
        symlink(root.join("real.txt"), root.join("link.txt")).unwrap();
        symlink(root.join("missing"), root.join("broken")).unwrap();

        let scanner = scanner_with(Arc::new(MemRemoteFs::new()));
        let token = CancelToken::new();
        let (jobs, total) = scanner
            .scan_local(&token, root.to_str().unwrap(), "/dst", None)
            .await
            .unwrap();

        let names: Vec<_> = jobs.iter().map(|j| j.rel_path.as_str()).collect();
        assert!(names.contains(&"src/link.txt"), "file symlink followed");
        assert!(!names.iter().any(|n| n.contains("link_dir")), "dir symlink skipped");
        assert!(!names.iter().any(|n| n.contains("broken")), "broken symlink skipped");
        // real.txt + link.txt both count their 5 bytes
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn test_scan_local_cancellation() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("src");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("f"), b"x").unwrap();

        let scanner = scanner_with(Arc::new(MemRemoteFs::new()));
        let token = CancelToken::new();
        token.cancel();

        let result = scanner
            .scan_local(&token, root.to_str().unwrap(), "/dst", None)
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn test_scan_remote_tree() {
        let remote = Arc::new(MemRemoteFs::new());
        remote.seed_file("/home/u/proj/main.rs", &[1; 100]);
        remote.seed_file("/home/u/proj/src/lib.rs", &[1; 50]);
        remote.seed_dir("/home/u/proj/empty");

        let scanner = scanner_with(remote);
        let token = CancelToken::new();
        let (jobs, total) = scanner
            .scan_remote(&token, "/home/u/proj", "/tmp/dl", None)
            .await
            .unwrap();

        assert_eq!(total, 150);
        assert!(jobs[0].is_dir && jobs[0].source == "/home/u/proj");

        // Empty directories still get a creation job
        let empty = jobs.iter().find(|j| j.source.ends_with("empty")).unwrap();
        assert!(empty.is_dir);

        let lib = jobs.iter().find(|j| j.source.ends_with("lib.rs")).unwrap();
        assert_eq!(lib.rel_path, "proj/src/lib.rs");
        assert_eq!(
            lib.dest,
            join_local_path("/tmp/dl", "proj/src/lib.rs")
        );
    }

    #[tokio::test]
    async fn test_scan_remote_rejects_file_root() {
        let remote = Arc::new(MemRemoteFs::new());
        remote.seed_file("/data/file.bin", &[0; 8]);

        let scanner = scanner_with(remote);
        let token = CancelToken::new();
        let result = scanner.scan_remote(&token, "/data/file.bin", "/tmp", None).await;
        assert!(matches!(result, Err(TransferError::Scan(_))));
    }
}
