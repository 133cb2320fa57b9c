//! In-memory [`RemoteFs`] used by pipeline tests.
//!
//! Same role as a dummy store behind a seam trait: lets the scanner,
//! native engine and task queue run end-to-end without a network. Writes
//! are committed when the writer shuts down (or is dropped).

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::TransferError;
use super::session::{RemoteEntry, RemoteFs, RemoteStat};

#[derive(Default)]
struct MemState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

pub struct MemRemoteFs {
    state: Arc<Mutex<MemState>>,
    /// Paths containing this substring fail on open
    fail_on: Mutex<Option<String>>,
    /// Sleep applied before every open, to make cancellation windows wide
    op_delay: Mutex<Duration>,
}

impl MemRemoteFs {
    pub fn new() -> Self {
        let mut state = MemState::default();
        state.dirs.insert("/".to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
            fail_on: Mutex::new(None),
            op_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn seed_file(&self, path: &str, contents: &[u8]) {
        let mut state = self.state.lock();
        let mut parent = parent_of(path);
        while !parent.is_empty() {
            state.dirs.insert(parent.clone());
            if parent == "/" {
                break;
            }
            parent = parent_of(&parent);
        }
        state.files.insert(path.to_string(), contents.to_vec());
    }

    pub fn seed_dir(&self, path: &str) {
        self.state.lock().dirs.insert(path.to_string());
    }

    pub fn fail_on(&self, needle: &str) {
        *self.fail_on.lock() = Some(needle.to_string());
    }

    pub fn set_op_delay(&self, delay: Duration) {
        *self.op_delay.lock() = delay;
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().dirs.contains(path)
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    async fn gate(&self, path: &str) -> Result<(), TransferError> {
        let delay = *self.op_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(needle) = self.fail_on.lock().as_deref() {
            if path.contains(needle) {
                return Err(TransferError::Protocol(format!("injected failure: {}", path)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteFs for MemRemoteFs {
    async fn stat(&self, path: &str) -> Result<RemoteStat, TransferError> {
        let state = self.state.lock();
        if let Some(contents) = state.files.get(path) {
            return Ok(RemoteStat {
                size: contents.len() as u64,
                is_dir: false,
            });
        }
        if state.dirs.contains(path) {
            return Ok(RemoteStat { size: 0, is_dir: true });
        }
        Err(TransferError::RemoteMissing(path.to_string()))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, TransferError> {
        let state = self.state.lock();
        if !state.dirs.contains(path) {
            return Err(TransferError::RemoteMissing(path.to_string()));
        }

        let mut entries = Vec::new();
        for (file, contents) in &state.files {
            if parent_of(file) == path {
                entries.push(RemoteEntry {
                    name: name_of(file),
                    size: contents.len() as u64,
                    is_dir: false,
                    is_symlink: false,
                });
            }
        }
        for dir in &state.dirs {
            if dir != path && parent_of(dir) == path {
                entries.push(RemoteEntry {
                    name: name_of(dir),
                    size: 0,
                    is_dir: true,
                    is_symlink: false,
                });
            }
        }
        Ok(entries)
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), TransferError> {
        self.gate(path).await?;
        let mut state = self.state.lock();
        let mut current = path.to_string();
        while !current.is_empty() {
            state.dirs.insert(current.clone());
            if current == "/" {
                break;
            }
            current = parent_of(&current);
        }
        Ok(())
    }

    async fn open_read(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransferError> {
        self.gate(path).await?;
        let contents = self
            .file(path)
            .ok_or_else(|| TransferError::RemoteMissing(path.to_string()))?;
        Ok(Box::new(io::Cursor::new(contents)))
    }

    async fn open_write(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransferError> {
        self.gate(path).await?;
        Ok(Box::new(MemWriter {
            path: path.to_string(),
            buf: Some(Vec::new()),
            state: self.state.clone(),
        }))
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransferError> {
        match self.state.lock().files.remove(path) {
            Some(_) => Ok(()),
            None => Err(TransferError::RemoteMissing(path.to_string())),
        }
    }
}

fn parent_of(path: &str) -> String {
    super::path_utils::remote_parent(path)
}

fn name_of(path: &str) -> String {
    super::path_utils::remote_file_name(path)
}

struct MemWriter {
    path: String,
    buf: Option<Vec<u8>>,
    state: Arc<Mutex<MemState>>,
}

impl MemWriter {
    fn commit(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.state.lock().files.insert(self.path.clone(), buf);
        }
    }
}

impl AsyncWrite for MemWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.buf.as_mut() {
            Some(buf) => {
                buf.extend_from_slice(data);
                Poll::Ready(Ok(data.len()))
            }
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "writer already closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.commit();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MemWriter {
    fn drop(&mut self) {
        self.commit();
    }
}
