//! Native transfer engine
//!
//! Streams single files through the SFTP client in 64 KiB chunks,
//! counting bytes into the progress callback and checking the
//! cancellation token between chunks.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{ProgressEvent, ProgressFn};
use crate::sftp::control::CancelToken;
use crate::sftp::error::TransferError;
use crate::sftp::session::RemoteFs;

const CHUNK_SIZE: usize = 64 * 1024;

pub struct NativeEngine {
    remote: Arc<dyn RemoteFs>,
}

impl NativeEngine {
    pub fn new(remote: Arc<dyn RemoteFs>) -> Self {
        Self { remote }
    }

    pub async fn upload_file(
        &self,
        token: &CancelToken,
        local_path: &str,
        remote_path: &str,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<(), TransferError> {
        let mut local = tokio::fs::File::open(local_path).await?;
        let mut remote = self.remote.open_write(remote_path).await?;

        let copied = copy_stream(token, &mut local, &mut remote, progress).await?;
        remote.shutdown().await.map_err(TransferError::Io)?;

        debug!("Uploaded {} -> {} ({} bytes)", local_path, remote_path, copied);
        Ok(())
    }

    pub async fn download_file(
        &self,
        token: &CancelToken,
        remote_path: &str,
        local_path: &str,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<(), TransferError> {
        let mut remote = self.remote.open_read(remote_path).await?;
        let mut local = tokio::fs::File::create(local_path).await?;

        let copied = copy_stream(token, &mut remote, &mut local, progress).await?;
        local.flush().await?;

        debug!("Downloaded {} -> {} ({} bytes)", remote_path, local_path, copied);
        Ok(())
    }
}

/// Chunked copy with a byte-counting progress hook.
///
/// A progress callback error aborts the copy; so does the token firing.
async fn copy_stream<R, W>(
    token: &CancelToken,
    reader: &mut R,
    writer: &mut W,
    progress: Option<&ProgressFn<'_>>,
) -> Result<u64, TransferError>
where
    R: tokio::io::AsyncRead + Unpin + ?Sized,
    W: tokio::io::AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut copied: u64 = 0;

    loop {
        token.check()?;

        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }

        writer.write_all(&buffer[..n]).await?;
        copied += n as u64;

        if let Some(progress) = progress {
            progress(ProgressEvent::Bytes(n as u64))?;
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::testfs::MemRemoteFs;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_upload_roundtrip_with_byte_counting() {
        let temp = tempdir().unwrap();
        let local_path = temp.path().join("payload.bin");
        let contents: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        std::fs::write(&local_path, &contents).unwrap();

        let remote = Arc::new(MemRemoteFs::new());
        let engine = NativeEngine::new(remote.clone());

        let counted = Arc::new(AtomicU64::new(0));
        let progress = {
            let counted = counted.clone();
            move |event: ProgressEvent<'_>| {
                if let ProgressEvent::Bytes(n) = event {
                    counted.fetch_add(n, Ordering::SeqCst);
                }
                Ok(())
            }
        };

        let token = CancelToken::new();
        engine
            .upload_file(
                &token,
                local_path.to_str().unwrap(),
                "/dst/payload.bin",
                Some(&progress),
            )
            .await
            .unwrap();

        assert_eq!(remote.file("/dst/payload.bin").unwrap(), contents);
        assert_eq!(counted.load(Ordering::SeqCst), contents.len() as u64);
    }

    #[tokio::test]
    async fn test_download_roundtrip() {
        let temp = tempdir().unwrap();
        let local_path = temp.path().join("out.txt");

        let remote = Arc::new(MemRemoteFs::new());
        remote.seed_file("/src/hello.txt", b"hello\n");
        let engine = NativeEngine::new(remote);

        let token = CancelToken::new();
        engine
            .download_file(&token, "/src/hello.txt", local_path.to_str().unwrap(), None)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&local_path).unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_copy() {
        let temp = tempdir().unwrap();
        let local_path = temp.path().join("payload.bin");
        std::fs::write(&local_path, vec![0u8; 1024]).unwrap();

        let engine = NativeEngine::new(Arc::new(MemRemoteFs::new()));
        let token = CancelToken::new();
        token.cancel();

        let result = engine
            .upload_file(&token, local_path.to_str().unwrap(), "/dst/x", None)
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn test_progress_error_aborts_copy() {
        let temp = tempdir().unwrap();
        let local_path = temp.path().join("big.bin");
        std::fs::write(&local_path, vec![0u8; 4 * CHUNK_SIZE]).unwrap();

        let engine = NativeEngine::new(Arc::new(MemRemoteFs::new()));
        let progress = |_event: ProgressEvent<'_>| -> Result<(), TransferError> {
            Err(TransferError::Protocol("consumer bailed".into()))
        };

        let token = CancelToken::new();
        let result = engine
            .upload_file(&token, local_path.to_str().unwrap(), "/dst/big", Some(&progress))
            .await;
        assert!(matches!(result, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_missing_local_file_is_io_error() {
        let engine = NativeEngine::new(Arc::new(MemRemoteFs::new()));
        let token = CancelToken::new();

        let result = engine
            .upload_file(&token, "/definitely/not/here", "/dst/x", None)
            .await;
        assert!(matches!(result, Err(TransferError::Io(_))));
    }
}
