//! Per-task cancellation
//!
//! Each task owns exactly one [`CancelToken`]; every suspension point in
//! the pipeline (job dispatch, native copy chunks, subprocess waits)
//! observes it. `cancel_all` on the task queue fires the token of every
//! live task in one pass.

use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation signal observed throughout one task's pipeline.
///
/// Clones share the same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner { tx, rx }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.rx.borrow()
    }

    pub fn cancel(&self) {
        let _ = self.inner.tx.send(true);
    }

    /// Resolve when the token fires (immediately if it already has)
    pub async fn cancelled(&self) {
        let mut rx = self.inner.rx.clone();
        // Outlives the sender only if the task leaked its own token, so a
        // closed channel is treated as cancellation too.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Error out if the token has fired
    pub fn check(&self) -> Result<(), super::error::TransferError> {
        if self.is_cancelled() {
            Err(super::error::TransferError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_observed() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.check().is_err());
        // Resolves without hanging
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }
}
