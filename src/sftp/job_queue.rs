//! Inner file-job queue
//!
//! Applies a caller-provided executor over a job list with bounded
//! concurrency, aggregating completion counts and byte totals. The first
//! error latches: dispatch stops, in-flight jobs drain, and that error is
//! returned.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::control::CancelToken;
use super::error::TransferError;
use super::types::FileJob;

/// Performs one job, returning the bytes it moved
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, token: &CancelToken, job: &FileJob) -> Result<u64, TransferError>;
}

/// Aggregate progress callback: (files done, bytes done), both cumulative
pub type UpdateFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

pub struct FileJobQueue {
    concurrency: usize,
}

impl FileJobQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Run all jobs, up to `concurrency` in flight at once.
    ///
    /// Counters are only incremented here; executors must not aggregate on
    /// their own. Returns the first executor error, or `Cancelled` when
    /// the token stopped dispatch.
    pub async fn process(
        &self,
        token: &CancelToken,
        jobs: Vec<FileJob>,
        executor: Arc<dyn JobExecutor>,
        on_update: Option<UpdateFn>,
    ) -> Result<(), TransferError> {
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let failed = Arc::new(AtomicBool::new(false));
        let first_err: Arc<Mutex<Option<TransferError>>> = Arc::new(Mutex::new(None));
        let files_done = Arc::new(AtomicU64::new(0));
        let bytes_done = Arc::new(AtomicU64::new(0));

        let mut workers = JoinSet::new();

        for job in jobs {
            if failed.load(Ordering::Acquire) || token.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                permit = sem.clone().acquire_owned() => {
                    permit.expect("job semaphore closed")
                }
                _ = token.cancelled() => break,
            };

            let token = token.clone();
            let executor = executor.clone();
            let failed = failed.clone();
            let first_err = first_err.clone();
            let files_done = files_done.clone();
            let bytes_done = bytes_done.clone();
            let on_update = on_update.clone();

            workers.spawn(async move {
                let _permit = permit;

                if token.is_cancelled() {
                    return;
                }

                match executor.execute(&token, &job).await {
                    Ok(bytes) => {
                        let fd = files_done.fetch_add(1, Ordering::AcqRel) + 1;
                        let bd = bytes_done.fetch_add(bytes, Ordering::AcqRel) + bytes;
                        if let Some(ref update) = on_update {
                            update(fd, bd);
                        }
                    }
                    Err(e) => {
                        failed.store(true, Ordering::Release);
                        first_err.lock().get_or_insert(e);
                    }
                }
            });
        }

        // Let in-flight jobs finish (they observe the token themselves)
        while workers.join_next().await.is_some() {}

        if let Some(err) = first_err.lock().take() {
            return Err(err);
        }
        token.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::time::Duration;

    struct CountingExecutor {
        in_flight: AtomicI64,
        max_in_flight: AtomicI64,
    }

    impl CountingExecutor {
        fn new() -> Self {
            Self {
                in_flight: AtomicI64::new(0),
                max_in_flight: AtomicI64::new(0),
            }
        }
    }

    #[async_trait]
    impl JobExecutor for CountingExecutor {
        async fn execute(&self, _token: &CancelToken, job: &FileJob) -> Result<u64, TransferError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if job.rel_path == "fail" {
                return Err(TransferError::Protocol("simulated error".into()));
            }
            Ok(job.size)
        }
    }

    fn make_jobs(n: usize, size: u64) -> Vec<FileJob> {
        (0..n)
            .map(|i| FileJob {
                rel_path: format!("f{}", i),
                source: format!("/src/f{}", i),
                dest: format!("/dst/f{}", i),
                size,
                is_dir: false,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_all_jobs_counted() {
        let queue = FileJobQueue::new(2);
        let executor = Arc::new(CountingExecutor::new());

        let files_seen = Arc::new(AtomicU64::new(0));
        let bytes_seen = Arc::new(AtomicU64::new(0));
        let update: UpdateFn = {
            let files_seen = files_seen.clone();
            let bytes_seen = bytes_seen.clone();
            Arc::new(move |files, bytes| {
                files_seen.fetch_max(files, Ordering::SeqCst);
                bytes_seen.fetch_max(bytes, Ordering::SeqCst);
            })
        };

        let token = CancelToken::new();
        queue
            .process(&token, make_jobs(5, 100), executor.clone(), Some(update))
            .await
            .unwrap();

        assert_eq!(files_seen.load(Ordering::SeqCst), 5);
        assert_eq!(bytes_seen.load(Ordering::SeqCst), 500);
        assert!(executor.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_first_error_latches() {
        let queue = FileJobQueue::new(2);
        let mut jobs = make_jobs(5, 100);
        jobs[2].rel_path = "fail".into();

        let token = CancelToken::new();
        let err = queue
            .process(&token, jobs, Arc::new(CountingExecutor::new()), None)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("simulated error"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatch() {
        struct CancellingExecutor;

        #[async_trait]
        impl JobExecutor for CancellingExecutor {
            async fn execute(
                &self,
                token: &CancelToken,
                _job: &FileJob,
            ) -> Result<u64, TransferError> {
                token.cancel();
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(0)
            }
        }

        let queue = FileJobQueue::new(1);
        let token = CancelToken::new();
        let result = queue
            .process(&token, make_jobs(5, 0), Arc::new(CancellingExecutor), None)
            .await;

        assert!(matches!(result, Err(TransferError::Cancelled)));
    }
}
