//! Task queue: the top-level unit of the transfer pipeline
//!
//! User-submitted tasks pass through a bounded admission channel into a
//! dispatcher that admits up to `max_concurrent_tasks` at once. Each task
//! is driven Pending → Scanning → Transferring → terminal by its own
//! tokio task, which selects an engine, scans its tree into jobs, runs
//! them through the inner [`FileJobQueue`], and publishes snapshots on
//! the shared progress channel. Every task owns one cancellation token.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

use super::control::CancelToken;
use super::engine::{ProgressEvent, TransferEngine};
use super::error::TransferError;
use super::job_queue::{FileJobQueue, JobExecutor, UpdateFn};
use super::path_utils::{local_parent, remote_parent};
use super::progress::{LogTail, ProgressSink, SpeedTracker};
use super::scanner::{DirectoryScanner, FoundFn};
use super::session::RemoteFs;
use super::types::{FileJob, TaskKind, TaskProgress, TaskState};
use crate::config::Settings;
use crate::ssh::SshConfig;

/// Admission buffer size as a multiple of the concurrency limit
const ADMISSION_FACTOR: usize = 2;
/// File jobs in flight within one task
const FILE_JOB_CONCURRENCY: usize = 128;
/// Snapshot ticker period while a task is transferring
const PROGRESS_TICK: Duration = Duration::from_millis(500);
/// "Scanning... N files found" cadence
const SCAN_LOG_EVERY: usize = 500;
/// Engine output lines retained per task
const LOG_TAIL_LINES: usize = 10;

/// One queued transfer and its lifetime state
pub struct TaskHandle {
    pub id: u64,
    pub kind: TaskKind,
    pub source: String,
    pub dest: String,
    pub name: String,

    state: RwLock<TaskState>,
    token: CancelToken,
    /// Set once at engine selection; external tasks take speed/percentage
    /// from parsed engine output instead of byte counters
    external: AtomicBool,

    total_files: AtomicU64,
    total_bytes: AtomicU64,
    completed_files: AtomicU64,
    bytes_transferred: AtomicU64,
    external_percent: AtomicU8,

    speed: Mutex<SpeedTracker>,
    log: Mutex<LogTail>,
    error: Mutex<Option<String>>,
}

impl TaskHandle {
    fn new(id: u64, kind: TaskKind, source: String, dest: String, name: String) -> Self {
        Self {
            id,
            kind,
            source,
            dest,
            name,
            state: RwLock::new(TaskState::Pending),
            token: CancelToken::new(),
            external: AtomicBool::new(false),
            total_files: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            completed_files: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            external_percent: AtomicU8::new(0),
            speed: Mutex::new(SpeedTracker::new()),
            log: Mutex::new(LogTail::new(LOG_TAIL_LINES)),
            error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TaskState {
        *self.state.read()
    }

    fn set_state(&self, state: TaskState) {
        *self.state.write() = state;
    }

    fn push_log(&self, line: &str) {
        self.log.lock().push(line);
    }

    /// Build an immutable snapshot of the current counters
    fn snapshot(&self) -> TaskProgress {
        let state = self.state();
        let total_bytes = self.total_bytes.load(Ordering::Acquire);
        let bytes = self.bytes_transferred.load(Ordering::Acquire);

        let percentage = if state == TaskState::Completed {
            100
        } else if total_bytes > 0 {
            ((bytes as u128 * 100 / total_bytes as u128) as u8).min(100)
        } else {
            self.external_percent.load(Ordering::Acquire)
        };

        let current_speed = if self.external.load(Ordering::Acquire) {
            self.speed.lock().current()
        } else {
            self.speed.lock().update(bytes)
        };

        TaskProgress {
            task_id: self.id,
            state,
            total_files: self.total_files.load(Ordering::Acquire),
            completed_files: self.completed_files.load(Ordering::Acquire),
            total_bytes,
            bytes_transferred: bytes,
            current_speed,
            percentage,
            last_log: self.log.lock().last(),
            error: self.error.lock().clone(),
        }
    }
}

/// Concurrent task queue over one transport
pub struct TaskQueue {
    remote: Arc<dyn RemoteFs>,
    ssh_config: SshConfig,
    settings: RwLock<Arc<Settings>>,

    admission_tx: mpsc::Sender<Arc<TaskHandle>>,
    sink: ProgressSink,
    sem: Arc<Semaphore>,

    /// Task history, live and terminal; retained for the process lifetime
    tasks: Mutex<Vec<Arc<TaskHandle>>>,
    next_id: AtomicU64,
}

impl TaskQueue {
    /// Create the queue and start its dispatcher.
    ///
    /// `max_concurrent_tasks` from `settings` sizes the outer semaphore
    /// and the admission buffer once; later settings swaps only affect
    /// engine selection of subsequently started tasks.
    pub fn new(
        remote: Arc<dyn RemoteFs>,
        ssh_config: SshConfig,
        settings: Settings,
        update_tx: mpsc::Sender<TaskProgress>,
    ) -> Arc<Self> {
        let max_tasks = settings.max_concurrent_tasks.max(1);
        let (admission_tx, admission_rx) = mpsc::channel(max_tasks * ADMISSION_FACTOR);

        let queue = Arc::new(Self {
            remote,
            ssh_config,
            settings: RwLock::new(Arc::new(settings)),
            admission_tx,
            sink: ProgressSink::new(update_tx),
            sem: Arc::new(Semaphore::new(max_tasks)),
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(Self::dispatcher(queue.clone(), admission_rx));
        queue
    }

    /// Swap the settings snapshot consulted by subsequent tasks
    pub fn update_settings(&self, settings: Settings) {
        *self.settings.write() = Arc::new(settings);
    }

    fn settings(&self) -> Arc<Settings> {
        self.settings.read().clone()
    }

    /// Submit a task. Publishes a Pending snapshot, then attempts
    /// admission; a full buffer rejects with [`TransferError::QueueFull`]
    /// and leaves no trace in the history.
    pub fn queue_task(
        &self,
        kind: TaskKind,
        source: &str,
        dest: &str,
        name: &str,
    ) -> Result<u64, TransferError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(TaskHandle::new(
            id,
            kind,
            source.to_string(),
            dest.to_string(),
            name.to_string(),
        ));

        self.tasks.lock().push(task.clone());
        self.sink.publish(task.snapshot());
        info!(
            "Queued task {}: {} ({} -> {})",
            task.id, task.name, task.source, task.dest
        );

        match self.admission_tx.try_send(task) {
            Ok(()) => Ok(id),
            Err(_) => {
                self.tasks.lock().retain(|t| t.id != id);
                warn!("Task queue full, rejecting task {}", id);
                Err(TransferError::QueueFull)
            }
        }
    }

    /// Recent engine output lines for a task (diagnosis aid; the snapshot
    /// itself only carries the most recent line)
    pub fn task_log(&self, id: u64) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.log.lock().lines().map(String::from).collect())
            .unwrap_or_default()
    }

    /// Fire the cancellation token of every live task. Idempotent.
    pub fn cancel_all(&self) {
        for task in self.tasks.lock().iter() {
            if task.state().is_live() {
                info!("Cancelling task {}", task.id);
                task.token.cancel();
            }
        }
    }

    async fn dispatcher(queue: Arc<Self>, mut admission_rx: mpsc::Receiver<Arc<TaskHandle>>) {
        while let Some(task) = admission_rx.recv().await {
            let permit = queue
                .sem
                .clone()
                .acquire_owned()
                .await
                .expect("task semaphore closed");

            let queue = queue.clone();
            tokio::spawn(async move {
                let _permit = permit;
                queue.process_task(task).await;
            });
        }
    }

    async fn process_task(self: Arc<Self>, task: Arc<TaskHandle>) {
        if task.token.is_cancelled() {
            task.set_state(TaskState::Cancelled);
            self.sink.publish_terminal(task.snapshot()).await;
            info!("Task {} ({}) cancelled before start", task.id, task.name);
            return;
        }

        let settings = self.settings();
        let engine = Arc::new(TransferEngine::select(
            &settings,
            task.kind,
            self.remote.clone(),
            &self.ssh_config,
        ));
        task.external.store(engine.is_external(), Ordering::Release);

        let result = self.run_task(&task, engine).await;

        match result {
            Ok(()) => {
                task.set_state(TaskState::Completed);
                let total_files = task.total_files.load(Ordering::Acquire);
                let total_bytes = task.total_bytes.load(Ordering::Acquire);
                task.completed_files.store(total_files, Ordering::Release);
                task.bytes_transferred.store(total_bytes, Ordering::Release);
                info!("Task {} ({}) completed successfully", task.id, task.name);
            }
            Err(e) if e.is_cancelled() || task.token.is_cancelled() => {
                task.set_state(TaskState::Cancelled);
                info!("Task {} ({}) cancelled during transfer", task.id, task.name);
            }
            Err(e) => {
                task.set_state(TaskState::Failed);
                *task.error.lock() = Some(e.to_string());
                error!("Task {} ({}) failed: {}", task.id, task.name, e);
            }
        }

        self.sink.publish_terminal(task.snapshot()).await;
    }

    async fn run_task(
        &self,
        task: &Arc<TaskHandle>,
        engine: Arc<TransferEngine>,
    ) -> Result<(), TransferError> {
        let external = engine.is_external();

        let jobs = if external {
            // The external tool recurses on its own: one job stands for
            // the whole directory, totals stay unknown
            info!("Task {} using external recursive mode", task.id);
            task.total_files.store(1, Ordering::Release);
            task.total_bytes.store(0, Ordering::Release);
            vec![FileJob {
                rel_path: task.name.clone(),
                source: task.source.clone(),
                dest: task.dest.clone(),
                size: 0,
                is_dir: true,
            }]
        } else {
            self.scan_task(task).await?
        };

        task.set_state(TaskState::Transferring);
        self.sink.publish(task.snapshot());
        info!(
            "Task {} ({}) transferring: {} files, {} bytes",
            task.id,
            task.name,
            task.total_files.load(Ordering::Acquire),
            task.total_bytes.load(Ordering::Acquire)
        );

        // Snapshot ticker for the duration of the transfer phase
        let ticker_stop = CancelToken::new();
        let _ticker_guard = CancelOnDrop(ticker_stop.clone());
        tokio::spawn({
            let task = task.clone();
            let sink = self.sink.clone();
            let stop = ticker_stop;
            async move {
                let mut interval = tokio::time::interval(PROGRESS_TICK);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => sink.publish(task.snapshot()),
                        _ = stop.cancelled() => return,
                        _ = task.token.cancelled() => return,
                    }
                }
            }
        });

        // Directory creation strictly precedes file content
        let (dir_jobs, file_jobs): (Vec<FileJob>, Vec<FileJob>) =
            jobs.into_iter().partition(|j| j.is_dir);
        let dir_count = dir_jobs.len() as u64;

        let executor: Arc<dyn JobExecutor> = Arc::new(TransferExecutor {
            remote: self.remote.clone(),
            engine,
            task: task.clone(),
            sink: self.sink.clone(),
            upload: task.kind.is_upload(),
            external,
        });
        let file_queue = FileJobQueue::new(FILE_JOB_CONCURRENCY);

        if !dir_jobs.is_empty() {
            if !external {
                let line = format!("Creating {} directories...", dir_count);
                task.push_log(&line);
                self.sink.publish(task.snapshot());
            }
            file_queue
                .process(&task.token, dir_jobs, executor.clone(), None)
                .await?;
            task.completed_files.store(dir_count, Ordering::Release);
        }

        let on_update: UpdateFn = {
            let task = task.clone();
            Arc::new(move |files_done, bytes_done| {
                task.bytes_transferred.store(bytes_done, Ordering::Release);
                task.completed_files
                    .store(files_done + dir_count, Ordering::Release);
            })
        };

        file_queue
            .process(&task.token, file_jobs, executor, Some(on_update))
            .await
    }

    /// Scanning phase: explode directory kinds into jobs, stat single files
    async fn scan_task(&self, task: &Arc<TaskHandle>) -> Result<Vec<FileJob>, TransferError> {
        task.set_state(TaskState::Scanning);
        self.sink.publish(task.snapshot());

        let on_found: FoundFn = {
            let task = task.clone();
            let sink = self.sink.clone();
            Arc::new(move |count| {
                if count % SCAN_LOG_EVERY == 0 {
                    task.push_log(&format!("Scanning... {} files found", count));
                    sink.publish(task.snapshot());
                }
            })
        };

        let scanner = DirectoryScanner::new(self.remote.clone());
        let (jobs, total_bytes) = match task.kind {
            TaskKind::UploadDir => {
                scanner
                    .scan_local(
                        &task.token,
                        &task.source,
                        &remote_parent(&task.dest),
                        Some(on_found),
                    )
                    .await?
            }
            TaskKind::DownloadDir => {
                scanner
                    .scan_remote(
                        &task.token,
                        &task.source,
                        &local_parent(&task.dest),
                        Some(on_found),
                    )
                    .await?
            }
            TaskKind::UploadFile => {
                let meta = tokio::fs::metadata(&task.source).await?;
                let job = FileJob {
                    rel_path: task.name.clone(),
                    source: task.source.clone(),
                    dest: task.dest.clone(),
                    size: meta.len(),
                    is_dir: false,
                };
                (vec![job], meta.len())
            }
            TaskKind::DownloadFile => {
                let stat = self.remote.stat(&task.source).await?;
                let job = FileJob {
                    rel_path: task.name.clone(),
                    source: task.source.clone(),
                    dest: task.dest.clone(),
                    size: stat.size,
                    is_dir: false,
                };
                (vec![job], stat.size)
            }
        };

        task.total_files.store(jobs.len() as u64, Ordering::Release);
        task.total_bytes.store(total_bytes, Ordering::Release);
        Ok(jobs)
    }
}

/// Fires a token when dropped, stopping the ticker on every exit path
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Job executor closing over one task's engine and direction
struct TransferExecutor {
    remote: Arc<dyn RemoteFs>,
    engine: Arc<TransferEngine>,
    task: Arc<TaskHandle>,
    sink: ProgressSink,
    upload: bool,
    external: bool,
}

#[async_trait]
impl JobExecutor for TransferExecutor {
    async fn execute(&self, token: &CancelToken, job: &FileJob) -> Result<u64, TransferError> {
        if job.is_dir {
            if self.external {
                return self.run_external_dir(token, job).await;
            }
            if self.upload {
                self.remote.mkdir_all(&job.dest).await?;
            } else {
                tokio::fs::create_dir_all(&job.dest).await?;
            }
            return Ok(0);
        }

        if self.upload {
            self.engine
                .upload_file(token, &job.source, &job.dest, None)
                .await?;
        } else {
            self.engine
                .download_file(token, &job.source, &job.dest, None)
                .await?;
        }
        Ok(job.size)
    }
}

impl TransferExecutor {
    /// The external engine's single directory job *is* the whole transfer.
    ///
    /// The trailing slash makes the tool sync the directory's contents
    /// into `dest` instead of duplicating the top-level name under it.
    async fn run_external_dir(
        &self,
        token: &CancelToken,
        job: &FileJob,
    ) -> Result<u64, TransferError> {
        let source = format!("{}/", job.source.trim_end_matches('/'));

        let progress = |event: ProgressEvent<'_>| -> Result<(), TransferError> {
            if let ProgressEvent::Line { line, speed, percent } = event {
                self.task.push_log(line);
                if let Some(speed) = speed {
                    self.task.speed.lock().set(speed);
                }
                if let Some(percent) = percent {
                    self.task
                        .external_percent
                        .store(percent, Ordering::Release);
                }
                self.sink.publish(self.task.snapshot());
            }
            Ok(())
        };

        if self.upload {
            self.engine
                .upload_file(token, &source, &job.dest, Some(&progress))
                .await?;
        } else {
            tokio::fs::create_dir_all(&job.dest).await?;
            self.engine
                .download_file(token, &source, &job.dest, Some(&progress))
                .await?;
        }
        Ok(0)
    }
}
