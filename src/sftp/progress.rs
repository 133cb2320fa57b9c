//! Progress reporting plumbing
//!
//! One bounded channel of [`TaskProgress`] snapshots is shared by all
//! tasks. Incremental snapshots are sent without blocking and dropped
//! when the consumer lags; terminal snapshots block so the consumer
//! always observes the state change.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::mpsc;

use super::types::TaskProgress;

/// Lossy-for-incremental, reliable-for-terminal snapshot sender
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<TaskProgress>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<TaskProgress>) -> Self {
        Self { tx }
    }

    /// Non-blocking send; the snapshot is dropped if the channel is full
    pub fn publish(&self, snapshot: TaskProgress) {
        let _ = self.tx.try_send(snapshot);
    }

    /// Blocking send for terminal snapshots
    pub async fn publish_terminal(&self, snapshot: TaskProgress) {
        let _ = self.tx.send(snapshot).await;
    }
}

/// Transfer speed over a ~1-second sliding window.
///
/// Between window boundaries the previous value is held so the consumer
/// does not see the speed flap on every snapshot.
#[derive(Debug)]
pub struct SpeedTracker {
    last_bytes: u64,
    last_check: Option<Instant>,
    current: f64,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self {
            last_bytes: 0,
            last_check: None,
            current: 0.0,
        }
    }

    /// Feed the current cumulative byte count; returns bytes/sec
    pub fn update(&mut self, bytes_now: u64) -> f64 {
        let now = Instant::now();
        match self.last_check {
            None => {
                self.last_check = Some(now);
                self.last_bytes = bytes_now;
            }
            Some(last) => {
                let elapsed = now.duration_since(last).as_secs_f64();
                if elapsed >= 1.0 {
                    let delta = bytes_now.saturating_sub(self.last_bytes);
                    self.current = delta as f64 / elapsed;
                    self.last_bytes = bytes_now;
                    self.last_check = Some(now);
                }
            }
        }
        self.current
    }

    /// Override with an externally measured rate (parsed rsync output)
    pub fn set(&mut self, bytes_per_sec: f64) {
        self.current = bytes_per_sec;
    }

    pub fn current(&self) -> f64 {
        self.current
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Capped tail of recent engine output lines
#[derive(Debug)]
pub struct LogTail {
    lines: VecDeque<String>,
    cap: usize,
}

impl LogTail {
    pub fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Most recent line
    pub fn last(&self) -> String {
        self.lines.back().cloned().unwrap_or_default()
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::types::TaskState;

    fn snapshot(id: u64) -> TaskProgress {
        TaskProgress {
            task_id: id,
            state: TaskState::Transferring,
            total_files: 1,
            completed_files: 0,
            total_bytes: 10,
            bytes_transferred: 5,
            current_speed: 0.0,
            percentage: 50,
            last_log: String::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_publish_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ProgressSink::new(tx);

        sink.publish(snapshot(1));
        sink.publish(snapshot(2)); // dropped, channel is full

        assert_eq!(rx.recv().await.unwrap().task_id, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_terminal_send_waits_for_capacity() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ProgressSink::new(tx);
        sink.publish(snapshot(1));

        let send = tokio::spawn(async move { sink.publish_terminal(snapshot(2)).await });
        tokio::task::yield_now().await;

        assert_eq!(rx.recv().await.unwrap().task_id, 1);
        send.await.unwrap();
        assert_eq!(rx.recv().await.unwrap().task_id, 2);
    }

    #[test]
    fn test_log_tail_caps_length() {
        let mut tail = LogTail::new(3);
        for i in 0..5 {
            tail.push(format!("line {}", i));
        }
        let lines: Vec<_> = tail.lines().collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(tail.last(), "line 4");
    }

    #[test]
    fn test_speed_tracker_holds_between_windows() {
        let mut tracker = SpeedTracker::new();
        assert_eq!(tracker.update(0), 0.0);
        // Second sample inside the window keeps the previous value
        assert_eq!(tracker.update(1_000_000), 0.0);
        tracker.set(42.0);
        assert_eq!(tracker.current(), 42.0);
    }
}
