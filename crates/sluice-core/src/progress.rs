//! Progress reporting for transfers (bytes and files completed, ETA, rate).
//!
//! Tasks push increments into a `ProgressSink`; rendering is up to the caller.
//! `ProgressCounter` is a ready-made sink that accumulates totals and can
//! produce `ProgressStats` snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// One increment reported by a running task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// `bytes` more bytes were transferred for `url`.
    Bytes { url: String, bytes: u64 },
    /// One file (or object) finished transferring.
    FileCompleted { url: String },
    /// Estimated size of the whole workload, reported once the producer is exhausted.
    Workload { item_count: u64, size: u64 },
}

/// Receiver of progress increments. Shared by every worker thread.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _update: ProgressUpdate) {}
}

/// Blocks while a bounded channel is full; updates are only lost once the
/// receiver is gone.
impl ProgressSink for crossbeam_channel::Sender<ProgressUpdate> {
    fn report(&self, update: ProgressUpdate) {
        if let Err(e) = self.send(update) {
            tracing::debug!(update = ?e.into_inner(), "progress receiver gone; dropping update");
        }
    }
}

/// Sink that accumulates totals with atomics.
#[derive(Debug)]
pub struct ProgressCounter {
    bytes_done: AtomicU64,
    files_done: AtomicU64,
    total_bytes: AtomicU64,
    total_files: AtomicU64,
    started: Instant,
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self {
            bytes_done: AtomicU64::new(0),
            files_done: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            total_files: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    pub fn files_done(&self) -> u64 {
        self.files_done.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressStats {
        ProgressStats {
            bytes_done: self.bytes_done(),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            files_done: self.files_done(),
            total_files: self.total_files.load(Ordering::Relaxed),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        }
    }
}

impl ProgressSink for ProgressCounter {
    fn report(&self, update: ProgressUpdate) {
        match update {
            ProgressUpdate::Bytes { bytes, .. } => {
                self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
            }
            ProgressUpdate::FileCompleted { .. } => {
                self.files_done.fetch_add(1, Ordering::Relaxed);
            }
            ProgressUpdate::Workload { item_count, size } => {
                self.total_files.store(item_count, Ordering::Relaxed);
                self.total_bytes.store(size, Ordering::Relaxed);
            }
        }
    }
}

/// Snapshot of overall progress (CLI-friendly).
#[derive(Debug, Clone)]
pub struct ProgressStats {
    pub bytes_done: u64,
    /// Zero until the workload estimate arrives.
    pub total_bytes: u64,
    pub files_done: u64,
    pub total_files: u64,
    pub elapsed_secs: f64,
}

impl ProgressStats {
    /// Transfer rate in bytes per second (0 if elapsed is 0).
    pub fn bytes_per_sec(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.bytes_done as f64 / self.elapsed_secs
    }

    /// Estimated seconds remaining (None if rate or total is unknown).
    pub fn eta_secs(&self) -> Option<f64> {
        if self.total_bytes == 0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.bytes_done);
        if remaining == 0 {
            return Some(0.0);
        }
        let rate = self.bytes_per_sec();
        if rate <= 0.0 {
            return None;
        }
        Some(remaining as f64 / rate)
    }

    /// Fraction complete in [0.0, 1.0].
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_done as f64 / self.total_bytes as f64).min(1.0)
    }
}
