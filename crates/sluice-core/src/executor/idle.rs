//! Count of worker threads waiting for a task.
//!
//! The dispatch loop reads it to decide whether a full task queue will drain
//! on its own (some thread is idle) or needs a new worker group.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct IdleThreads {
    idle: AtomicUsize,
}

impl IdleThreads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn available(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Marks one idle thread busy. Returns false if none was idle.
    pub fn acquire(&self) -> bool {
        let mut current = self.idle.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.idle.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Marks `n` threads idle (new threads, or threads that finished a task).
    pub fn release(&self, n: usize) {
        self.idle.fetch_add(n, Ordering::Release);
    }
}
