//! Ready queue between the graph and the dispatch loop.
//!
//! Tasks spawned by other tasks go to the high tier and are always served
//! before freshly ingested top-level tasks, so deep subtrees drain before new
//! breadth is added.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::task_graph::TaskWrapper;

#[derive(Debug)]
pub enum BufferItem {
    Task(TaskWrapper),
    /// Tells the dispatch loop to stop.
    Shutdown,
}

#[derive(Default)]
struct Tiers {
    /// LIFO: the most recently spawned child runs first.
    high: Vec<BufferItem>,
    /// FIFO: top-level tasks run in producer order.
    low: VecDeque<BufferItem>,
}

#[derive(Default)]
pub struct TaskBuffer {
    tiers: Mutex<Tiers>,
    available: Condvar,
}

impl TaskBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tiers> {
        self.tiers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put(&self, item: BufferItem, prioritize: bool) {
        let mut tiers = self.lock();
        if prioritize {
            tiers.high.push(item);
        } else {
            tiers.low.push_back(item);
        }
        drop(tiers);
        self.available.notify_one();
    }

    /// Blocks until an item is available.
    pub fn get(&self) -> BufferItem {
        let mut tiers = self.lock();
        loop {
            if let Some(item) = tiers.high.pop() {
                return item;
            }
            if let Some(item) = tiers.low.pop_front() {
                return item;
            }
            tiers = self
                .available
                .wait(tiers)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn len(&self) -> usize {
        let tiers = self.lock();
        tiers.high.len() + tiers.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
