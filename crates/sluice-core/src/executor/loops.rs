//! The three control loops: ingest, dispatch and completion.
//!
//! None of them executes tasks; each blocks only on its own queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};

use super::idle::IdleThreads;
use super::workers::FactorySignal;
use super::{Completion, TaskProducer, WorkItem};
use crate::control::Cancellation;
use crate::task::{MessagePayload, Topic};
use crate::task_buffer::{BufferItem, TaskBuffer};
use crate::task_graph::TaskGraph;

/// How long ingest waits for a top-level slot before rechecking cancellation.
const SLOT_WAIT: Duration = Duration::from_millis(100);
/// How long dispatch waits for an idle thread to take a task.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Pulls top-level tasks from the producer into the graph and buffer.
pub(super) fn ingest_loop(
    tasks: TaskProducer,
    graph: &TaskGraph,
    buffer: &TaskBuffer,
    cancel: &Cancellation,
) -> anyhow::Result<()> {
    let mut ingested = 0u64;
    for task in tasks {
        if cancel.is_cancelled() {
            tracing::info!(ingested, "cancelled; no more tasks will be ingested");
            return Ok(());
        }
        let mut task = task.context("task producer failed")?;
        let wrapper = loop {
            match graph.add(task, Vec::new()) {
                Ok(wrapper) => break wrapper,
                Err(rejected) => {
                    task = rejected;
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    graph.wait_for_top_level_slot(SLOT_WAIT);
                }
            }
        };
        buffer.put(BufferItem::Task(wrapper), false);
        ingested += 1;
    }
    tracing::debug!(ingested, "task producer exhausted");
    Ok(())
}

pub(super) struct Dispatcher<'a> {
    pub buffer: &'a TaskBuffer,
    pub task_tx: Sender<WorkItem>,
    pub signal_tx: Sender<FactorySignal>,
    pub idle: &'a IdleThreads,
    pub max_workers: usize,
    /// Worker groups requested so far (the first is started with the run).
    pub workers: usize,
}

impl Dispatcher<'_> {
    /// Moves ready tasks to the worker queue, starting worker groups lazily:
    /// only when the queue is full and no thread is idle.
    pub(super) fn run(mut self) -> anyhow::Result<()> {
        loop {
            let wrapper = match self.buffer.get() {
                BufferItem::Task(wrapper) => wrapper,
                BufferItem::Shutdown => return Ok(()),
            };
            let mut item = WorkItem::Run(wrapper);
            loop {
                if self.workers >= self.max_workers {
                    self.send_blocking(item)?;
                    break;
                }
                match self.task_tx.try_send(item) {
                    Ok(()) => break,
                    Err(TrySendError::Disconnected(_)) => {
                        return Err(anyhow!("worker task queue closed"))
                    }
                    Err(TrySendError::Full(back)) => item = back,
                }
                if self.idle.available() > 0 {
                    match self.task_tx.send_timeout(item, IDLE_WAIT) {
                        Ok(()) => break,
                        Err(SendTimeoutError::Timeout(back)) => item = back,
                        Err(SendTimeoutError::Disconnected(_)) => {
                            return Err(anyhow!("worker task queue closed"))
                        }
                    }
                } else {
                    self.signal_tx
                        .send(FactorySignal::CreateWorker)
                        .map_err(|_| anyhow!("worker factory stopped"))?;
                    self.workers += 1;
                    tracing::debug!(workers = self.workers, "requested worker group");
                    // The new group takes this task as soon as it starts.
                    self.send_blocking(item)?;
                    break;
                }
            }
        }
    }

    fn send_blocking(&self, item: WorkItem) -> anyhow::Result<()> {
        self.task_tx
            .send(item)
            .map_err(|_| anyhow!("worker task queue closed"))
    }
}

/// Feeds executed tasks back into the graph and queues what they unblocked.
pub(super) fn completion_loop(
    output_rx: Receiver<Completion>,
    graph: &TaskGraph,
    buffer: &TaskBuffer,
    failed: &AtomicBool,
) -> anyhow::Result<()> {
    while let Ok(Completion::Executed { id, output }) = output_rx.recv() {
        if let Some(output) = &output {
            for message in &output.messages {
                match (&message.topic, &message.payload) {
                    (Topic::FatalError, _) => failed.store(true, Ordering::Relaxed),
                    (Topic::Error, MessagePayload::Error(e)) => {
                        tracing::warn!(task_id = id, error = %e, "task reported an error")
                    }
                    _ => {}
                }
            }
        }
        for ready in graph.update_from_executed_task(id, output) {
            buffer.put(BufferItem::Task(ready), true);
        }
    }
    Ok(())
}
