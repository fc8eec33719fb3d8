//! Task graph executor: producer → graph → buffer → workers → graph.
//!
//! One `run` owns three control loops (ingest, dispatch, completion) and a
//! worker factory thread. Worker threads are started in groups of
//! `threads_per_worker`, lazily, when the single-slot task queue is full and
//! no thread is idle, up to `max_workers` groups.
//!
//! Shutdown order: ingest finishes, the graph drains (or the run is
//! cancelled), shutdown markers go through the buffer and the completion
//! queue, the completion and dispatch loops are joined, then the factory
//! stops and joins every worker thread. The first control-loop error is
//! returned only after all of that has happened.

mod idle;
mod loops;
mod workers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ScopedJoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::config::ExecutorConfig;
use crate::control::{Cancellation, RunCancelled};
use crate::progress::ProgressSink;
use crate::task::{Output, Task};
use crate::task_buffer::{BufferItem, TaskBuffer};
use crate::task_graph::{TaskGraph, TaskId, TaskWrapper};

pub use idle::IdleThreads;

use loops::Dispatcher;
use workers::{FactorySignal, WorkerContext};

/// Poll interval while waiting for the graph to drain.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Source of top-level tasks. An `Err` stops ingestion and fails the run.
pub type TaskProducer = Box<dyn Iterator<Item = Result<Box<dyn Task>>> + Send>;

/// Item on the worker task queue.
pub(crate) enum WorkItem {
    Run(TaskWrapper),
    Shutdown,
}

/// Item on the completion queue.
pub(crate) enum Completion {
    Executed { id: TaskId, output: Option<Output> },
    Shutdown,
}

/// First control-loop failure; later ones are only logged.
#[derive(Default)]
struct LoopErrors {
    first: Mutex<Option<anyhow::Error>>,
}

impl LoopErrors {
    fn record(&self, name: &str, error: anyhow::Error) {
        let mut first = self.first.lock().unwrap_or_else(PoisonError::into_inner);
        if first.is_none() {
            tracing::error!(control_loop = name, error = %format!("{:#}", error), "control loop failed");
            *first = Some(error.context(format!("{} loop failed", name)));
        } else {
            tracing::error!(control_loop = name, error = %format!("{:#}", error), "additional control loop failure");
        }
    }

    fn record_join(&self, name: &str, joined: thread::Result<Result<()>>) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.record(name, e),
            Err(payload) => self.record(
                name,
                anyhow!("panicked: {}", workers::panic_message(payload.as_ref())),
            ),
        }
    }

    fn take(&self) -> Option<anyhow::Error> {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

pub struct TaskGraphExecutor {
    tasks: TaskProducer,
    config: ExecutorConfig,
    progress: Arc<dyn ProgressSink>,
    cancel: Cancellation,
}

impl TaskGraphExecutor {
    pub fn new<I>(tasks: I, config: ExecutorConfig, progress: Arc<dyn ProgressSink>) -> Self
    where
        I: IntoIterator<Item = Result<Box<dyn Task>>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            tasks: Box::new(tasks.into_iter()),
            config,
            progress,
            cancel: Cancellation::new(),
        }
    }

    /// Token that stops the run early. Clone it before calling `run`.
    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    /// Runs every task to completion.
    ///
    /// Returns `Ok(1)` if any task reported a fatal error, `Ok(0)` otherwise.
    /// Control-loop failures and cancellation are returned as `Err` after the
    /// worker threads have been joined; cancellation downcasts to `RunCancelled`.
    pub fn run(self) -> Result<i32> {
        let TaskGraphExecutor {
            tasks,
            config,
            progress,
            cancel,
        } = self;
        let max_workers = config.max_workers.max(1);
        let threads_per_worker = config.threads_per_worker.max(1);
        let worker_count = config.worker_count();

        let graph = TaskGraph::new(config.effective_top_level_task_limit());
        let buffer = TaskBuffer::new();
        let idle = IdleThreads::new();
        let failed = AtomicBool::new(false);
        let errors = LoopErrors::default();

        tracing::debug!(
            max_workers,
            threads_per_worker,
            top_level_task_limit = graph.top_level_task_limit(),
            "starting task graph executor"
        );

        let scoped = thread::scope(|s| -> Result<()> {
            let (signal_tx, signal_rx) = crossbeam_channel::bounded(worker_count + 1);
            let (task_tx, task_rx) = crossbeam_channel::bounded::<WorkItem>(1);
            let (output_tx, output_rx) = crossbeam_channel::bounded::<Completion>(worker_count);

            let factory = thread::Builder::new()
                .name("sluice-worker-factory".into())
                .spawn_scoped(s, {
                    let ctx = WorkerContext {
                        threads_per_worker,
                        task_tx: task_tx.clone(),
                        task_rx,
                        output_tx: output_tx.clone(),
                        idle: &idle,
                        progress: progress.as_ref(),
                    };
                    move || workers::run_worker_factory(signal_rx, ctx)
                })
                .context("spawn worker factory")?;
            signal_tx
                .send(FactorySignal::CreateWorker)
                .map_err(|_| anyhow!("worker factory stopped before start"))?;

            let handles = spawn_control_loops(
                s,
                tasks,
                (&graph, &buffer, &idle, &failed, &cancel),
                task_tx,
                signal_tx.clone(),
                output_rx,
                max_workers,
            );
            let (ingest, dispatch, completion) = match handles {
                Ok(h) => h,
                Err(e) => {
                    buffer.put(BufferItem::Shutdown, true);
                    let _ = signal_tx.send(FactorySignal::Shutdown);
                    return Err(e);
                }
            };

            errors.record_join("ingest", ingest.join());

            while !graph.wait_until_empty(DRAIN_POLL) {
                if cancel.is_cancelled() {
                    tracing::info!(remaining = graph.len(), "run cancelled; shutting down");
                    break;
                }
                if dispatch.is_finished() || completion.is_finished() {
                    tracing::warn!(remaining = graph.len(), "control loop stopped early; shutting down");
                    break;
                }
            }

            buffer.put(BufferItem::Shutdown, true);
            let _ = output_tx.send(Completion::Shutdown);
            drop(output_tx);
            errors.record_join("completion", completion.join());
            errors.record_join("dispatch", dispatch.join());

            let _ = signal_tx.send(FactorySignal::Shutdown);
            errors.record_join("worker factory", factory.join());
            Ok(())
        });

        if let Err(e) = scoped {
            errors.record("executor", e);
        }
        if let Some(e) = errors.take() {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(RunCancelled.into());
        }
        Ok(if failed.load(Ordering::Relaxed) { 1 } else { 0 })
    }
}

type Shared<'a> = (
    &'a TaskGraph,
    &'a TaskBuffer,
    &'a IdleThreads,
    &'a AtomicBool,
    &'a Cancellation,
);

type LoopHandle<'scope> = ScopedJoinHandle<'scope, Result<()>>;

fn spawn_control_loops<'scope, 'env>(
    s: &'scope thread::Scope<'scope, 'env>,
    tasks: TaskProducer,
    (graph, buffer, idle, failed, cancel): Shared<'env>,
    task_tx: crossbeam_channel::Sender<WorkItem>,
    signal_tx: crossbeam_channel::Sender<FactorySignal>,
    output_rx: crossbeam_channel::Receiver<Completion>,
    max_workers: usize,
) -> Result<(LoopHandle<'scope>, LoopHandle<'scope>, LoopHandle<'scope>)> {
    let completion = thread::Builder::new()
        .name("sluice-completion".into())
        .spawn_scoped(s, move || {
            loops::completion_loop(output_rx, graph, buffer, failed)
        })
        .context("spawn completion loop")?;
    let dispatcher = Dispatcher {
        buffer,
        task_tx,
        signal_tx,
        idle,
        max_workers,
        workers: 1,
    };
    let dispatch = thread::Builder::new()
        .name("sluice-dispatch".into())
        .spawn_scoped(s, move || dispatcher.run())
        .context("spawn dispatch loop")?;
    let ingest = thread::Builder::new()
        .name("sluice-ingest".into())
        .spawn_scoped(s, move || loops::ingest_loop(tasks, graph, buffer, cancel))
        .context("spawn ingest loop")?;
    Ok((ingest, dispatch, completion))
}
