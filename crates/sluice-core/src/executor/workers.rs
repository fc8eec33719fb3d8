//! Worker factory thread and the worker threads it owns.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{Receiver, Sender};

use super::idle::IdleThreads;
use super::{Completion, WorkItem};
use crate::progress::ProgressSink;
use crate::task::{Message, Output};
use crate::task_graph::TaskWrapper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FactorySignal {
    /// Start one more worker group.
    CreateWorker,
    /// Stop every worker thread and exit.
    Shutdown,
}

/// Everything a worker thread needs, borrowed from the executor.
pub(super) struct WorkerContext<'a> {
    pub threads_per_worker: usize,
    pub task_tx: Sender<WorkItem>,
    pub task_rx: Receiver<WorkItem>,
    pub output_tx: Sender<Completion>,
    pub idle: &'a IdleThreads,
    pub progress: &'a dyn ProgressSink,
}

/// Runs until a `Shutdown` signal (or a closed signal channel). Worker threads
/// are spawned and joined only here.
pub(super) fn run_worker_factory(
    signals: Receiver<FactorySignal>,
    ctx: WorkerContext<'_>,
) -> anyhow::Result<()> {
    thread::scope(|s| {
        let mut threads = 0usize;
        let mut groups = 0usize;
        let mut spawn_error = None;
        loop {
            match signals.recv() {
                Ok(FactorySignal::CreateWorker) => {
                    groups += 1;
                    // Counted idle before they start, so a thread that takes a
                    // task right away always finds its own slot.
                    ctx.idle.release(ctx.threads_per_worker);
                    for n in 0..ctx.threads_per_worker {
                        let task_rx = ctx.task_rx.clone();
                        let output_tx = ctx.output_tx.clone();
                        let (idle, progress) = (ctx.idle, ctx.progress);
                        let spawned = thread::Builder::new()
                            .name(format!("sluice-worker-{}-{}", groups, n))
                            .spawn_scoped(s, move || {
                                worker_loop(task_rx, output_tx, idle, progress)
                            });
                        match spawned {
                            Ok(_) => threads += 1,
                            Err(e) => {
                                ctx.idle.acquire();
                                tracing::error!(error = %e, "failed to spawn worker thread");
                                spawn_error.get_or_insert(e);
                            }
                        }
                    }
                    if threads == 0 {
                        break;
                    }
                    tracing::debug!(groups, threads, "worker group started");
                }
                Ok(FactorySignal::Shutdown) | Err(_) => break,
            }
        }
        tracing::debug!(threads, "stopping worker threads");
        for _ in 0..threads {
            if ctx.task_tx.send(WorkItem::Shutdown).is_err() {
                break;
            }
        }
        match spawn_error {
            Some(e) => Err(anyhow::Error::new(e).context("spawn worker thread")),
            None => Ok(()),
        }
    })
}

fn worker_loop(
    task_rx: Receiver<WorkItem>,
    output_tx: Sender<Completion>,
    idle: &IdleThreads,
    progress: &dyn ProgressSink,
) {
    while let Ok(WorkItem::Run(wrapper)) = task_rx.recv() {
        let marked_busy = idle.acquire();
        debug_assert!(marked_busy, "worker thread took a task without an idle slot");
        let (id, output) = execute(wrapper, progress);
        if output_tx.send(Completion::Executed { id, output }).is_err() {
            tracing::warn!(task_id = id, "completion queue closed; dropping task result");
        }
        idle.release(1);
    }
}

/// Runs one task. Errors and panics become a fatal-error output when the task
/// reports errors, otherwise they are logged and dropped.
fn execute(wrapper: TaskWrapper, progress: &dyn ProgressSink) -> (u64, Option<Output>) {
    let (id, mut task) = wrapper.into_parts();
    let report = task.report_error();
    let failure = match panic::catch_unwind(AssertUnwindSafe(|| task.execute(progress))) {
        Ok(Ok(output)) => return (id, output),
        Ok(Err(e)) => format!("{:#}", e),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };
    if report {
        tracing::error!(task_id = id, task = %task.describe(), error = %failure, "task failed");
        (id, Some(Output::with_messages(vec![Message::fatal_error()])))
    } else {
        tracing::debug!(task_id = id, task = %task.describe(), error = %failure, "ignoring failure of best-effort task");
        (id, None)
    }
}

pub(super) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
