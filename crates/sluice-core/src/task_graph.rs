//! Dependency bookkeeping for a dynamically growing tree of tasks.
//!
//! Nodes live in an arena keyed by `TaskId`. A node records which nodes wait
//! on it (`dependent_ids`) and how many unfinished nodes it waits on
//! (`dependency_count`). Tasks are moved out of the arena when they become
//! executable, so a task is never held by the graph and a worker at once.
//!
//! Top-level tasks (no dependents) are admitted only while fewer than
//! `top_level_task_limit` of them are in the graph. A top-level node leaves
//! the graph only after its whole subtree has completed, so the limit bounds
//! total in-flight work, not only the number of producer tasks.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::task::{Message, Output, Task};

pub type TaskId = u64;

/// A task that is ready to run, tagged with its graph id.
pub struct TaskWrapper {
    id: TaskId,
    task: Box<dyn Task>,
}

impl TaskWrapper {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn into_parts(self) -> (TaskId, Box<dyn Task>) {
        (self.id, self.task)
    }
}

impl std::fmt::Debug for TaskWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWrapper")
            .field("id", &self.id)
            .field("task", &self.task.describe())
            .finish()
    }
}

struct Node {
    dependent_ids: Vec<TaskId>,
    dependency_count: usize,
    /// Set once the task has been handed out for execution.
    is_submitted: bool,
    is_top_level: bool,
    /// Body of a task that is waiting on dependencies.
    pending: Option<Box<dyn Task>>,
    received_messages: Vec<Message>,
    /// Messages of an executed task, forwarded once its children drain.
    outgoing_messages: Vec<Message>,
}

#[derive(Default)]
struct GraphState {
    next_id: TaskId,
    nodes: HashMap<TaskId, Node>,
    top_level_in_flight: usize,
}

impl GraphState {
    fn insert(&mut self, task: Box<dyn Task>, dependent_ids: Vec<TaskId>) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        for dependent in &dependent_ids {
            if let Some(node) = self.nodes.get_mut(dependent) {
                node.dependency_count += 1;
            }
        }
        let is_top_level = dependent_ids.is_empty();
        if is_top_level {
            self.top_level_in_flight += 1;
        }
        self.nodes.insert(
            id,
            Node {
                dependent_ids,
                dependency_count: 0,
                is_submitted: false,
                is_top_level,
                pending: Some(task),
                received_messages: Vec::new(),
                outgoing_messages: Vec::new(),
            },
        );
        id
    }

    /// Moves a task with no unmet dependencies out of the arena.
    fn take_ready(&mut self, id: TaskId) -> Option<TaskWrapper> {
        let node = self.nodes.get_mut(&id)?;
        let mut task = node.pending.take()?;
        node.is_submitted = true;
        let messages = std::mem::take(&mut node.received_messages);
        if !messages.is_empty() {
            task.receive_messages(messages);
        }
        Some(TaskWrapper { id, task })
    }
}

pub struct TaskGraph {
    state: Mutex<GraphState>,
    changed: Condvar,
    top_level_task_limit: usize,
}

impl TaskGraph {
    pub fn new(top_level_task_limit: usize) -> Self {
        Self {
            state: Mutex::new(GraphState::default()),
            changed: Condvar::new(),
            top_level_task_limit: top_level_task_limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn top_level_task_limit(&self) -> usize {
        self.top_level_task_limit
    }

    /// Registers a task and hands it back as an executable wrapper.
    ///
    /// With non-empty `dependent_ids` the task is a child and is always
    /// accepted. Otherwise it is a top-level task, accepted only below the
    /// top-level limit; on rejection the task is returned in `Err` and the
    /// caller should `wait_for_top_level_slot` and retry.
    pub fn add(
        &self,
        task: Box<dyn Task>,
        dependent_ids: Vec<TaskId>,
    ) -> Result<TaskWrapper, Box<dyn Task>> {
        let mut state = self.lock();
        if dependent_ids.is_empty() && state.top_level_in_flight >= self.top_level_task_limit {
            return Err(task);
        }
        let id = state.insert(task, dependent_ids);
        match state.take_ready(id) {
            Some(wrapper) => Ok(wrapper),
            None => unreachable!("freshly inserted task {} has no body", id),
        }
    }

    /// Records the result of an executed task and returns the tasks that became executable.
    pub fn update_from_executed_task(
        &self,
        executed_id: TaskId,
        output: Option<Output>,
    ) -> Vec<TaskWrapper> {
        let (layers, messages) = match output {
            Some(o) => (o.additional_task_iterators, o.messages),
            None => (Vec::new(), Vec::new()),
        };
        let layers: Vec<Vec<Box<dyn Task>>> =
            layers.into_iter().filter(|l| !l.is_empty()).collect();

        let mut state = self.lock();
        if layers.is_empty() {
            let ready = self.complete(&mut state, executed_id, messages);
            drop(state);
            self.changed.notify_all();
            return ready;
        }

        if let Some(node) = state.nodes.get_mut(&executed_id) {
            node.outgoing_messages = messages;
        }
        // The last layer waits on nothing but blocks the executed task; each
        // earlier layer blocks every task of the layer after it.
        let mut dependents = vec![executed_id];
        for layer in layers.into_iter().rev() {
            dependents = layer
                .into_iter()
                .map(|task| state.insert(task, dependents.clone()))
                .collect();
        }
        dependents
            .into_iter()
            .filter_map(|id| state.take_ready(id))
            .collect()
    }

    /// Removes a finished node, releasing dependents. Executed parents whose
    /// children have all drained are completed in turn.
    fn complete(
        &self,
        state: &mut GraphState,
        id: TaskId,
        messages: Vec<Message>,
    ) -> Vec<TaskWrapper> {
        let mut ready = Vec::new();
        let mut finished = vec![(id, messages)];
        while let Some((id, mut messages)) = finished.pop() {
            let Some(node) = state.nodes.remove(&id) else {
                tracing::error!(task_id = id, "completed task is not in the graph");
                continue;
            };
            if node.dependency_count != 0 {
                tracing::error!(
                    task_id = id,
                    remaining = node.dependency_count,
                    "task completed with unfinished dependencies"
                );
            }
            messages.extend(node.outgoing_messages);
            if node.is_top_level {
                state.top_level_in_flight -= 1;
            }
            for dependent_id in node.dependent_ids {
                let Some(dependent) = state.nodes.get_mut(&dependent_id) else {
                    continue;
                };
                dependent.received_messages.extend(messages.iter().cloned());
                dependent.dependency_count = dependent.dependency_count.saturating_sub(1);
                if dependent.dependency_count > 0 {
                    continue;
                }
                if dependent.is_submitted {
                    finished.push((dependent_id, Vec::new()));
                } else if let Some(wrapper) = state.take_ready(dependent_id) {
                    ready.push(wrapper);
                }
            }
        }
        ready
    }

    pub fn is_empty(&self) -> bool {
        self.lock().nodes.is_empty()
    }

    /// Number of tasks tracked, executing or waiting.
    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.lock().nodes.contains_key(&id)
    }

    /// Top-level tasks whose subtrees have not fully completed.
    pub fn top_level_in_flight(&self) -> usize {
        self.lock().top_level_in_flight
    }

    /// Blocks until the graph is empty or `timeout` elapses. Returns true if empty.
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| !s.nodes.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        state.nodes.is_empty()
    }

    /// Blocks until a top-level slot is free or `timeout` elapses. Returns true if free.
    pub fn wait_for_top_level_slot(&self, timeout: Duration) -> bool {
        let limit = self.top_level_task_limit;
        let state = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| s.top_level_in_flight >= limit)
            .unwrap_or_else(PoisonError::into_inner);
        state.top_level_in_flight < limit
    }
}
