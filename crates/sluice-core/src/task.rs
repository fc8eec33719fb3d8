//! Units of work run by the executor and what they report back.

use crate::progress::ProgressSink;

/// What a message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Checksum of one component of a sliced download.
    Crc32c,
    /// A task failed but the run should continue.
    Error,
    /// The run must finish with a non-zero exit code.
    FatalError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    None,
    Crc32c {
        component_number: usize,
        crc32c_checksum: u32,
        length: u64,
    },
    Error(String),
}

/// Typed payload a task emits alongside its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Topic,
    pub payload: MessagePayload,
}

impl Message {
    pub fn fatal_error() -> Self {
        Self {
            topic: Topic::FatalError,
            payload: MessagePayload::None,
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self {
            topic: Topic::Error,
            payload: MessagePayload::Error(description.into()),
        }
    }

    pub fn crc32c(component_number: usize, crc32c_checksum: u32, length: u64) -> Self {
        Self {
            topic: Topic::Crc32c,
            payload: MessagePayload::Crc32c {
                component_number,
                crc32c_checksum,
                length,
            },
        }
    }
}

/// Result of executing a task.
///
/// `additional_task_iterators` is a list of layers. Every task in layer `i`
/// must complete before tasks in layer `i + 1` may run, and the task that
/// produced the output only completes once the last layer has drained.
#[derive(Default)]
pub struct Output {
    pub additional_task_iterators: Vec<Vec<Box<dyn Task>>>,
    pub messages: Vec<Message>,
}

impl Output {
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            additional_task_iterators: Vec::new(),
            messages,
        }
    }

    pub fn with_tasks(layers: Vec<Vec<Box<dyn Task>>>) -> Self {
        Self {
            additional_task_iterators: layers,
            messages: Vec::new(),
        }
    }

    pub fn has_fatal_error(&self) -> bool {
        self.messages.iter().any(|m| m.topic == Topic::FatalError)
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field(
                "layers",
                &self
                    .additional_task_iterators
                    .iter()
                    .map(Vec::len)
                    .collect::<Vec<_>>(),
            )
            .field("messages", &self.messages)
            .finish()
    }
}

/// A unit of work. Executed at most once, by exactly one worker thread.
pub trait Task: Send {
    fn execute(&mut self, progress: &dyn ProgressSink) -> anyhow::Result<Option<Output>>;

    /// If true, an error returned from `execute` fails the whole run.
    /// Best-effort tasks return false and their failures are only logged.
    fn report_error(&self) -> bool {
        true
    }

    /// Messages produced by the tasks this one waited on, delivered before `execute`.
    fn receive_messages(&mut self, _messages: Vec<Message>) {}

    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Task").field(&self.describe()).finish()
    }
}
