pub mod config;
pub mod logging;

pub mod api;
pub mod checksum;
pub mod control;
pub mod copy_task_iterator;
pub mod download;
pub mod executor;
pub mod progress;
pub mod resource;
pub mod retry;
pub mod segmenter;
pub mod storage;
pub mod task;
pub mod task_buffer;
pub mod task_graph;
pub mod tracker;
pub mod wildcard;
