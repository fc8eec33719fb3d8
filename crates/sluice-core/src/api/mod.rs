//! Object storage API used by transfer tasks.
//!
//! `CloudApi` is the seam between tasks and the network: tasks stream object
//! bytes into a local writer and list objects for wildcard expansion.
//! `HttpObjectApi` implements it over the GCS JSON/media endpoints with curl.

mod error;
mod http;

pub use error::ApiError;
pub use http::{HttpObjectApi, DEFAULT_ENDPOINT};

use std::io::Write;

use crate::resource::ObjectResource;

/// How a download may recover from a broken connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadStrategy {
    /// Single attempt from the first byte; a broken stream fails the download.
    #[default]
    OneShot,
    /// Broken streams are retried from the last byte written.
    Resumable,
}

/// Byte range and options for one `download_object` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRequest {
    pub start_byte: u64,
    /// Inclusive; `None` reads to the end of the object.
    pub end_byte: Option<u64>,
    /// Ask for stored (possibly gzip-encoded) bytes instead of transcoded ones.
    pub do_not_decompress: bool,
    pub strategy: DownloadStrategy,
}

impl DownloadRequest {
    pub fn range(start_byte: u64, end_byte: u64, strategy: DownloadStrategy) -> Self {
        Self {
            start_byte,
            end_byte: Some(end_byte),
            do_not_decompress: false,
            strategy,
        }
    }
}

/// Provider client. Shared by every worker thread.
pub trait CloudApi: Send + Sync {
    /// Streams the requested range of `resource` into `stream`, in order.
    /// On a resumable retry, bytes already written are not written again.
    fn download_object(
        &self,
        resource: &ObjectResource,
        stream: &mut dyn Write,
        request: &DownloadRequest,
    ) -> Result<(), ApiError>;

    /// Objects in `bucket` whose names start with `prefix`.
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectResource>, ApiError>;
}

