//! Error type for object API requests, kept typed so retries can classify it.

/// Failure of one object API request.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Curl reported an error (timeout, connection, etc.).
    #[error("{0}")]
    Curl(#[from] curl::Error),
    /// Response had a non-2xx status.
    #[error("HTTP {status} from {url}")]
    Http { status: u32, url: String },
    /// The server closed the body early. Retried, resuming where possible.
    #[error("partial transfer: expected {expected} bytes, got {received}")]
    PartialTransfer { expected: u64, received: u64 },
    /// Writing the body to the destination stream failed. Not retried.
    #[error("storage: {0}")]
    Storage(#[source] std::io::Error),
    /// The server answered with something we cannot use.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// The request cannot be made (bad URL, unsupported resume).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
