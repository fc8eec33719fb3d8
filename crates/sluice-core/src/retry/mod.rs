//! Retry and backoff policy for object API requests.
//!
//! Classifies transport failures (timeouts, throttling, connection resets)
//! and computes exponential backoff so every API call shares one policy.

mod classify;
mod policy;
mod run;

pub use classify::{classify, classify_curl_error, classify_http_status};
pub use policy::{ErrorKind, RetryDecision, RetryPolicy};
pub use run::run_with_retry;
