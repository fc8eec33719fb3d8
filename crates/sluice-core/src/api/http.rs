//! `CloudApi` over the GCS JSON and media endpoints, using the curl crate.
//!
//! Downloads are ranged GETs against `/download/storage/v1/b/{bucket}/o/{object}?alt=media`.
//! Listings page through `/storage/v1/b/{bucket}/o`. Every request goes
//! through the shared retry policy; resumable downloads continue from the
//! last byte written instead of starting over.

use std::cell::Cell;
use std::collections::HashMap;
use std::io::Write;
use std::str;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use super::{ApiError, CloudApi, DownloadRequest, DownloadStrategy};
use crate::resource::{CloudUrl, ObjectResource};
use crate::retry::{run_with_retry, RetryPolicy};

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com/";

/// Error bodies are kept for logging only; cap what we buffer.
const MAX_ERROR_BODY: usize = 4096;

pub struct HttpObjectApi {
    endpoint: Url,
    headers: HashMap<String, String>,
    retry: RetryPolicy,
}

impl HttpObjectApi {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid URL"),
            headers: HashMap::new(),
            retry,
        }
    }

    /// Use another base URL (emulators, tests).
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self, ApiError> {
        self.endpoint = Url::parse(endpoint)
            .map_err(|e| ApiError::InvalidRequest(format!("endpoint {:?}: {}", endpoint, e)))?;
        Ok(self)
    }

    /// Extra header sent with every request (e.g. `Authorization`).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    fn url_with_segments(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidRequest(format!("endpoint {} cannot be a base", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Media URL of an object; `/` in the object name is percent-encoded.
    pub fn media_url(&self, resource: &ObjectResource) -> Result<Url, ApiError> {
        let url = &resource.url;
        let mut out = self.url_with_segments(&[
            "download", "storage", "v1", "b", &url.bucket, "o", &url.object,
        ])?;
        {
            let mut query = out.query_pairs_mut();
            query.append_pair("alt", "media");
            if let Some(generation) = &resource.generation {
                query.append_pair("generation", generation);
            }
        }
        Ok(out)
    }

    fn list_url(&self, bucket: &str, prefix: &str, page_token: Option<&str>) -> Result<Url, ApiError> {
        let mut out = self.url_with_segments(&["storage", "v1", "b", bucket, "o"])?;
        {
            let mut query = out.query_pairs_mut();
            if !prefix.is_empty() {
                query.append_pair("prefix", prefix);
            }
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        Ok(out)
    }

    fn easy(&self, url: &str, extra_headers: &[&str]) -> Result<curl::easy::Easy, ApiError> {
        let mut easy = curl::easy::Easy::new();
        easy.url(url)?;
        easy.follow_location(true)?;
        easy.max_redirections(10)?;
        easy.connect_timeout(Duration::from_secs(30))?;
        // Abort if throughput drops below 1 KiB/s for 60s rather than using a hard wall-clock timeout.
        easy.low_speed_limit(1024)?;
        easy.low_speed_time(Duration::from_secs(60))?;

        let mut list = curl::easy::List::new();
        for (k, v) in &self.headers {
            list.append(&format!("{}: {}", k.trim(), v.trim()))?;
        }
        for h in extra_headers {
            list.append(h)?;
        }
        easy.http_headers(list)?;
        Ok(easy)
    }

    /// One ranged GET. Adds the number of bytes written to `stream` to `written`.
    fn fetch_range(
        &self,
        url: &str,
        stream: &mut dyn Write,
        start: u64,
        end: Option<u64>,
        do_not_decompress: bool,
        written: &mut u64,
    ) -> Result<(), ApiError> {
        let extra: &[&str] = if do_not_decompress {
            &["Accept-Encoding: gzip"]
        } else {
            &[]
        };
        let mut easy = self.easy(url, extra)?;
        let ranged = start > 0 || end.is_some();
        if ranged {
            let range = match end {
                Some(end) => format!("{}-{}", start, end),
                None => format!("{}-", start),
            };
            easy.range(&range)?;
        }
        let expected = end.map(|end| (end + 1).saturating_sub(start));

        let status = Cell::new(0u32);
        let mut received = 0u64;
        let mut storage_error: Option<std::io::Error> = None;
        let mut overflow = false;
        let mut error_body = Vec::new();
        let performed = {
            let mut transfer = easy.transfer();
            transfer.header_function(|line| {
                if let Some(code) = parse_status_line(line) {
                    status.set(code);
                }
                true
            })?;
            transfer.write_function(|data| {
                if !(200..300).contains(&status.get()) {
                    if error_body.len() < MAX_ERROR_BODY {
                        error_body.extend_from_slice(data);
                    }
                    return Ok(data.len());
                }
                let mut chunk = data;
                if let Some(expected) = expected {
                    let room = expected.saturating_sub(received) as usize;
                    if chunk.len() > room {
                        chunk = &chunk[..room];
                        overflow = true;
                    }
                }
                if let Err(e) = stream.write_all(chunk) {
                    storage_error = Some(e);
                    return Ok(0);
                }
                received += chunk.len() as u64;
                Ok(if overflow { 0 } else { data.len() })
            })?;
            transfer.perform()
        };
        *written += received;

        if let Err(e) = performed {
            if let Some(io) = storage_error {
                return Err(ApiError::Storage(io));
            }
            if overflow {
                return Err(ApiError::InvalidResponse(format!(
                    "{} sent more than the requested {} bytes",
                    url,
                    expected.unwrap_or(0)
                )));
            }
            return Err(ApiError::Curl(e));
        }

        let code = easy.response_code()?;
        if !(200..300).contains(&code) {
            tracing::debug!(
                status = code,
                body = %String::from_utf8_lossy(&error_body),
                "object request failed"
            );
            return Err(ApiError::Http {
                status: code,
                url: url.to_string(),
            });
        }
        if start > 0 && code != 206 {
            return Err(ApiError::InvalidResponse(format!(
                "{} ignored the range request (HTTP {})",
                url, code
            )));
        }
        if let Some(expected) = expected {
            if received != expected {
                return Err(ApiError::PartialTransfer { expected, received });
            }
        }
        Ok(())
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        run_with_retry(&self.retry, |_| {
            let mut body = Vec::new();
            let mut written = 0;
            self.fetch_range(url, &mut body, 0, None, false, &mut written)?;
            Ok(body)
        })
    }
}

impl CloudApi for HttpObjectApi {
    fn download_object(
        &self,
        resource: &ObjectResource,
        stream: &mut dyn Write,
        request: &DownloadRequest,
    ) -> Result<(), ApiError> {
        let url = self.media_url(resource)?.to_string();
        let mut written = 0u64;
        run_with_retry(&self.retry, |attempt| {
            let start = request.start_byte + written;
            if let Some(end) = request.end_byte {
                if start > end {
                    return Ok(());
                }
            }
            if attempt > 1 {
                tracing::info!(object = %resource, start, attempt, "resuming download");
            }
            let result = self.fetch_range(
                &url,
                &mut *stream,
                start,
                request.end_byte,
                request.do_not_decompress,
                &mut written,
            );
            match result {
                Err(e) if request.strategy == DownloadStrategy::OneShot && written > 0 => {
                    Err(ApiError::InvalidResponse(format!(
                        "{}; one-shot download cannot continue after {} bytes",
                        e, written
                    )))
                }
                other => other,
            }
        })
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectResource>, ApiError> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = self.list_url(bucket, prefix, page_token.as_deref())?;
            let body = self.get_bytes(url.as_str())?;
            let page: ObjectList = serde_json::from_slice(&body)
                .map_err(|e| ApiError::InvalidResponse(format!("object listing: {}", e)))?;
            for item in page.items {
                out.push(item.into_resource(bucket)?);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectMetadata>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Subset of the JSON object resource. Integers arrive as strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMetadata {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    md5_hash: Option<String>,
    #[serde(default)]
    crc32c: Option<String>,
    #[serde(default)]
    generation: Option<String>,
}

impl ObjectMetadata {
    fn into_resource(self, bucket: &str) -> Result<ObjectResource, ApiError> {
        let size = match &self.size {
            Some(s) => Some(s.parse::<u64>().map_err(|_| {
                ApiError::InvalidResponse(format!("object {} has size {:?}", self.name, s))
            })?),
            None => None,
        };
        Ok(ObjectResource {
            url: CloudUrl::new(bucket, self.name),
            size,
            md5_hash: self.md5_hash,
            crc32c_hash: self.crc32c,
            generation: self.generation,
        })
    }
}

/// Status code from an `HTTP/x.y NNN reason` header line.
fn parse_status_line(line: &[u8]) -> Option<u32> {
    let line = str::from_utf8(line).ok()?;
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> HttpObjectApi {
        HttpObjectApi::new(RetryPolicy::no_retry())
    }

    #[test]
    fn media_url_encodes_object_name() {
        let res = ObjectResource::new(CloudUrl::new("my-bucket", "dir/a b.txt"), 3).with_generation("42");
        let url = api().media_url(&res).unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/download/storage/v1/b/my-bucket/o/dir%2Fa%20b.txt?alt=media&generation=42"
        );
    }

    #[test]
    fn list_url_with_prefix_and_token() {
        let url = api()
            .with_endpoint("http://127.0.0.1:9000/")
            .unwrap()
            .list_url("b", "logs/2024", Some("tok"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9000/storage/v1/b/b/o?prefix=logs%2F2024&pageToken=tok"
        );
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_line(b"HTTP/1.1 206 Partial Content\r\n"), Some(206));
        assert_eq!(parse_status_line(b"HTTP/2 200\r\n"), Some(200));
        assert_eq!(parse_status_line(b"Content-Length: 5\r\n"), None);
    }

    #[test]
    fn listing_json_maps_to_resources() {
        let json = br#"{"items":[{"name":"a/b","size":"12","md5Hash":"x","crc32c":"y","generation":"7"}],"nextPageToken":""}"#;
        let page: ObjectList = serde_json::from_slice(json).unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some(""));
        let res = page.items.into_iter().next().unwrap().into_resource("bkt").unwrap();
        assert_eq!(res.url.to_string(), "gs://bkt/a/b");
        assert_eq!(res.size, Some(12));
        assert_eq!(res.crc32c_hash.as_deref(), Some("y"));
        assert_eq!(res.generation.as_deref(), Some("7"));
    }
}
