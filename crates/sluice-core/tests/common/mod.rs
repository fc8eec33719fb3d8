//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod range_server;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use sluice_core::api::{ApiError, CloudApi, DownloadRequest};
use sluice_core::config::{ExecutorConfig, TransferConfig};
use sluice_core::download::DownloadContext;
use sluice_core::resource::{CloudUrl, ObjectResource};
use sluice_core::tracker::TrackerStore;

pub const BUCKET: &str = "bucket";

pub fn md5_b64(data: &[u8]) -> String {
    STANDARD.encode(md5::compute(data).0)
}

pub fn crc32c_b64(data: &[u8]) -> String {
    STANDARD.encode(crc32c::crc32c(data).to_be_bytes())
}

/// Bytes `1..=255` repeated: no zero bytes, so resume points are exact.
pub fn nonzero_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 255 + 1) as u8).collect()
}

struct FakeObject {
    /// What the server claims (hashes are computed from this).
    advertised: Vec<u8>,
    /// What the server actually streams.
    served: Vec<u8>,
}

/// In-memory object store. The next download can be made to fail after a
/// given number of bytes, like a dropped connection.
#[derive(Default)]
pub struct FakeApi {
    objects: Mutex<BTreeMap<String, FakeObject>>,
    fail_next_after: Mutex<Option<u64>>,
    bytes_served: AtomicU64,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, name: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(
            name.to_string(),
            FakeObject {
                advertised: data.clone(),
                served: data,
            },
        );
    }

    /// Advertises hashes of `advertised` but streams `served`.
    pub fn put_corrupt(&self, name: &str, advertised: Vec<u8>, served: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_string(), FakeObject { advertised, served });
    }

    pub fn fail_next_download_after(&self, bytes: u64) {
        *self.fail_next_after.lock().unwrap() = Some(bytes);
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::SeqCst)
    }

    /// Metadata of `name` as a listing would return it.
    pub fn object(&self, name: &str) -> ObjectResource {
        let objects = self.objects.lock().unwrap();
        let obj = &objects[name];
        ObjectResource::new(CloudUrl::new(BUCKET, name), obj.advertised.len() as u64)
            .with_md5(md5_b64(&obj.advertised))
            .with_crc32c(crc32c_b64(&obj.advertised))
            .with_generation("1")
    }
}

impl CloudApi for FakeApi {
    fn download_object(
        &self,
        resource: &ObjectResource,
        stream: &mut dyn Write,
        request: &DownloadRequest,
    ) -> Result<(), ApiError> {
        let data = {
            let objects = self.objects.lock().unwrap();
            match objects.get(&resource.url.object) {
                Some(obj) => obj.served.clone(),
                None => {
                    return Err(ApiError::Http {
                        status: 404,
                        url: resource.url.to_string(),
                    })
                }
            }
        };
        let start = request.start_byte as usize;
        let end = request
            .end_byte
            .map_or(data.len(), |e| (e as usize + 1).min(data.len()));
        let range = &data[start..end];
        let fail_after = self.fail_next_after.lock().unwrap().take();
        let (chunk, failed) = match fail_after {
            Some(n) if (n as usize) < range.len() => (&range[..n as usize], true),
            _ => (range, false),
        };
        for piece in chunk.chunks(64) {
            stream.write_all(piece).map_err(ApiError::Storage)?;
            self.bytes_served.fetch_add(piece.len() as u64, Ordering::SeqCst);
        }
        if failed {
            return Err(ApiError::PartialTransfer {
                expected: range.len() as u64,
                received: chunk.len() as u64,
            });
        }
        Ok(())
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectResource>, ApiError> {
        let names: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect();
        Ok(names
            .iter()
            .map(|n| {
                let mut o = self.object(n);
                o.url.bucket = bucket.to_string();
                o
            })
            .collect())
    }
}

pub fn download_context(
    api: Arc<dyn CloudApi>,
    tracker_dir: &Path,
    transfer: TransferConfig,
) -> Arc<DownloadContext> {
    Arc::new(
        DownloadContext::new(api, TrackerStore::new(tracker_dir), transfer).with_fast_crc32c(true),
    )
}

/// Small executor for tests.
pub fn executor_config(max_workers: usize, threads_per_worker: usize, limit: usize) -> ExecutorConfig {
    ExecutorConfig {
        max_workers,
        threads_per_worker,
        top_level_task_limit: Some(limit),
    }
}
