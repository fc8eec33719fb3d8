//! Last step of a sliced download: reduce component checksums, validate, rename.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use super::DownloadContext;
use crate::checksum::{self, HashAlgorithm};
use crate::config::HashCheck;
use crate::progress::{ProgressSink, ProgressUpdate};
use crate::resource::ObjectResource;
use crate::storage;
use crate::task::{Message, MessagePayload, Output, Task};

pub struct FinalizeSlicedDownloadTask {
    ctx: Arc<DownloadContext>,
    source: ObjectResource,
    temp_path: PathBuf,
    final_path: PathBuf,
    total_components: usize,
    received: Vec<Message>,
}

impl FinalizeSlicedDownloadTask {
    pub fn new(
        ctx: Arc<DownloadContext>,
        source: ObjectResource,
        temp_path: PathBuf,
        final_path: PathBuf,
        total_components: usize,
    ) -> Self {
        Self {
            ctx,
            source,
            temp_path,
            final_path,
            total_components,
            received: Vec::new(),
        }
    }

    /// `(component_number, crc, length)` of every reported component, in file order.
    fn component_checksums(&self) -> Vec<(usize, u32, u64)> {
        let mut parts: Vec<_> = self
            .received
            .iter()
            .filter_map(|m| match m.payload {
                MessagePayload::Crc32c {
                    component_number,
                    crc32c_checksum,
                    length,
                } => Some((component_number, crc32c_checksum, length)),
                _ => None,
            })
            .collect();
        parts.sort_by_key(|p| p.0);
        parts.dedup_by_key(|p| p.0);
        parts
    }

    fn validate(&self) -> Result<()> {
        if self.ctx.transfer.check_hashes == HashCheck::Never || self.source.crc32c_hash.is_none() {
            return Ok(());
        }
        let parts = self.component_checksums();
        if parts.len() != self.total_components {
            tracing::warn!(
                object = %self.source,
                received = parts.len(),
                expected = self.total_components,
                "missing component checksums; skipping validation"
            );
            return Ok(());
        }
        let combined = checksum::crc32c_combine_all(
            &parts.iter().map(|&(_, crc, len)| (crc, len)).collect::<Vec<_>>(),
        );
        let mut local = BTreeMap::new();
        local.insert(HashAlgorithm::Crc32c, checksum::crc32c_to_base64(combined));
        let result = checksum::validate_download_hash_and_delete_corrupt_files(
            &self.temp_path,
            &self.source,
            &local,
        );
        if result.is_err() {
            // Trackers must not outlive the deleted temp file.
            self.ctx
                .trackers
                .delete_download_trackers(&self.source, &self.temp_path, self.total_components)?;
        }
        result
    }
}

impl Task for FinalizeSlicedDownloadTask {
    fn execute(&mut self, progress: &dyn ProgressSink) -> Result<Option<Output>> {
        let errors: Vec<&str> = self
            .received
            .iter()
            .filter_map(|m| match &m.payload {
                MessagePayload::Error(e) => Some(e.as_str()),
                _ => None,
            })
            .collect();
        if !errors.is_empty() {
            anyhow::bail!(
                "{} of {} components of {} failed; partial download kept at {}: {}",
                errors.len(),
                self.total_components,
                self.source,
                self.temp_path.display(),
                errors.join("; ")
            );
        }

        self.validate()?;
        storage::finalize(&self.temp_path, &self.final_path)?;
        self.ctx
            .trackers
            .delete_download_trackers(&self.source, &self.temp_path, self.total_components)?;

        tracing::info!(
            object = %self.source,
            destination = %self.final_path.display(),
            components = self.total_components,
            "sliced download complete"
        );
        progress.report(ProgressUpdate::FileCompleted {
            url: self.source.url.to_string(),
        });
        Ok(None)
    }

    fn receive_messages(&mut self, messages: Vec<Message>) {
        self.received.extend(messages);
    }

    fn describe(&self) -> String {
        format!("finalize sliced download of {} to {}", self.source, self.final_path.display())
    }
}
