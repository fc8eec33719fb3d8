//! Download of one byte range: a whole object, or one component of a sliced
//! download.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::DownloadContext;
use crate::api::{DownloadRequest, DownloadStrategy};
use crate::checksum::{self, Digesters, HashAlgorithm};
use crate::progress::ProgressSink;
use crate::resource::{FileObjectResource, ObjectResource};
use crate::storage::{self, RangeWriter, WriteMode};
use crate::task::{Message, Output, Task};
use crate::tracker::ComponentKey;

/// Position of a component within its sliced download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentInfo {
    pub number: usize,
    pub total: usize,
}

pub struct FilePartDownloadTask {
    ctx: Arc<DownloadContext>,
    source: ObjectResource,
    destination: FileObjectResource,
    offset: u64,
    length: u64,
    component: Option<ComponentInfo>,
    do_not_decompress: bool,
    strategy: DownloadStrategy,
}

impl FilePartDownloadTask {
    /// Whole-object download into `destination`.
    pub fn new(
        ctx: Arc<DownloadContext>,
        source: ObjectResource,
        destination: FileObjectResource,
        length: u64,
        strategy: DownloadStrategy,
    ) -> Self {
        Self {
            ctx,
            source,
            destination,
            offset: 0,
            length,
            component: None,
            do_not_decompress: false,
            strategy,
        }
    }

    /// Component `component.number` of a sliced download, covering
    /// `[offset, offset + length)` of an already preallocated `destination`.
    pub fn component(
        ctx: Arc<DownloadContext>,
        source: ObjectResource,
        destination: FileObjectResource,
        offset: u64,
        length: u64,
        component: ComponentInfo,
    ) -> Self {
        Self {
            ctx,
            source,
            destination,
            offset,
            length,
            component: Some(component),
            do_not_decompress: false,
            strategy: DownloadStrategy::Resumable,
        }
    }

    pub fn do_not_decompress(mut self, yes: bool) -> Self {
        self.do_not_decompress = yes;
        self
    }

    fn path(&self) -> &Path {
        self.destination.path()
    }

    fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Fetches `[start, end)` into the destination at `start`.
    fn fetch(
        &self,
        start: u64,
        mode: WriteMode,
        digesters: &mut Digesters,
        progress: &dyn ProgressSink,
    ) -> Result<u64> {
        let file = storage::open_for_write(self.path(), mode, start)?;
        let mut writer = RangeWriter::new(file, digesters, progress, self.source.url.to_string());
        if start < self.end() {
            let mut request = DownloadRequest::range(start, self.end() - 1, self.strategy);
            request.do_not_decompress = self.do_not_decompress;
            self.ctx
                .api
                .download_object(&self.source, &mut writer, &request)
                .with_context(|| format!("download {} bytes {}-{}", self.source, start, self.end() - 1))?;
        }
        let written = writer
            .finish()
            .with_context(|| format!("sync {}", self.path().display()))?;
        Ok(written)
    }

    fn validate_md5(&self, digesters: &Digesters) -> Result<()> {
        let local = digesters.local_hashes();
        if !local.contains_key(&HashAlgorithm::Md5) {
            return Ok(());
        }
        checksum::validate_download_hash_and_delete_corrupt_files(self.path(), &self.source, &local)
    }

    /// Where a resumable download of this range picks up: the first
    /// unwritten byte if a tracker confirms the existing bytes, else `offset`.
    fn resume_point(&self, component: Option<ComponentKey>) -> Result<u64> {
        let (_, found) = self
            .ctx
            .trackers
            .read_or_create(&self.source, self.path(), component)?;
        if !found {
            return Ok(self.offset);
        }
        storage::first_null_byte_index(self.path(), self.offset, self.end())
    }

    fn download_whole_object(&self, progress: &dyn ProgressSink) -> Result<()> {
        let mut digesters = self.ctx.digesters_for(&self.source, false)?;
        match self.strategy {
            DownloadStrategy::OneShot => {
                self.fetch(self.offset, WriteMode::Truncate, &mut digesters, progress)?;
            }
            DownloadStrategy::Resumable => {
                storage::create_file_if_needed(self.path(), self.length)?;
                let start = self.resume_point(None)?;
                let mode = if start > self.offset {
                    tracing::info!(
                        object = %self.source,
                        destination = %self.path().display(),
                        resume_from = start,
                        "Resuming download"
                    );
                    checksum::hash_file_range(self.path(), self.offset, start, &mut digesters)?;
                    WriteMode::Modify
                } else {
                    WriteMode::Truncate
                };
                self.fetch(start, mode, &mut digesters, progress)?;
            }
        }
        self.validate_md5(&digesters)
    }

    fn download_component(
        &self,
        info: ComponentInfo,
        progress: &dyn ProgressSink,
    ) -> Result<Option<Output>> {
        let mut digesters = self.ctx.digesters_for(&self.source, true)?;
        let key = ComponentKey {
            component_number: info.number,
            slice_start_byte: self.offset,
        };
        let start = match self.strategy {
            DownloadStrategy::Resumable => self.resume_point(Some(key))?,
            DownloadStrategy::OneShot => self.offset,
        };
        if start > self.offset {
            checksum::hash_file_range(self.path(), self.offset, start, &mut digesters)?;
            if start >= self.end() {
                tracing::info!(object = %self.source, component = info.number, "component already downloaded");
            } else {
                tracing::info!(
                    object = %self.source,
                    component = info.number,
                    resume_from = start,
                    "Resuming download"
                );
            }
        }
        if start < self.end() {
            self.fetch(start, WriteMode::Modify, &mut digesters, progress)?;
        }
        tracing::debug!(object = %self.source, component = info.number, total = info.total, "component done");

        let Some(crc) = digesters.get(HashAlgorithm::Crc32c).and_then(|d| d.crc32c()) else {
            return Ok(None);
        };
        Ok(Some(Output::with_messages(vec![Message::crc32c(
            info.number,
            crc,
            self.length,
        )])))
    }
}

impl Task for FilePartDownloadTask {
    fn execute(&mut self, progress: &dyn ProgressSink) -> Result<Option<Output>> {
        match self.component {
            None => {
                self.download_whole_object(progress)?;
                Ok(None)
            }
            // A failed component is reported to the finalize task, which
            // fails the object and keeps the partial file for a later resume.
            Some(info) => match self.download_component(info, progress) {
                Ok(output) => Ok(output),
                Err(e) => {
                    tracing::warn!(object = %self.source, component = info.number, error = %format!("{:#}", e), "component failed");
                    Ok(Some(Output::with_messages(vec![Message::error(format!(
                        "component {} of {}: {:#}",
                        info.number, self.source, e
                    ))])))
                }
            },
        }
    }

    fn describe(&self) -> String {
        match self.component {
            Some(info) => format!(
                "download component {}/{} of {} to {}",
                info.number + 1,
                info.total,
                self.source,
                self.path().display()
            ),
            None => format!("download {} to {}", self.source, self.path().display()),
        }
    }
}
