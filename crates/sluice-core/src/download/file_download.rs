//! Top-level download of one object to one local file.

use std::sync::Arc;

use anyhow::{Context, Result};

use super::{ComponentInfo, DownloadContext, FilePartDownloadTask, FinalizeSlicedDownloadTask};
use crate::api::DownloadStrategy;
use crate::progress::{ProgressSink, ProgressUpdate};
use crate::resource::{FileObjectResource, ObjectResource};
use crate::segmenter;
use crate::storage;
use crate::task::{Output, Task};

pub struct FileDownloadTask {
    ctx: Arc<DownloadContext>,
    source: ObjectResource,
    destination: FileObjectResource,
    do_not_decompress: bool,
}

impl FileDownloadTask {
    pub fn new(ctx: Arc<DownloadContext>, source: ObjectResource, destination: FileObjectResource) -> Self {
        Self {
            ctx,
            source,
            destination,
            do_not_decompress: false,
        }
    }

    pub fn do_not_decompress(mut self, yes: bool) -> Self {
        self.do_not_decompress = yes;
        self
    }

    /// One component task per range plus a finalize task depending on all of them.
    fn sliced(&self, size: u64, components: Vec<segmenter::Segment>) -> Result<Output> {
        let final_path = self.destination.path();
        let temp = storage::temp_path(final_path);
        storage::create_file_if_needed(&temp, size)?;
        let total = components.len();
        tracing::info!(object = %self.source, size, components = total, "starting sliced download");

        let parts: Vec<Box<dyn Task>> = components
            .iter()
            .enumerate()
            .map(|(number, seg)| {
                Box::new(
                    FilePartDownloadTask::component(
                        Arc::clone(&self.ctx),
                        self.source.clone(),
                        FileObjectResource::new(&temp),
                        seg.start,
                        seg.len(),
                        ComponentInfo { number, total },
                    )
                    .do_not_decompress(self.do_not_decompress),
                ) as Box<dyn Task>
            })
            .collect();
        let finalize: Box<dyn Task> = Box::new(FinalizeSlicedDownloadTask::new(
            Arc::clone(&self.ctx),
            self.source.clone(),
            temp,
            final_path.to_path_buf(),
            total,
        ));
        Ok(Output::with_tasks(vec![parts, vec![finalize]]))
    }

    fn unsliced(&self, size: u64, progress: &dyn ProgressSink) -> Result<()> {
        let final_path = self.destination.path();
        let temp = storage::temp_path(final_path);
        let strategy = if size >= self.ctx.transfer.resumable_threshold {
            DownloadStrategy::Resumable
        } else {
            DownloadStrategy::OneShot
        };
        let mut part = FilePartDownloadTask::new(
            Arc::clone(&self.ctx),
            self.source.clone(),
            FileObjectResource::new(&temp),
            size,
            strategy,
        )
        .do_not_decompress(self.do_not_decompress);
        part.execute(progress)?;

        storage::finalize(&temp, final_path)?;
        self.ctx.trackers.delete_download_trackers(&self.source, &temp, 0)?;
        Ok(())
    }
}

impl Task for FileDownloadTask {
    fn execute(&mut self, progress: &dyn ProgressSink) -> Result<Option<Output>> {
        let size = self
            .source
            .size
            .with_context(|| format!("size of {} is unknown", self.source))?;
        let final_path = self.destination.path();
        if let Some(parent) = final_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
        }

        if size == 0 {
            std::fs::File::create(final_path)
                .with_context(|| format!("create {}", final_path.display()))?;
        } else {
            let transfer = &self.ctx.transfer;
            let components = segmenter::plan_components(
                size,
                transfer.sliced_object_download_component_size,
                transfer.sliced_object_download_max_components,
            );
            if self.ctx.should_slice(&self.source, size, components.len()) {
                return self.sliced(size, components).map(Some);
            }
            self.unsliced(size, progress)?;
        }

        tracing::info!(object = %self.source, destination = %final_path.display(), size, "download complete");
        progress.report(ProgressUpdate::FileCompleted {
            url: self.source.url.to_string(),
        });
        Ok(None)
    }

    fn describe(&self) -> String {
        format!("download {} to {}", self.source, self.destination.path().display())
    }
}
