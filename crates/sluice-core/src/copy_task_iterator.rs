//! Turns expanded source objects into top-level download tasks.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::download::{DownloadContext, FileDownloadTask};
use crate::progress::{ProgressSink, ProgressUpdate};
use crate::resource::{CloudUrl, FileObjectResource, ObjectResource, Resource, CLOUD_DELIMITER};
use crate::task::Task;
use crate::wildcard;

/// Expanded source objects, in order. Errors (bad URL, failed listing, no
/// match) are yielded in place of the objects they would have produced.
pub type SourceIter = Box<dyn Iterator<Item = Result<ObjectResource>> + Send>;

/// Lazily expands each source URL string through `api` listings.
pub fn expand_sources(ctx: Arc<DownloadContext>, urls: Vec<String>) -> SourceIter {
    Box::new(urls.into_iter().flat_map(move |raw| {
        let expanded = CloudUrl::parse(&raw)
            .with_context(|| format!("invalid source URL {}", raw))
            .and_then(|url| {
                let objects = wildcard::expand_cloud_wildcard(ctx.api.as_ref(), &url)?;
                if objects.is_empty() {
                    anyhow::bail!("no URLs matched: {}", raw);
                }
                Ok(objects)
            });
        let items: Vec<Result<ObjectResource>> = match expanded {
            Ok(objects) => objects.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        };
        items
    }))
}

/// Estimated totals of the workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Workload {
    item_count: u64,
    size: u64,
}

/// Yields one `FileDownloadTask` per source object.
///
/// With several sources the destination must be a directory. Objects are
/// copied under their leaf name, so two sources that end in the same name
/// (`a/x` and `b/x` via `**`) are an error rather than a shared `.part` file.
/// Once the sources are exhausted the estimated workload is reported to the
/// progress sink.
pub struct CopyTaskIterator {
    ctx: Arc<DownloadContext>,
    sources: SourceIter,
    /// Sources pulled ahead to tell one source from many.
    lookahead: VecDeque<Result<ObjectResource>>,
    multiple_sources: bool,
    destination: Resource,
    do_not_decompress: bool,
    progress: Option<Arc<dyn ProgressSink>>,
    /// `None` once any source size was unknown.
    workload: Option<Workload>,
    /// Destination path -> source already copied there.
    claimed: HashMap<PathBuf, String>,
    done: bool,
}

impl CopyTaskIterator {
    pub fn new(ctx: Arc<DownloadContext>, mut sources: SourceIter, destination: &str) -> Result<Self> {
        let lookahead: VecDeque<_> = sources.by_ref().take(2).collect();
        let multiple_sources = lookahead.len() > 1;
        let destination = wildcard::resolve_file_destination(destination)?;
        if multiple_sources && !destination.is_container() {
            anyhow::bail!(
                "destination URL must name an existing directory. Provided: {}",
                destination.url_string()
            );
        }
        Ok(Self {
            ctx,
            sources,
            lookahead,
            multiple_sources,
            destination,
            do_not_decompress: false,
            progress: None,
            workload: Some(Workload::default()),
            claimed: HashMap::new(),
            done: false,
        })
    }

    pub fn do_not_decompress(mut self, yes: bool) -> Self {
        self.do_not_decompress = yes;
        self
    }

    /// Reports the workload estimate to `progress` once sources are exhausted.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn next_source(&mut self) -> Option<Result<ObjectResource>> {
        self.lookahead.pop_front().or_else(|| self.sources.next())
    }

    /// Local path `source` is copied to.
    fn destination_path(&self, source: &ObjectResource) -> PathBuf {
        match &self.destination {
            Resource::FileDirectory(dir) => dir.join(source.url.leaf_name()),
            Resource::File(f) => f.path.clone(),
            other => PathBuf::from(other.url_string()),
        }
    }

    fn update_workload(&mut self, source: &ObjectResource) {
        let Some(workload) = self.workload.as_mut() else {
            return;
        };
        match source.size {
            Some(size) => {
                workload.item_count += 1;
                workload.size += size;
            }
            None => {
                tracing::error!(object = %source, "could not get size of resource");
                self.workload = None;
            }
        }
    }

    fn report_workload(&self) {
        let (Some(progress), Some(workload)) = (&self.progress, self.workload) else {
            return;
        };
        if workload.item_count > 0 || workload.size > 0 {
            progress.report(ProgressUpdate::Workload {
                item_count: workload.item_count,
                size: workload.size,
            });
        }
    }
}

impl Iterator for CopyTaskIterator {
    type Item = Result<Box<dyn Task>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let source = match self.next_source() {
                Some(Ok(source)) => source,
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.done = true;
                    self.report_workload();
                    return None;
                }
            };
            // Folder placeholders have no file name to download to.
            if source.url.object.ends_with(CLOUD_DELIMITER) {
                tracing::debug!(
                    object = %source,
                    "skipping download since the destination ends in a delimiter"
                );
                continue;
            }
            let path = self.destination_path(&source);
            let source_url = source.url.versionless_url_string();
            if let Some(first) = self.claimed.get(&path) {
                return Some(Err(anyhow::anyhow!(
                    "{} and {} would both be copied to {}",
                    first,
                    source_url,
                    path.display()
                )));
            }
            self.claimed.insert(path.clone(), source_url.clone());
            tracing::info!(
                source = %source_url,
                destination = %path.display(),
                multiple = self.multiple_sources,
                "Copying"
            );
            self.update_workload(&source);
            let task = FileDownloadTask::new(Arc::clone(&self.ctx), source, FileObjectResource::new(path))
                .do_not_decompress(self.do_not_decompress);
            return Some(Ok(Box::new(task)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, CloudApi, DownloadRequest};
    use crate::config::TransferConfig;
    use crate::tracker::TrackerStore;
    use std::sync::Mutex;

    struct Listing(Vec<&'static str>);

    impl CloudApi for Listing {
        fn download_object(
            &self,
            _resource: &ObjectResource,
            _stream: &mut dyn std::io::Write,
            _request: &DownloadRequest,
        ) -> Result<(), ApiError> {
            Err(ApiError::InvalidRequest("listing only".into()))
        }

        fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectResource>, ApiError> {
            Ok(self
                .0
                .iter()
                .filter(|n| n.starts_with(prefix))
                .map(|n| ObjectResource::new(CloudUrl::new(bucket, *n), 10))
                .collect())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressUpdate>>);

    impl ProgressSink for Recorder {
        fn report(&self, update: ProgressUpdate) {
            self.0.lock().unwrap().push(update);
        }
    }

    fn ctx() -> Arc<DownloadContext> {
        Arc::new(DownloadContext::new(
            Arc::new(Listing(vec!["d/a.txt", "d/b.txt", "d/sub/", "e.txt"])),
            TrackerStore::new("/nonexistent"),
            TransferConfig::default(),
        ))
    }

    fn sources(urls: &[&str]) -> SourceIter {
        expand_sources(ctx(), urls.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn multiple_sources_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let it = CopyTaskIterator::new(ctx(), sources(&["gs://b/d/*"]), &dir.path().display().to_string())
            .unwrap()
            .with_progress(recorder.clone());
        let tasks: Vec<_> = it.map(|t| t.unwrap().describe()).collect();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].ends_with(&format!("{}", dir.path().join("a.txt").display())));
        assert_eq!(
            recorder.0.lock().unwrap().as_slice(),
            &[ProgressUpdate::Workload { item_count: 2, size: 20 }]
        );
    }

    #[test]
    fn multiple_sources_into_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("single.bin");
        let result = CopyTaskIterator::new(ctx(), sources(&["gs://b/d/*"]), &dest.display().to_string());
        assert!(result.is_err());
    }

    #[test]
    fn single_source_to_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("renamed.txt");
        let mut it = CopyTaskIterator::new(ctx(), sources(&["gs://b/e.txt"]), &dest.display().to_string()).unwrap();
        let task = it.next().unwrap().unwrap();
        assert!(task.describe().ends_with("renamed.txt"));
        assert!(it.next().is_none());
    }

    #[test]
    fn unmatched_source_is_an_error_item() {
        let dir = tempfile::tempdir().unwrap();
        let mut it = CopyTaskIterator::new(
            ctx(),
            sources(&["gs://b/e.txt", "gs://b/missing*"]),
            &dir.path().display().to_string(),
        )
        .unwrap();
        assert!(it.next().unwrap().is_ok());
        let err = it.next().unwrap().err().unwrap();
        assert!(err.to_string().contains("no URLs matched"));
    }

    #[test]
    fn sources_sharing_a_leaf_name_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(DownloadContext::new(
            Arc::new(Listing(vec!["a/x", "b/x", "b/y"])),
            TrackerStore::new("/nonexistent"),
            TransferConfig::default(),
        ));
        let sources = expand_sources(Arc::clone(&ctx), vec!["gs://b/**".to_string()]);
        let mut it = CopyTaskIterator::new(ctx, sources, &dir.path().display().to_string()).unwrap();

        let first = it.next().unwrap().unwrap();
        assert!(first.describe().ends_with(&format!("{}", dir.path().join("x").display())));
        let err = it.next().unwrap().err().unwrap().to_string();
        assert!(err.contains("gs://b/a/x") && err.contains("gs://b/b/x"), "{}", err);
        // Later sources with distinct names are still yielded.
        let last = it.next().unwrap().unwrap();
        assert!(last.describe().ends_with(&format!("{}", dir.path().join("y").display())));
    }

    #[test]
    fn folder_placeholders_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let it = CopyTaskIterator::new(
            ctx(),
            Box::new(vec![Ok(ObjectResource::new(CloudUrl::new("b", "d/sub/"), 0))].into_iter()),
            &dir.path().display().to_string(),
        )
        .unwrap();
        assert_eq!(it.count(), 0);
    }
}
