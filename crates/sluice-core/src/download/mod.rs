//! Object download tasks.
//!
//! - `FileDownloadTask`: top-level, one per object. Small objects are fetched
//!   inline; large ones fan out into component tasks plus a finalize task.
//! - `FilePartDownloadTask`: one byte range, whole object or one component.
//! - `FinalizeSlicedDownloadTask`: checks the combined component CRC32C and
//!   moves the temp file into place.

mod file_download;
mod file_part;
mod finalize;

pub use file_download::FileDownloadTask;
pub use file_part::{ComponentInfo, FilePartDownloadTask};
pub use finalize::FinalizeSlicedDownloadTask;

use std::sync::Arc;

use anyhow::Result;

use crate::api::CloudApi;
use crate::checksum::{self, Digesters, HashAlgorithm};
use crate::config::{HashCheck, TransferConfig};
use crate::resource::ObjectResource;
use crate::tracker::TrackerStore;

/// State shared by every download task of a run.
pub struct DownloadContext {
    pub api: Arc<dyn CloudApi>,
    pub trackers: TrackerStore,
    pub transfer: TransferConfig,
    fast_crc32c: bool,
}

impl DownloadContext {
    pub fn new(api: Arc<dyn CloudApi>, trackers: TrackerStore, transfer: TransferConfig) -> Self {
        Self {
            api,
            trackers,
            transfer,
            fast_crc32c: checksum::is_fast_crc32c_available(),
        }
    }

    /// Overrides hardware CRC32C detection.
    pub fn with_fast_crc32c(mut self, fast: bool) -> Self {
        self.fast_crc32c = fast;
        self
    }

    /// Digesters for one download of `source`.
    ///
    /// Whole-object downloads get MD5 when the server reports one. Components
    /// of a sliced download get CRC32C when the server reports one and it is
    /// fast here or checking is forced.
    pub fn digesters_for(&self, source: &ObjectResource, is_component: bool) -> Result<Digesters> {
        let check = self.transfer.check_hashes;
        if check == HashCheck::Never {
            return Ok(Digesters::new());
        }
        if !is_component {
            if source.md5_hash.is_some() {
                return Ok(Digesters::with(&[HashAlgorithm::Md5]));
            }
            return Ok(Digesters::new());
        }
        if source.crc32c_hash.is_none() {
            return Ok(Digesters::new());
        }
        if self.fast_crc32c || check == HashCheck::Always {
            return Ok(Digesters::with(&[HashAlgorithm::Crc32c]));
        }
        if check == HashCheck::IfFastElseFail {
            anyhow::bail!(
                "cannot validate {}: no fast CRC32C implementation and check_hashes is if_fast_else_fail",
                source
            );
        }
        tracing::warn!(object = %source, "no fast CRC32C implementation; skipping validation");
        Ok(Digesters::new())
    }

    /// Whether an object of `size` bytes split into `components` ranges should
    /// be downloaded as a sliced download.
    pub fn should_slice(&self, source: &ObjectResource, size: u64, components: usize) -> bool {
        if size < self.transfer.sliced_object_download_threshold || components < 2 {
            return false;
        }
        match self.transfer.check_hashes {
            HashCheck::Never => true,
            // Components are validated by CRC32C only, so it must be present and usable.
            check => {
                source.crc32c_hash.is_some() && (self.fast_crc32c || check == HashCheck::Always)
            }
        }
    }
}
