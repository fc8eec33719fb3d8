//! Tracker files: small JSON records saying a download of (source,
//! destination[, component]) was already started.
//!
//! A tracker only confirms that bytes already in the destination belong to
//! this source; the resume point itself comes from the destination file.
//! Records are written to a temp file and renamed into place, and a record
//! that cannot be parsed is treated as missing, so a crash mid-write at worst
//! restarts the download from its first byte.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::TransferConfig;
use crate::resource::ObjectResource;

const TRACKER_DIR_NAME: &str = "tracker_files";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TrackerRecord {
    source_url: String,
    #[serde(default)]
    generation: Option<String>,
    destination: String,
    #[serde(default)]
    component_number: Option<usize>,
    #[serde(default)]
    slice_start_byte: Option<u64>,
}

/// Identifies one component of a sliced download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentKey {
    pub component_number: usize,
    pub slice_start_byte: u64,
}

/// Directory of tracker files.
#[derive(Debug, Clone)]
pub struct TrackerStore {
    dir: PathBuf,
}

impl TrackerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.local/state/sluice/tracker_files`.
    pub fn default_dir() -> Result<PathBuf> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("sluice")?;
        Ok(xdg_dirs.get_state_home().join(TRACKER_DIR_NAME))
    }

    /// Uses `transfer.tracker_dir` if set, else the default state dir.
    pub fn from_config(transfer: &TransferConfig) -> Result<Self> {
        match &transfer.tracker_dir {
            Some(dir) => Ok(Self::new(dir.clone())),
            None => Ok(Self::new(Self::default_dir()?)),
        }
    }

    /// Path of the tracker for a download (or one component of it).
    pub fn tracker_path(
        &self,
        source: &ObjectResource,
        destination: &Path,
        component: Option<usize>,
    ) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(b"download\0");
        hasher.update(source.url.versionless_url_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(destination.to_string_lossy().as_bytes());
        let key = hex::encode(hasher.finalize());
        let name = match component {
            Some(n) => format!("download_{}_{}.json", key, n),
            None => format!("download_{}.json", key),
        };
        self.dir.join(name)
    }

    /// Returns the tracker path and whether a matching tracker already existed.
    /// A missing, unreadable or stale (other generation) tracker is replaced
    /// with a fresh one and reported as not found.
    pub fn read_or_create(
        &self,
        source: &ObjectResource,
        destination: &Path,
        component: Option<ComponentKey>,
    ) -> Result<(PathBuf, bool)> {
        let path = self.tracker_path(source, destination, component.map(|c| c.component_number));
        let wanted = TrackerRecord {
            source_url: source.url.versionless_url_string(),
            generation: source.generation.clone(),
            destination: destination.to_string_lossy().into_owned(),
            component_number: component.map(|c| c.component_number),
            slice_start_byte: component.map(|c| c.slice_start_byte),
        };

        match read_record(&path) {
            Some(existing) if existing == wanted => return Ok((path, true)),
            Some(_) => {
                tracing::info!(tracker = %path.display(), "tracker belongs to another version; restarting download");
            }
            None => {}
        }
        write_record(&path, &wanted)?;
        Ok((path, false))
    }

    /// Deletes one tracker file; missing files are fine.
    pub fn delete(&self, path: &Path) -> Result<()> {
        crate::storage::remove_if_exists(path)
            .with_context(|| format!("delete tracker {}", path.display()))
    }

    /// Deletes the whole-object tracker and every component tracker of a download.
    pub fn delete_download_trackers(
        &self,
        source: &ObjectResource,
        destination: &Path,
        total_components: usize,
    ) -> Result<()> {
        self.delete(&self.tracker_path(source, destination, None))?;
        for n in 0..total_components {
            self.delete(&self.tracker_path(source, destination, Some(n)))?;
        }
        Ok(())
    }
}

fn read_record(path: &Path) -> Option<TrackerRecord> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(tracker = %path.display(), error = %e, "unreadable tracker file; ignoring");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(tracker = %path.display(), error = %e, "corrupt tracker file; ignoring");
            None
        }
    }
}

fn write_record(path: &Path, record: &TrackerRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir: {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(record).context("serialize tracker")?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json).with_context(|| format!("write tracker: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename tracker into place: {}", path.display()))?;
    Ok(())
}
