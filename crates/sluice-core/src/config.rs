use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::retry::RetryPolicy;

/// Retry policy parameters (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts per request (including the first).
    pub max_attempts: u32,
    /// Base delay in seconds for exponential backoff (e.g. 0.25 = 250ms).
    pub base_delay_secs: f64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 0.25,
            max_delay_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: std::time::Duration::from_secs_f64(self.base_delay_secs.max(0.0)),
            max_delay: std::time::Duration::from_secs(self.max_delay_secs),
        }
    }
}

/// When downloaded data is checked against the hashes the server reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashCheck {
    /// Never compute or validate hashes.
    Never,
    /// Validate MD5 always; validate CRC32C only if a hardware implementation is available.
    #[default]
    IfFastElseSkip,
    /// Like `IfFastElseSkip`, but fail instead of skipping CRC32C validation.
    IfFastElseFail,
    /// Always validate, even with a slow CRC32C implementation.
    Always,
}

/// Worker pool sizing for the task graph executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of worker groups. Groups are spawned lazily, one at a time.
    pub max_workers: usize,
    /// Threads started per worker group.
    pub threads_per_worker: usize,
    /// Maximum top-level tasks in flight (each including its whole subtree).
    /// Defaults to twice the total thread count.
    #[serde(default)]
    pub top_level_task_limit: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            threads_per_worker: 4,
            top_level_task_limit: None,
        }
    }
}

impl ExecutorConfig {
    /// Total number of worker threads once every group is running.
    pub fn worker_count(&self) -> usize {
        self.max_workers.max(1) * self.threads_per_worker.max(1)
    }

    pub fn effective_top_level_task_limit(&self) -> usize {
        self.top_level_task_limit
            .unwrap_or(2 * self.worker_count())
            .max(1)
    }
}

/// Per-object transfer settings used by download tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default)]
    pub check_hashes: HashCheck,
    /// Objects at least this large are downloaded as parallel components.
    pub sliced_object_download_threshold: u64,
    /// Target size of one component of a sliced download.
    pub sliced_object_download_component_size: u64,
    /// Upper bound on the number of components per object.
    pub sliced_object_download_max_components: usize,
    /// Objects at least this large use the resumable strategy.
    pub resumable_threshold: u64,
    /// Directory for tracker files. Defaults to the XDG state dir.
    #[serde(default)]
    pub tracker_dir: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            check_hashes: HashCheck::default(),
            sliced_object_download_threshold: 150 * 1024 * 1024,
            sliced_object_download_component_size: 50 * 1024 * 1024,
            sliced_object_download_max_components: 4,
            resumable_threshold: 8 * 1024 * 1024,
            tracker_dir: None,
        }
    }
}

/// Global configuration loaded from `~/.config/sluice/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SluiceConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Optional retry policy; if missing, built-in defaults are used.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl SluiceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
            .as_ref()
            .map(RetryConfig::to_policy)
            .unwrap_or_default()
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("sluice")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<SluiceConfig> {
    load_or_init_from(&config_path()?)
}

/// [`load_or_init`] for an explicit config file path.
pub fn load_or_init_from(path: &Path) -> Result<SluiceConfig> {
    if !path.exists() {
        let default_cfg = SluiceConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(path)?;
    let cfg: SluiceConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = SluiceConfig::default();
        assert_eq!(cfg.executor.threads_per_worker, 4);
        assert!(cfg.executor.max_workers >= 1);
        assert_eq!(cfg.transfer.check_hashes, HashCheck::IfFastElseSkip);
        assert_eq!(cfg.transfer.sliced_object_download_max_components, 4);
        assert!(cfg.retry.is_none());
    }

    #[test]
    fn top_level_limit_defaults_to_twice_worker_count() {
        let exec = ExecutorConfig {
            max_workers: 3,
            threads_per_worker: 2,
            top_level_task_limit: None,
        };
        assert_eq!(exec.worker_count(), 6);
        assert_eq!(exec.effective_top_level_task_limit(), 12);
        let exec = ExecutorConfig {
            top_level_task_limit: Some(5),
            ..exec
        };
        assert_eq!(exec.effective_top_level_task_limit(), 5);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = SluiceConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: SluiceConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.executor.max_workers, cfg.executor.max_workers);
        assert_eq!(
            parsed.transfer.sliced_object_download_threshold,
            cfg.transfer.sliced_object_download_threshold
        );
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            [executor]
            max_workers = 2
            threads_per_worker = 8
            top_level_task_limit = 10

            [transfer]
            check_hashes = "always"
            sliced_object_download_threshold = 1000
            sliced_object_download_component_size = 100
            sliced_object_download_max_components = 3
            resumable_threshold = 0
            tracker_dir = "/tmp/trackers"

            [retry]
            max_attempts = 3
            base_delay_secs = 0.5
            max_delay_secs = 15
        "#;
        let cfg: SluiceConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.executor.max_workers, 2);
        assert_eq!(cfg.executor.effective_top_level_task_limit(), 10);
        assert_eq!(cfg.transfer.check_hashes, HashCheck::Always);
        assert_eq!(
            cfg.transfer.tracker_dir.as_deref(),
            Some(std::path::Path::new("/tmp/trackers"))
        );
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.max_delay, std::time::Duration::from_secs(15));
    }

    #[test]
    fn load_or_init_writes_defaults_then_reads_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sluice").join("config.toml");
        let first = load_or_init_from(&path).unwrap();
        assert!(path.is_file());
        assert_eq!(first.executor.threads_per_worker, 4);

        let edited = fs::read_to_string(&path)
            .unwrap()
            .replace("threads_per_worker = 4", "threads_per_worker = 9");
        fs::write(&path, edited).unwrap();
        assert_eq!(load_or_init_from(&path).unwrap().executor.threads_per_worker, 9);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let cfg: SluiceConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.executor.threads_per_worker, 4);
        assert_eq!(cfg.transfer.resumable_threshold, 8 * 1024 * 1024);
    }
}
