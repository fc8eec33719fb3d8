//! Storage URLs and the resources they name.
//!
//! Cloud URLs look like `gs://bucket/object/name#generation`; anything without
//! a `scheme://` prefix (or with `file://`) is a local path.

use std::fmt;
use std::path::{Path, PathBuf};

/// Delimiter used by cloud object names.
pub const CLOUD_DELIMITER: char = '/';

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("unsupported URL scheme in {0}")]
    UnsupportedScheme(String),
    #[error("missing bucket name in {0}")]
    MissingBucket(String),
}

/// Supported cloud providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderScheme {
    Gcs,
}

impl ProviderScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderScheme::Gcs => "gs",
        }
    }
}

/// URL of a bucket, prefix or object in cloud storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloudUrl {
    pub scheme: ProviderScheme,
    pub bucket: String,
    /// Object name or prefix; empty for a bucket URL.
    pub object: String,
    pub generation: Option<String>,
}

impl CloudUrl {
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            scheme: ProviderScheme::Gcs,
            bucket: bucket.into(),
            object: object.into(),
            generation: None,
        }
    }

    /// Parse `gs://bucket[/object][#generation]`.
    pub fn parse(s: &str) -> Result<Self, UrlError> {
        let rest = s
            .strip_prefix("gs://")
            .ok_or_else(|| UrlError::UnsupportedScheme(s.to_string()))?;
        let (path, generation) = match rest.rsplit_once('#') {
            Some((p, g)) if !g.is_empty() && g.bytes().all(|b| b.is_ascii_digit()) => {
                (p, Some(g.to_string()))
            }
            _ => (rest, None),
        };
        let (bucket, object) = match path.split_once(CLOUD_DELIMITER) {
            Some((b, o)) => (b, o),
            None => (path, ""),
        };
        if bucket.is_empty() {
            return Err(UrlError::MissingBucket(s.to_string()));
        }
        Ok(Self {
            scheme: ProviderScheme::Gcs,
            bucket: bucket.to_string(),
            object: object.to_string(),
            generation,
        })
    }

    pub fn is_bucket(&self) -> bool {
        self.object.is_empty()
    }

    /// URL string without the generation suffix.
    pub fn versionless_url_string(&self) -> String {
        if self.object.is_empty() {
            format!("{}://{}/", self.scheme.as_str(), self.bucket)
        } else {
            format!("{}://{}/{}", self.scheme.as_str(), self.bucket, self.object)
        }
    }

    /// Last path component of the object name (trailing delimiter ignored).
    pub fn leaf_name(&self) -> &str {
        let trimmed = self.object.trim_end_matches(CLOUD_DELIMITER);
        trimmed
            .rsplit_once(CLOUD_DELIMITER)
            .map(|(_, leaf)| leaf)
            .unwrap_or(trimmed)
    }
}

impl fmt::Display for CloudUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.versionless_url_string())?;
        if let Some(generation) = &self.generation {
            write!(f, "#{}", generation)?;
        }
        Ok(())
    }
}

/// A cloud object with the metadata download tasks need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectResource {
    pub url: CloudUrl,
    pub size: Option<u64>,
    /// Base64 MD5 digest as reported by the server.
    pub md5_hash: Option<String>,
    /// Base64 big-endian CRC32C as reported by the server.
    pub crc32c_hash: Option<String>,
    pub generation: Option<String>,
}

impl ObjectResource {
    pub fn new(url: CloudUrl, size: u64) -> Self {
        let generation = url.generation.clone();
        Self {
            url,
            size: Some(size),
            md5_hash: None,
            crc32c_hash: None,
            generation,
        }
    }

    pub fn with_md5(mut self, md5_hash: impl Into<String>) -> Self {
        self.md5_hash = Some(md5_hash.into());
        self
    }

    pub fn with_crc32c(mut self, crc32c_hash: impl Into<String>) -> Self {
        self.crc32c_hash = Some(crc32c_hash.into());
        self
    }

    pub fn with_generation(mut self, generation: impl Into<String>) -> Self {
        self.generation = Some(generation.into());
        self
    }
}

impl fmt::Display for ObjectResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// A local file (which may not exist yet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileObjectResource {
    pub path: PathBuf,
}

impl FileObjectResource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Anything a source or destination URL can resolve to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Object(ObjectResource),
    Prefix(CloudUrl),
    Bucket(CloudUrl),
    File(FileObjectResource),
    FileDirectory(PathBuf),
}

impl Resource {
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Resource::Prefix(_) | Resource::Bucket(_) | Resource::FileDirectory(_)
        )
    }

    pub fn url_string(&self) -> String {
        match self {
            Resource::Object(o) => o.url.to_string(),
            Resource::Prefix(u) | Resource::Bucket(u) => u.versionless_url_string(),
            Resource::File(f) => f.path.display().to_string(),
            Resource::FileDirectory(p) => p.display().to_string(),
        }
    }
}
