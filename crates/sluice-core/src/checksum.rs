//! Download integrity: incremental MD5 / CRC32C digesters and validation
//! against the hashes the server reports.
//!
//! Server hashes are base64 strings (MD5 digest bytes; CRC32C as 4 big-endian
//! bytes). Local digests are encoded the same way before comparison.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::resource::ObjectResource;

const BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgorithm {
    Md5,
    Crc32c,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Crc32c => "crc32c",
        })
    }
}

/// Downloaded data does not match the server's hash. The file has been deleted.
#[derive(Debug, thiserror::Error)]
#[error("{algorithm} mismatch for {}: local {local}, expected {expected}", path.display())]
pub struct HashMismatch {
    pub path: PathBuf,
    pub algorithm: HashAlgorithm,
    pub local: String,
    pub expected: String,
}

/// Incremental hash accumulator.
#[derive(Clone)]
pub enum Digester {
    Md5(md5::Context),
    Crc32c(u32),
}

impl Digester {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Digester::Md5(md5::Context::new()),
            HashAlgorithm::Crc32c => Digester::Crc32c(0),
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Digester::Md5(_) => HashAlgorithm::Md5,
            Digester::Crc32c(_) => HashAlgorithm::Crc32c,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Md5(ctx) => ctx.consume(data),
            Digester::Crc32c(crc) => *crc = crc32c::crc32c_append(*crc, data),
        }
    }

    /// Raw CRC32C value, if this is a CRC32C digester.
    pub fn crc32c(&self) -> Option<u32> {
        match self {
            Digester::Crc32c(crc) => Some(*crc),
            Digester::Md5(_) => None,
        }
    }

    /// Base64 digest in the server's encoding.
    pub fn to_base64(&self) -> String {
        match self {
            Digester::Md5(ctx) => STANDARD.encode(ctx.clone().compute().0),
            Digester::Crc32c(crc) => crc32c_to_base64(*crc),
        }
    }
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digester({}={})", self.algorithm(), self.to_base64())
    }
}

/// The digesters of one download, at most one per algorithm.
#[derive(Debug, Clone, Default)]
pub struct Digesters {
    by_algorithm: BTreeMap<HashAlgorithm, Digester>,
}

impl Digesters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(algorithms: &[HashAlgorithm]) -> Self {
        let mut d = Self::new();
        for &a in algorithms {
            d.by_algorithm.insert(a, Digester::new(a));
        }
        d
    }

    pub fn is_empty(&self) -> bool {
        self.by_algorithm.is_empty()
    }

    pub fn get(&self, algorithm: HashAlgorithm) -> Option<&Digester> {
        self.by_algorithm.get(&algorithm)
    }

    pub fn update(&mut self, data: &[u8]) {
        for d in self.by_algorithm.values_mut() {
            d.update(data);
        }
    }

    /// Base64 digests keyed by algorithm.
    pub fn local_hashes(&self) -> BTreeMap<HashAlgorithm, String> {
        self.by_algorithm
            .iter()
            .map(|(a, d)| (*a, d.to_base64()))
            .collect()
    }
}

pub fn crc32c_to_base64(crc: u32) -> String {
    STANDARD.encode(crc.to_be_bytes())
}

/// True if CRC32C runs on a hardware instruction on this machine.
pub fn is_fast_crc32c_available() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("sse4.2")
    }
    #[cfg(target_arch = "aarch64")]
    {
        std::arch::is_aarch64_feature_detected!("crc")
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}

/// Feeds bytes `[start, end)` of a file into `digesters`.
pub fn hash_file_range(path: &Path, start: u64, end: u64, digesters: &mut Digesters) -> Result<()> {
    if end <= start || digesters.is_empty() {
        return Ok(());
    }
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    f.seek(SeekFrom::Start(start))
        .with_context(|| format!("seek {}", path.display()))?;
    let mut remaining = end - start;
    let mut buf = vec![0u8; BUF_SIZE];
    while remaining > 0 {
        let want = remaining.min(BUF_SIZE as u64) as usize;
        let n = f
            .read(&mut buf[..want])
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            anyhow::bail!(
                "{} ended {} bytes before offset {}",
                path.display(),
                remaining,
                end
            );
        }
        digesters.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(())
}

/// Combines CRC32C checksums of consecutive ranges, given as `(crc, length)`
/// in file order, into the checksum of their concatenation.
pub fn crc32c_combine_all(parts: &[(u32, u64)]) -> u32 {
    parts.iter().fold(0u32, |acc, &(crc, len)| {
        crc32c::crc32c_combine(acc, crc, len as usize)
    })
}

/// Compares local digests with the hashes the server reported for `source`.
/// On the first mismatch the file at `path` is deleted and `HashMismatch`
/// returned. Algorithms the server did not report are skipped.
pub fn validate_download_hash_and_delete_corrupt_files(
    path: &Path,
    source: &ObjectResource,
    local_hashes: &BTreeMap<HashAlgorithm, String>,
) -> Result<()> {
    for (algorithm, local) in local_hashes {
        let expected = match algorithm {
            HashAlgorithm::Md5 => source.md5_hash.as_deref(),
            HashAlgorithm::Crc32c => source.crc32c_hash.as_deref(),
        };
        let Some(expected) = expected else {
            continue;
        };
        if local == expected {
            tracing::debug!(%algorithm, path = %path.display(), "hash validated");
            continue;
        }
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete corrupt download");
        }
        return Err(HashMismatch {
            path: path.to_path_buf(),
            algorithm: *algorithm,
            local: local.clone(),
            expected: expected.to_string(),
        }
        .into());
    }
    Ok(())
}
