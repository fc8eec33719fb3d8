//! Destination files on local disk.
//!
//! Downloads write into a `.part` temp file next to the destination and are
//! renamed into place once complete. Files are preallocated with zeros, so the
//! first zero byte of a range marks where an earlier attempt stopped.

mod builder;
mod writer;

pub use builder::create_file_if_needed;
pub use writer::RangeWriter;

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Temporary file suffix used before atomic rename.
pub const TEMP_SUFFIX: &str = ".part";

const SCAN_BUF_SIZE: usize = 64 * 1024;

/// Path for the temp file: appends `.part` to the final path (e.g. `file.iso` → `file.iso.part`).
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(TEMP_SUFFIX);
    PathBuf::from(o)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or truncate the file.
    Truncate,
    /// Open an existing file without truncating; other ranges stay intact.
    Modify,
}

/// Opens `path` for writing, positioned at `offset`.
pub fn open_for_write(path: &Path, mode: WriteMode, offset: u64) -> Result<File> {
    let mut opts = File::options();
    opts.write(true);
    match mode {
        WriteMode::Truncate => opts.create(true).truncate(true),
        WriteMode::Modify => opts.create(true).truncate(false),
    };
    let mut file = opts
        .open(path)
        .with_context(|| format!("open {} for writing", path.display()))?;
    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("seek {} to {}", path.display(), offset))?;
    Ok(file)
}

/// Index of the first zero byte in `[start, end)`, or `end` if there is none.
/// Bytes past the end of the file count as zero.
pub fn first_null_byte_index(path: &Path, start: u64, end: u64) -> Result<u64> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    f.seek(SeekFrom::Start(start))
        .with_context(|| format!("seek {}", path.display()))?;
    let mut buf = vec![0u8; SCAN_BUF_SIZE];
    let mut pos = start;
    while pos < end {
        let want = (end - pos).min(SCAN_BUF_SIZE as u64) as usize;
        let n = f
            .read(&mut buf[..want])
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            return Ok(pos);
        }
        if let Some(i) = buf[..n].iter().position(|&b| b == 0) {
            return Ok(pos + i as u64);
        }
        pos += n as u64;
    }
    Ok(end)
}

/// Atomically rename the finished temp file to the final path.
/// Fails if `final_path` is on a different filesystem.
pub fn finalize(temp_path: &Path, final_path: &Path) -> Result<()> {
    std::fs::rename(temp_path, final_path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            temp_path.display(),
            final_path.display()
        )
    })
}

/// Removes a file, treating "not found" as success.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}
