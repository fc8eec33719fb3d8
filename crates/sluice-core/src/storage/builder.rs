//! Creating and preallocating destination files.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Creates `path` with `size` zero bytes if it does not exist yet. An existing
/// file is left untouched so earlier progress survives; it is only extended
/// if shorter than `size`.
pub fn create_file_if_needed(path: &Path, size: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
    }
    let file = File::options()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to create file: {}", path.display()))?;
    let current = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    if current < size {
        preallocate(&file, size)?;
    }
    Ok(())
}

/// On Unix tries `posix_fallocate` for real block allocation; falls back to
/// `set_len`. Both leave the new bytes zeroed.
fn preallocate(file: &File, size: u64) -> Result<()> {
    #[cfg(unix)]
    {
        let fd = file.as_raw_fd();
        let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
        if r == 0 {
            return Ok(());
        }
        tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
    }
    file.set_len(size).context("failed to preallocate file")?;
    Ok(())
}
