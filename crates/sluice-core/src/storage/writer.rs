//! Sequential writer for one byte range of a destination file.

use std::fs::File;
use std::io::{self, Write};

use crate::checksum::Digesters;
use crate::progress::{ProgressSink, ProgressUpdate};

/// Writes a downloaded stream into a file, feeding every chunk to the
/// digesters and reporting it to the progress sink.
pub struct RangeWriter<'a> {
    file: File,
    digesters: &'a mut Digesters,
    progress: &'a dyn ProgressSink,
    url: String,
    written: u64,
}

impl<'a> RangeWriter<'a> {
    /// `file` must already be positioned at the start of the range.
    pub fn new(
        file: File,
        digesters: &'a mut Digesters,
        progress: &'a dyn ProgressSink,
        url: impl Into<String>,
    ) -> Self {
        Self {
            file,
            digesters,
            progress,
            url: url.into(),
            written: 0,
        }
    }

    /// Flush and fsync; call before hashing or renaming the file.
    pub fn finish(mut self) -> io::Result<u64> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(self.written)
    }
}

impl Write for RangeWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.digesters.update(&buf[..n]);
        self.written += n as u64;
        self.progress.report(ProgressUpdate::Bytes {
            url: self.url.clone(),
            bytes: n as u64,
        });
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::HashAlgorithm;
    use crate::progress::ProgressCounter;
    use crate::storage::{open_for_write, WriteMode};

    #[test]
    fn writes_hash_and_reports_each_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"..........").unwrap();
        let mut digesters = Digesters::with(&[HashAlgorithm::Crc32c]);
        let progress = ProgressCounter::new();
        let file = open_for_write(&path, WriteMode::Modify, 3).unwrap();
        let mut w = RangeWriter::new(file, &mut digesters, &progress, "gs://b/o");
        w.write_all(b"abc").unwrap();
        w.write_all(b"de").unwrap();
        assert_eq!(w.finish().unwrap(), 5);

        assert_eq!(std::fs::read(&path).unwrap(), b"...abcde..");
        assert_eq!(progress.bytes_done(), 5);
        assert_eq!(
            digesters.get(HashAlgorithm::Crc32c).unwrap().crc32c(),
            Some(crc32c::crc32c(b"abcde"))
        );
    }
}
