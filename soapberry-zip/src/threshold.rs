//! Read adapter that enforces [`ZipLimits`] while an entry is inflated.

use crate::errors::{Error, Result};
use crate::limits::ZipLimits;
use std::io::{self, Read};

/// Wraps the inflating reader of one entry and counts the bytes it produces.
///
/// Headers can lie about sizes, so the limits are re-checked on every read
/// instead of trusting the declared values alone.
pub struct ThresholdReader<R> {
    inner: R,
    entry: String,
    compressed: u64,
    inflated: u64,
    limits: ZipLimits,
}

impl<R: Read> ThresholdReader<R> {
    pub fn new(inner: R, entry: impl Into<String>, compressed: u64, limits: ZipLimits) -> Self {
        Self {
            inner,
            entry: entry.into(),
            compressed,
            inflated: 0,
            limits,
        }
    }

    /// Bytes produced so far.
    pub fn inflated(&self) -> u64 {
        self.inflated
    }

    /// Drain the entry into memory.
    pub fn read_to_vec(mut self, size_hint: u64) -> Result<Vec<u8>> {
        let capacity = size_hint.min(self.limits.max_entry_size).min(64 * 1024 * 1024) as usize;
        let mut data = Vec::with_capacity(capacity);
        let context = format!("inflating entry '{}'", self.entry);
        self.read_to_end(&mut data)
            .map_err(|e| Error::io(context, e))?;
        Ok(data)
    }
}

impl<R: Read> Read for ThresholdReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.inflated += n as u64;
        self.limits
            .check_progress(&self.entry, self.compressed, self.inflated)
            .map_err(io::Error::other)?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_passes_data_through() {
        let reader = ThresholdReader::new(
            Cursor::new(b"<root/>".to_vec()),
            "a.xml",
            7,
            ZipLimits::default(),
        );
        assert_eq!(reader.read_to_vec(7).unwrap(), b"<root/>");
    }

    #[test]
    fn test_stops_on_oversized_stream() {
        let limits = ZipLimits::default().with_max_entry_size(16);
        let reader = ThresholdReader::new(Cursor::new(vec![0u8; 64]), "big.bin", 64, limits);
        let err = reader.read_to_vec(0).unwrap_err();
        assert!(matches!(err, Error::EntryTooLarge { .. }), "{err}");
    }

    #[test]
    fn test_detects_lying_compressed_size() {
        let limits = ZipLimits::default().with_grace_entry_size(1_024);
        let reader = ThresholdReader::new(Cursor::new(vec![b'a'; 8_192]), "x.xml", 4, limits);
        let err = reader.read_to_vec(0).unwrap_err();
        assert!(matches!(err, Error::ZipBomb { .. }), "{err}");
    }
}
