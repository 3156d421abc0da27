//! Security limits applied while inflating archive entries.
//!
//! Every reader takes an explicit [`ZipLimits`]. For convenience a process-wide
//! default is kept as well; [`ZipLimits::global`] returns a snapshot of it and
//! [`ZipLimits::set_global`] lets the embedding application tune it once at
//! start-up. Nothing reads the global implicitly after a reader is built.

use crate::errors::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Largest inflated size accepted for one entry by default (4 GiB - 1).
pub const DEFAULT_MAX_ENTRY_SIZE: u64 = 0xFFFF_FFFF;

/// Smallest accepted `compressed / inflated` ratio by default.
pub const DEFAULT_MIN_INFLATE_RATIO: f64 = 0.01;

/// Entries up to this inflated size are exempt from the ratio check.
pub const DEFAULT_GRACE_ENTRY_SIZE: u64 = 100 * 1024;

/// Default budget for extracted text across a whole package.
pub const DEFAULT_MAX_TEXT_SIZE: u64 = 10 * 1024 * 1024;

static GLOBAL_LIMITS: Lazy<RwLock<ZipLimits>> = Lazy::new(|| RwLock::new(ZipLimits::default()));

/// Thresholds guarding against decompression bombs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZipLimits {
    /// Hard ceiling on the inflated size of a single entry.
    pub max_entry_size: u64,
    /// Minimum `compressed / inflated` ratio once an entry passes the grace size.
    pub min_inflate_ratio: f64,
    /// Inflated size below which the ratio is not checked.
    pub grace_entry_size: u64,
    /// Total text budget; enforced by consumers through
    /// [`SecureZipReader::inflated_total`](crate::SecureZipReader::inflated_total).
    pub max_text_size: u64,
}

impl Default for ZipLimits {
    fn default() -> Self {
        Self {
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            min_inflate_ratio: DEFAULT_MIN_INFLATE_RATIO,
            grace_entry_size: DEFAULT_GRACE_ENTRY_SIZE,
            max_text_size: DEFAULT_MAX_TEXT_SIZE,
        }
    }
}

impl ZipLimits {
    /// Snapshot of the process-wide default limits.
    pub fn global() -> Self {
        *GLOBAL_LIMITS.read()
    }

    /// Replace the process-wide default limits.
    ///
    /// Readers that were already constructed keep the limits they were given.
    pub fn set_global(limits: ZipLimits) {
        *GLOBAL_LIMITS.write() = limits;
    }

    pub fn with_max_entry_size(mut self, max_entry_size: u64) -> Self {
        self.max_entry_size = max_entry_size;
        self
    }

    pub fn with_min_inflate_ratio(mut self, min_inflate_ratio: f64) -> Self {
        self.min_inflate_ratio = min_inflate_ratio;
        self
    }

    pub fn with_grace_entry_size(mut self, grace_entry_size: u64) -> Self {
        self.grace_entry_size = grace_entry_size;
        self
    }

    pub fn with_max_text_size(mut self, max_text_size: u64) -> Self {
        self.max_text_size = max_text_size;
        self
    }

    /// Check the sizes an entry declares in its headers before inflating it.
    ///
    /// A declared size of zero means "unknown" (streamed entries written with
    /// a data descriptor) and only the progress check applies to those.
    pub fn check_declared(&self, entry: &str, compressed: u64, size: u64) -> Result<()> {
        self.check_progress(entry, compressed, size)
    }

    /// Check the running totals of an entry that is being inflated.
    ///
    /// # Arguments
    ///
    /// * `entry` - Entry name, used for the error message
    /// * `compressed` - Compressed size of the entry, `0` when unknown
    /// * `inflated` - Bytes produced so far
    pub fn check_progress(&self, entry: &str, compressed: u64, inflated: u64) -> Result<()> {
        if inflated > self.max_entry_size {
            return Err(Error::EntryTooLarge {
                entry: entry.to_string(),
                size: inflated,
                limit: self.max_entry_size,
            });
        }

        if inflated <= self.grace_entry_size || compressed == 0 {
            return Ok(());
        }

        let ratio = compressed as f64 / inflated as f64;
        if ratio < self.min_inflate_ratio {
            return Err(Error::ZipBomb {
                entry: entry.to_string(),
                compressed,
                inflated,
                ratio,
                min_ratio: self.min_inflate_ratio,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let limits = ZipLimits::default();
        assert_eq!(limits.max_entry_size, 0xFFFF_FFFF);
        assert_eq!(limits.grace_entry_size, 102_400);
        assert_eq!(limits.max_text_size, 10 * 1024 * 1024);
        assert!((limits.min_inflate_ratio - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn test_global_round_trip() {
        let tuned = ZipLimits::default().with_max_text_size(42);
        ZipLimits::set_global(tuned);
        assert_eq!(ZipLimits::global().max_text_size, 42);
        ZipLimits::set_global(ZipLimits::default());
        assert_eq!(ZipLimits::global(), ZipLimits::default());
    }

    #[rstest]
    #[case::small_entry_is_exempt(10, 100_000)]
    #[case::exactly_at_grace(1, 102_400)]
    #[case::healthy_ratio(50_000, 1_000_000)]
    #[case::unknown_compressed_size(0, 5_000_000)]
    fn test_accepts(#[case] compressed: u64, #[case] inflated: u64) {
        assert!(ZipLimits::default()
            .check_progress("word/document.xml", compressed, inflated)
            .is_ok());
    }

    #[rstest]
    #[case(1_000, 1_000_000)]
    #[case(102, 102_401)]
    fn test_rejects_bombs(#[case] compressed: u64, #[case] inflated: u64) {
        let err = ZipLimits::default()
            .check_progress("bomb.xml", compressed, inflated)
            .unwrap_err();
        assert!(matches!(err, Error::ZipBomb { .. }), "{err}");
    }

    #[test]
    fn test_max_entry_size_is_inclusive() {
        let limits = ZipLimits::default().with_max_entry_size(1_000);
        assert!(limits.check_declared("a.bin", 1_000, 1_000).is_ok());
        let err = limits.check_declared("a.bin", 1_001, 1_001).unwrap_err();
        assert!(matches!(err, Error::EntryTooLarge { size: 1_001, limit: 1_000, .. }));
    }
}
