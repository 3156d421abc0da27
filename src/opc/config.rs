//! Package configuration.

use soapberry_zip::ZipLimits;

/// How a package may be used once opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackageAccess {
    /// Parts can be read; any mutation or save is refused.
    Read,
    /// Parts can be added and the package saved; reading is refused.
    Write,
    /// No restriction.
    #[default]
    ReadWrite,
}

impl PackageAccess {
    #[inline]
    pub fn can_read(self) -> bool {
        !matches!(self, PackageAccess::Write)
    }

    #[inline]
    pub fn can_write(self) -> bool {
        !matches!(self, PackageAccess::Read)
    }
}

/// Where the content of new and modified parts is kept until save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartStorage {
    /// In memory.
    #[default]
    Memory,
    /// In anonymous temporary files, one per part.
    TempFile,
}

/// When parts of an opened archive are inflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// On first access.
    #[default]
    Lazy,
    /// All at open, so the source can be released immediately.
    Eager,
}

/// Options for opening and creating packages.
///
/// # Example
///
/// ```
/// use longan::opc::{LoadMode, PackageConfig, PartStorage};
/// use soapberry_zip::ZipLimits;
///
/// let config = PackageConfig::default()
///     .with_zip_limits(ZipLimits::default().with_max_entry_size(64 * 1024 * 1024))
///     .with_part_storage(PartStorage::TempFile)
///     .with_load_mode(LoadMode::Eager);
/// assert_eq!(config.part_storage, PartStorage::TempFile);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackageConfig {
    /// Decompression limits applied to every entry read
    pub zip_limits: ZipLimits,
    pub part_storage: PartStorage,
    pub load_mode: LoadMode,
}

impl Default for PackageConfig {
    /// Uses the process-wide [`ZipLimits::global`] at the time of the call.
    fn default() -> Self {
        Self {
            zip_limits: ZipLimits::global(),
            part_storage: PartStorage::default(),
            load_mode: LoadMode::default(),
        }
    }
}

impl PackageConfig {
    pub fn with_zip_limits(mut self, zip_limits: ZipLimits) -> Self {
        self.zip_limits = zip_limits;
        self
    }

    pub fn with_part_storage(mut self, part_storage: PartStorage) -> Self {
        self.part_storage = part_storage;
        self
    }

    pub fn with_load_mode(mut self, load_mode: LoadMode) -> Self {
        self.load_mode = load_mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_rules() {
        assert!(PackageAccess::Read.can_read());
        assert!(!PackageAccess::Read.can_write());
        assert!(!PackageAccess::Write.can_read());
        assert!(PackageAccess::Write.can_write());
        assert!(PackageAccess::ReadWrite.can_read() && PackageAccess::ReadWrite.can_write());
        assert_eq!(PackageAccess::default(), PackageAccess::ReadWrite);
    }

    #[test]
    fn test_builders() {
        let limits = ZipLimits::default().with_min_inflate_ratio(0.5);
        let config = PackageConfig::default()
            .with_zip_limits(limits)
            .with_load_mode(LoadMode::Eager);
        assert_eq!(config.zip_limits, limits);
        assert_eq!(config.load_mode, LoadMode::Eager);
        assert_eq!(config.part_storage, PartStorage::Memory);
    }
}
