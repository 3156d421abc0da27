use std::io;
use thiserror::Error;

/// Errors produced by the archive layer.
///
/// The security-limit variants are never produced by truncating or capping
/// data: reading stops and the entry is rejected as a whole.
#[derive(Debug, Error)]
pub enum Error {
    /// The input could not be recognised as a ZIP archive at all.
    #[error("not a ZIP archive: {0}")]
    NotZip(String),

    /// An entry inflates far beyond what its compressed size suggests.
    #[error(
        "zip bomb detected in entry '{entry}': {inflated} bytes inflated from {compressed} \
         compressed bytes (ratio {ratio:.5} is below the minimum of {min_ratio})"
    )]
    ZipBomb {
        entry: String,
        compressed: u64,
        inflated: u64,
        ratio: f64,
        min_ratio: f64,
    },

    /// An entry is (or inflates to) more than the configured maximum size.
    #[error("entry '{entry}' is {size} bytes, exceeding the maximum entry size of {limit} bytes")]
    EntryTooLarge { entry: String, size: u64, limit: u64 },

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error("duplicate entry name in output archive: {0}")]
    DuplicateEntry(String),

    /// The reader has been closed and no longer owns its source.
    #[error("archive reader is closed")]
    Closed,

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    /// Wrap an I/O error with a description of the failed operation.
    ///
    /// Limit violations raised from inside a [`Read`](std::io::Read) adapter
    /// travel as `io::Error` payloads; those are unwrapped back into their
    /// original variant here.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        let carries_error = source
            .get_ref()
            .is_some_and(|inner| inner.is::<Error>());
        if carries_error {
            if let Some(inner) = source.into_inner() {
                if let Ok(err) = inner.downcast::<Error>() {
                    return *err;
                }
            }
            return Error::Io {
                context: context.into(),
                source: io::Error::other("lost wrapped archive error"),
            };
        }
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Classify a failure to parse the archive structure.
    pub(crate) fn from_archive_open(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(source) => Error::io("reading archive structure", source),
            other => Error::NotZip(other.to_string()),
        }
    }

    /// Whether the error is one of the security-limit rejections.
    pub fn is_limit_violation(&self) -> bool {
        matches!(self, Error::ZipBomb { .. } | Error::EntryTooLarge { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
