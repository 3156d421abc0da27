//! Hardened ZIP reading and writing for Office package formats.
//!
//! The reader enforces [`ZipLimits`] on every entry it inflates, so a
//! decompression bomb is rejected instead of exhausting memory. Both seekable
//! sources (central directory, random access) and forward-only streams are
//! supported; a file whose central directory is unreadable is retried as a
//! stream.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use soapberry_zip::{SecureZipReader, ZipLimits};
//!
//! let mut archive = SecureZipReader::open_file("document.docx", ZipLimits::global())?;
//! let content = archive.read("word/document.xml")?;
//! for entry in archive.entries() {
//!     println!("{} ({} bytes)", entry.name(), entry.size());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
#![forbid(unsafe_code)]

mod errors;
pub mod limits;
mod reader;
mod threshold;
mod writer;

pub use errors::{Error, Result};
pub use limits::ZipLimits;
pub use reader::{EntryInfo, ReadSeek, SecureZipReader, SourceKind};
pub use threshold::ThresholdReader;
pub use writer::{EntrySink, StreamingArchiveWriter};
