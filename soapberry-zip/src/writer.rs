//! Archive writer for package output.
//!
//! ```rust,no_run
//! use soapberry_zip::{EntrySink, StreamingArchiveWriter};
//!
//! let mut writer = StreamingArchiveWriter::new();
//! writer.write_deflated("[Content_Types].xml", b"<Types/>")?;
//! writer.write_stored("media/image1.png", b"\x89PNG")?;
//! let bytes = writer.finish_to_bytes()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::errors::{Error, Result};
use std::collections::HashSet;
use std::io::{Cursor, Seek, Write};
use zip::write::{SimpleFileOptions, ZipWriter};
use zip::CompressionMethod;

/// Destination for whole archive entries.
///
/// Object safe, so serializers can be handed a `&mut dyn EntrySink` without
/// knowing the concrete output.
pub trait EntrySink {
    /// Write an entry with Deflate compression.
    fn write_deflated(&mut self, name: &str, data: &[u8]) -> Result<()>;

    /// Write an entry without compression.
    fn write_stored(&mut self, name: &str, data: &[u8]) -> Result<()>;

    /// Whether an entry with this exact name was already written.
    fn contains(&self, name: &str) -> bool;
}

/// ZIP writer that emits one complete entry per call.
pub struct StreamingArchiveWriter<W: Write + Seek> {
    archive: ZipWriter<W>,
    names: HashSet<String>,
}

impl StreamingArchiveWriter<Cursor<Vec<u8>>> {
    /// Create a writer that builds the archive in memory.
    pub fn new() -> Self {
        Self::with_writer(Cursor::new(Vec::new()))
    }

    /// Finish writing and return the archive bytes.
    pub fn finish_to_bytes(self) -> Result<Vec<u8>> {
        Ok(self.finish()?.into_inner())
    }
}

impl Default for StreamingArchiveWriter<Cursor<Vec<u8>>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Seek> StreamingArchiveWriter<W> {
    pub fn with_writer(writer: W) -> Self {
        Self {
            archive: ZipWriter::new(writer),
            names: HashSet::new(),
        }
    }

    fn write_entry(&mut self, name: &str, data: &[u8], method: CompressionMethod) -> Result<()> {
        if !self.names.insert(name.to_string()) {
            return Err(Error::DuplicateEntry(name.to_string()));
        }
        let options = SimpleFileOptions::default().compression_method(method);
        self.archive.start_file(name, options)?;
        self.archive
            .write_all(data)
            .map_err(|e| Error::io(format!("writing entry '{name}'"), e))
    }

    /// Write the central directory and hand back the underlying writer.
    pub fn finish(self) -> Result<W> {
        Ok(self.archive.finish()?)
    }
}

impl<W: Write + Seek> EntrySink for StreamingArchiveWriter<W> {
    fn write_deflated(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.write_entry(name, data, CompressionMethod::Deflated)
    }

    fn write_stored(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.write_entry(name, data, CompressionMethod::Stored)
    }

    fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}
