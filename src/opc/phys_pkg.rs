//! Provides a general interface to a physical OPC package (ZIP file).
//!
//! The reader side shares one [`SecureZipReader`] between the package and
//! every part still backed by an archive entry; the writer side wraps the
//! archive writer with the fixed entries every package has.

use crate::opc::error::Result;
use crate::opc::part::{ArchiveEntrySource, PartSource, SharedArchive};
use crate::opc::partname::{CONTENT_TYPES_ENTRY, PACKAGE_RELATIONSHIPS};
use parking_lot::Mutex;
use soapberry_zip::{EntryInfo, EntrySink, SecureZipReader, StreamingArchiveWriter};
use std::io::{Seek, Write};
use std::sync::Arc;

/// Physical package reader over a shared, limit-enforcing archive.
pub(crate) struct PhysPkgReader {
    archive: SharedArchive,
}

impl PhysPkgReader {
    pub(crate) fn new(reader: SecureZipReader) -> Self {
        Self {
            archive: Arc::new(Mutex::new(reader)),
        }
    }

    /// Entry headers in archive order.
    pub(crate) fn entries(&self) -> Vec<EntryInfo> {
        self.archive.lock().entries().to_vec()
    }

    /// Inflate one entry now.
    pub(crate) fn read(&self, entry: &str) -> Result<Vec<u8>> {
        Ok(self.archive.lock().read(entry)?)
    }

    /// A deferred source for an entry, read on first access.
    pub(crate) fn source_for(&self, entry: &EntryInfo) -> Box<dyn PartSource> {
        Box::new(ArchiveEntrySource::new(
            Arc::clone(&self.archive),
            entry.name().to_string(),
            entry.size(),
        ))
    }

    /// Bytes inflated so far, for callers budgeting total extracted size.
    pub(crate) fn inflated_total(&self) -> u64 {
        self.archive.lock().inflated_total()
    }

    /// Release the underlying file or stream.
    ///
    /// Parts still backed by entries fail to read afterwards.
    pub(crate) fn release(&self) {
        self.archive.lock().close();
    }

    /// Reopen the file released by [`release`](Self::release).
    pub(crate) fn reopen(&self) -> Result<()> {
        Ok(self.archive.lock().reopen()?)
    }
}

/// Physical package writer.
pub(crate) struct PhysPkgWriter<W: Write + Seek> {
    archive: StreamingArchiveWriter<W>,
}

impl<W: Write + Seek> PhysPkgWriter<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            archive: StreamingArchiveWriter::with_writer(writer),
        }
    }

    /// Write the content-types manifest.
    pub(crate) fn write_content_types(&mut self, xml: &str) -> Result<()> {
        Ok(self.archive.write_deflated(CONTENT_TYPES_ENTRY, xml.as_bytes())?)
    }

    /// Write the package-level relationships (`_rels/.rels`).
    pub(crate) fn write_package_relationships(&mut self, xml: &str) -> Result<()> {
        let entry = PACKAGE_RELATIONSHIPS.trim_start_matches('/');
        Ok(self.archive.write_deflated(entry, xml.as_bytes())?)
    }

    /// The archive as a sink for marshallers.
    pub(crate) fn sink(&mut self) -> &mut dyn EntrySink {
        &mut self.archive
    }

    /// Write the central directory and hand back the destination.
    pub(crate) fn finish(self) -> Result<W> {
        Ok(self.archive.finish()?)
    }
}
