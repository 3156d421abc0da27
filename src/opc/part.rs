/// Parts of an OPC package.
///
/// A [`Part`] is one concrete type whatever holds its bytes. Content comes
/// from a [`PartSource`]: an entry of the archive the package was opened
/// from, an in-memory buffer, or an anonymous temporary file. Relationship
/// parts are never parts of their own; their content backs the part's
/// [`RelationshipCollection`], which is parsed on first use and cached.
use crate::opc::config::{PackageAccess, PartStorage};
use crate::opc::content_type::ContentType;
use crate::opc::error::{OpcError, Result};
use crate::opc::partname::PartName;
use crate::opc::rel::{Relationship, RelationshipCollection, TargetMode};
use crate::opc::uri::Uri;
use log::warn;
use once_cell::unsync::OnceCell;
use parking_lot::Mutex;
use soapberry_zip::SecureZipReader;
use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// Archive reader shared by every part loaded from it.
pub(crate) type SharedArchive = Arc<Mutex<SecureZipReader>>;

/// Where a part's bytes come from.
pub trait PartSource: Send + fmt::Debug {
    /// Read the whole content.
    fn read(&self) -> Result<Vec<u8>>;

    /// Exact content size, if known without reading.
    fn size(&self) -> Option<u64>;
}

/// An entry of the archive the package was opened from.
pub(crate) struct ArchiveEntrySource {
    archive: SharedArchive,
    entry: String,
    size: u64,
}

impl ArchiveEntrySource {
    pub(crate) fn new(archive: SharedArchive, entry: String, size: u64) -> Self {
        Self {
            archive,
            entry,
            size,
        }
    }
}

impl PartSource for ArchiveEntrySource {
    fn read(&self) -> Result<Vec<u8>> {
        Ok(self.archive.lock().read(&self.entry)?)
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

impl fmt::Debug for ArchiveEntrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveEntrySource")
            .field("entry", &self.entry)
            .field("size", &self.size)
            .finish()
    }
}

/// Content held in memory. `None` until something is written.
#[derive(Debug, Default)]
pub(crate) struct MemorySource {
    data: Option<Vec<u8>>,
}

impl MemorySource {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self { data: Some(data) }
    }

    pub(crate) fn unwritten() -> Self {
        Self::default()
    }
}

impl PartSource for MemorySource {
    fn read(&self) -> Result<Vec<u8>> {
        Ok(self.data.clone().unwrap_or_default())
    }

    fn size(&self) -> Option<u64> {
        self.data.as_ref().map(|d| d.len() as u64)
    }
}

/// Content spooled to an anonymous temporary file, removed when dropped.
#[derive(Debug)]
pub(crate) struct TempFileSource {
    file: File,
    len: u64,
}

impl TempFileSource {
    pub(crate) fn new(data: &[u8]) -> Result<Self> {
        let mut file =
            tempfile::tempfile().map_err(|e| OpcError::io("creating a part temp file", None, e))?;
        file.write_all(data)
            .and_then(|_| file.flush())
            .map_err(|e| OpcError::io("writing a part temp file", None, e))?;
        Ok(Self {
            file,
            len: data.len() as u64,
        })
    }
}

impl PartSource for TempFileSource {
    fn read(&self) -> Result<Vec<u8>> {
        let mut file = &self.file;
        let mut data = Vec::with_capacity(self.len as usize);
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_end(&mut data))
            .map_err(|e| OpcError::io("reading a part temp file", None, e))?;
        Ok(data)
    }

    fn size(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// Build the source for freshly written content.
fn store(storage: PartStorage, data: Vec<u8>) -> Result<Box<dyn PartSource>> {
    Ok(match storage {
        PartStorage::Memory => Box::new(MemorySource::new(data)),
        PartStorage::TempFile => Box::new(TempFileSource::new(&data)?),
    })
}

/// A part of a package.
pub struct Part {
    name: PartName,
    content_type: ContentType,
    source: Box<dyn PartSource>,
    /// Content of the part's `.rels` entry, if it had one when loaded
    rels_source: Option<Box<dyn PartSource>>,
    relationships: OnceCell<RelationshipCollection>,
    access: PackageAccess,
    storage: PartStorage,
    dirty: bool,
}

impl Part {
    pub(crate) fn new(
        name: PartName,
        content_type: ContentType,
        source: Box<dyn PartSource>,
        access: PackageAccess,
        storage: PartStorage,
    ) -> Self {
        Self {
            name,
            content_type,
            source,
            rels_source: None,
            relationships: OnceCell::new(),
            access,
            storage,
            dirty: false,
        }
    }

    /// A part with no content yet, as created through the package.
    pub(crate) fn created(
        name: PartName,
        content_type: ContentType,
        access: PackageAccess,
        storage: PartStorage,
    ) -> Self {
        let mut part = Self::new(
            name,
            content_type,
            Box::new(MemorySource::unwritten()),
            access,
            storage,
        );
        part.dirty = true;
        part
    }

    pub(crate) fn set_relationship_source(&mut self, source: Box<dyn PartSource>) {
        self.rels_source = Some(source);
    }

    pub fn name(&self) -> &PartName {
        &self.name
    }

    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    pub(crate) fn set_content_type(&mut self, content_type: ContentType) {
        self.content_type = content_type;
    }

    /// Always `false` for parts reachable through a package: relationship
    /// parts only back relationship collections.
    pub fn is_relationship_part(&self) -> bool {
        self.name.is_relationship_part_name()
    }

    /// Content size in bytes; `None` if it is not known without reading.
    pub fn size(&self) -> Option<u64> {
        self.source.size()
    }

    /// Whether content or relationships changed since the part was loaded.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the relationships were parsed (or created) already.
    pub fn relationships_loaded(&self) -> bool {
        self.relationships.get().is_some()
    }

    /// Stream over the content. Refused in write-only packages.
    pub fn input_stream(&self) -> Result<Cursor<Vec<u8>>> {
        if !self.access.can_read() {
            return Err(OpcError::WriteOnly);
        }
        self.content().map(Cursor::new)
    }

    /// Read the whole content, regardless of access mode.
    ///
    /// Marshallers use this to serialize parts of write-only packages.
    pub fn content(&self) -> Result<Vec<u8>> {
        self.source.read()
    }

    /// Open a stream that replaces the content when closed.
    ///
    /// Nothing written is visible until [`PartWriter::close`] (or drop).
    pub fn output_stream(&mut self) -> Result<PartWriter<'_>> {
        self.ensure_writable()?;
        Ok(PartWriter {
            part: self,
            buffer: Vec::new(),
            committed: false,
        })
    }

    /// Replace the content.
    pub fn set_content(&mut self, data: Vec<u8>) -> Result<()> {
        self.ensure_writable()?;
        self.replace_content(data)
    }

    pub(crate) fn replace_content(&mut self, data: Vec<u8>) -> Result<()> {
        self.source = store(self.storage, data)?;
        self.dirty = true;
        Ok(())
    }

    /// Move archive-backed content and relationships into memory.
    pub(crate) fn load_eagerly(&mut self) -> Result<()> {
        self.relationships()?;
        let data = self.source.read()?;
        self.source = Box::new(MemorySource::new(data));
        self.rels_source = None;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.access.can_write() {
            Ok(())
        } else {
            Err(OpcError::ReadOnly)
        }
    }

    /// The part's relationships, parsed from its `.rels` entry on first use.
    pub fn relationships(&self) -> Result<&RelationshipCollection> {
        self.relationships.get_or_try_init(|| match &self.rels_source {
            Some(source) => {
                let rels_name = self.name.to_rels_part_name()?;
                RelationshipCollection::from_xml(self.name.clone(), rels_name.as_str(), &source.read()?)
            },
            None => Ok(RelationshipCollection::new(self.name.clone())),
        })
    }

    /// Mutable relationships; marks the part dirty.
    pub fn relationships_mut(&mut self) -> Result<&mut RelationshipCollection> {
        self.ensure_writable()?;
        self.relationships()?;
        self.dirty = true;
        self.relationships
            .get_mut()
            .ok_or_else(|| OpcError::InvalidState(format!("relationships of {} not loaded", self.name)))
    }

    pub fn has_relationships(&self) -> Result<bool> {
        Ok(!self.relationships()?.is_empty())
    }

    /// Add an internal relationship to another part.
    ///
    /// # Arguments
    ///
    /// * `target` - The target part
    /// * `rel_type` - Relationship type URI
    /// * `id` - Explicit id, or `None` for the next free `rIdN`
    pub fn add_relationship(
        &mut self,
        target: &PartName,
        rel_type: &str,
        id: Option<&str>,
    ) -> Result<&Relationship> {
        self.relationships_mut()?
            .add(Uri::from(target), TargetMode::Internal, rel_type, id)
    }

    /// Add a relationship to a resource outside the package.
    pub fn add_external_relationship(
        &mut self,
        target: &str,
        rel_type: &str,
        id: Option<&str>,
    ) -> Result<&Relationship> {
        let target = Uri::parse(target)?;
        self.relationships_mut()?
            .add(target, TargetMode::External, rel_type, id)
    }

    pub fn remove_relationship(&mut self, id: &str) -> Result<Relationship> {
        self.relationships_mut()?
            .remove(id)
            .ok_or_else(|| OpcError::RelationshipNotFound(format!("{id} in {}", self.name)))
    }

    pub fn relationship(&self, id: &str) -> Result<Option<&Relationship>> {
        Ok(self.relationships()?.by_id(id))
    }

    pub fn relationships_by_type(&self, rel_type: &str) -> Result<Vec<&Relationship>> {
        Ok(self.relationships()?.by_type(rel_type))
    }
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("source", &self.source)
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Buffered writer returned by [`Part::output_stream`].
///
/// The part keeps its previous content until the writer is closed. Dropping
/// an unclosed writer commits as well, logging instead of reporting failure.
pub struct PartWriter<'a> {
    part: &'a mut Part,
    buffer: Vec<u8>,
    committed: bool,
}

impl PartWriter<'_> {
    /// Replace the part's content with everything written.
    pub fn close(mut self) -> Result<()> {
        self.commit()
    }

    fn commit(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        self.committed = true;
        let data = std::mem::take(&mut self.buffer);
        self.part.replace_content(data)
    }
}

impl Write for PartWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for PartWriter<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.commit() {
            warn!("failed to store new content of {}: {}", self.part.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opc::constants::{content_type as ct, relationship_type as rt};

    fn part(name: &str, access: PackageAccess, storage: PartStorage) -> Part {
        Part::created(
            PartName::parse(name).unwrap(),
            ContentType::parse(ct::XML).unwrap(),
            access,
            storage,
        )
    }

    #[test]
    fn test_output_stream_replaces_on_close() {
        for storage in [PartStorage::Memory, PartStorage::TempFile] {
            let mut p = part("/data/item.xml", PackageAccess::ReadWrite, storage);
            assert_eq!(p.size(), None);
            p.set_content(b"<old/>".to_vec()).unwrap();

            let mut writer = p.output_stream().unwrap();
            writer.write_all(b"<new>").unwrap();
            writer.write_all(b"</new>").unwrap();
            writer.close().unwrap();

            assert_eq!(p.content().unwrap(), b"<new></new>");
            assert_eq!(p.size(), Some(11));
            assert!(p.is_dirty());
        }
    }

    #[test]
    fn test_dropped_writer_commits() {
        let mut p = part("/a.xml", PackageAccess::ReadWrite, PartStorage::Memory);
        {
            let mut writer = p.output_stream().unwrap();
            writer.write_all(b"abc").unwrap();
        }
        assert_eq!(p.content().unwrap(), b"abc");
    }

    #[test]
    fn test_access_checks() {
        let mut read_only = part("/a.xml", PackageAccess::Read, PartStorage::Memory);
        assert!(matches!(read_only.output_stream(), Err(OpcError::ReadOnly)));
        assert!(matches!(
            read_only.add_external_relationship("http://example.com/", rt::HYPERLINK, None),
            Err(OpcError::ReadOnly)
        ));

        let write_only = part("/b.xml", PackageAccess::Write, PartStorage::Memory);
        assert!(matches!(write_only.input_stream(), Err(OpcError::WriteOnly)));
        assert!(write_only.content().is_ok());
    }

    #[test]
    fn test_relationships_load_once_from_backing_entry() {
        let rels = r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
            <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="media/image1.png"/>
        </Relationships>"#;
        let mut p = part("/word/document.xml", PackageAccess::ReadWrite, PartStorage::Memory);
        p.set_relationship_source(Box::new(MemorySource::new(rels.as_bytes().to_vec())));
        assert!(!p.relationships_loaded());

        let first = p.relationships().unwrap().len();
        let second = p.relationships().unwrap().len();
        assert_eq!(first, 1);
        assert_eq!(first, second);
        assert!(p.relationships_loaded());

        let target = PartName::parse("/word/media/image1.png").unwrap();
        assert_eq!(
            p.relationship("rId1").unwrap().unwrap().target_part_name().unwrap(),
            target
        );

        let added = p.add_relationship(&target, rt::IMAGE, None).unwrap().id().to_string();
        assert_eq!(added, "rId2");
        assert_eq!(p.relationships_by_type(rt::IMAGE).unwrap().len(), 2);
        p.remove_relationship("rId1").unwrap();
        assert!(matches!(
            p.remove_relationship("rId1"),
            Err(OpcError::RelationshipNotFound(_))
        ));
    }

    #[test]
    fn test_malformed_relationships_surface_every_time() {
        let mut p = part("/a.xml", PackageAccess::ReadWrite, PartStorage::Memory);
        p.set_relationship_source(Box::new(MemorySource::new(b"<Relationships><Relationship/></Relationships>".to_vec())));
        assert!(p.relationships().is_err());
        assert!(p.relationships().is_err());
    }
}
