//! Package writer for OPC packages.
//!
//! This module serializes a package into a ZIP archive, in this order:
//! - [Content_Types].xml
//! - _rels/.rels (package relationships)
//! - every part through its marshaller, each followed by its own `.rels`
//!
//! In-place saves go through [`save_staged`], which never touches the
//! original file until the new archive is complete.

use crate::opc::content_types::ContentTypeRegistry;
use crate::opc::error::{OpcError, Result};
use crate::opc::marshal::MarshallerRegistry;
use crate::opc::part::Part;
use crate::opc::partname::PartName;
use crate::opc::phys_pkg::{PhysPkgReader, PhysPkgWriter};
use crate::opc::rel::RelationshipCollection;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

/// Serializes temp-file name generation across concurrent in-place saves.
static TEMP_NAME_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Borrowed view of everything that goes into the archive.
pub(crate) struct PackageContents<'a> {
    pub(crate) content_types: &'a ContentTypeRegistry,
    pub(crate) root_rels: &'a RelationshipCollection,
    pub(crate) parts: &'a BTreeMap<PartName, Part>,
    pub(crate) marshallers: &'a MarshallerRegistry,
}

impl PackageContents<'_> {
    /// Write the package into `writer`.
    ///
    /// # Returns
    ///
    /// The writer, after the central directory has been written
    pub(crate) fn write<W: Write + Seek>(&self, writer: W) -> Result<W> {
        let mut phys = PhysPkgWriter::new(writer);

        phys.write_content_types(&self.content_types.to_xml())?;
        phys.write_package_relationships(&self.root_rels.to_xml()?)?;
        for part in self.parts.values() {
            debug!("marshalling {}", part.name());
            self.marshallers.marshal(part, phys.sink())?;
        }

        phys.finish()
    }

    /// Write the package to a file that is not the package's own source.
    pub(crate) fn write_to_path(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .map_err(|e| OpcError::io("creating the output file", Some(path.to_path_buf()), e))?;
        let mut writer = self.write(BufWriter::new(file))?;
        writer
            .flush()
            .map_err(|e| OpcError::io("writing the output file", Some(path.to_path_buf()), e))
    }
}

/// Replace `target` with a freshly written archive, atomically.
///
/// The archive is staged in a temporary file next to `target` and renamed
/// over it once complete. On any failure the temporary file is removed and
/// `target` keeps its previous bytes.
///
/// `held` is the reader still open on `target`. It stays open throughout,
/// except on Windows where a file cannot be replaced while open: there it
/// is released just before the rename and reopened if the rename fails.
pub(crate) fn save_staged(
    target: &Path,
    contents: &PackageContents<'_>,
    held: Option<&PhysPkgReader>,
) -> Result<()> {
    let dir = match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut staged = {
        let _guard = TEMP_NAME_LOCK.lock();
        tempfile::Builder::new()
            .prefix(".~longan")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| OpcError::io("creating a temporary file", Some(dir.to_path_buf()), e))?
    };
    debug!("staging save of {} in {}", target.display(), staged.path().display());

    let written = contents
        .write(BufWriter::new(staged.as_file_mut()))
        .and_then(|mut writer| {
            writer
                .flush()
                .map_err(|e| OpcError::io("writing the temporary file", None, e))
        })
        .and_then(|_| {
            staged
                .as_file()
                .sync_all()
                .map_err(|e| OpcError::io("syncing the temporary file", None, e))
        });

    if let Err(e) = written {
        discard(staged);
        return Err(e);
    }

    let held = held.filter(|_| cfg!(windows));
    if let Some(reader) = held {
        reader.release();
    }
    staged.persist(target).map_err(|err| {
        let tempfile::PersistError { error, file } = err;
        discard(file);
        if let Some(reader) = held {
            if let Err(e) = reader.reopen() {
                warn!("failed to reopen {} after a failed save: {}", target.display(), e);
            }
        }
        OpcError::io("replacing the package file", Some(target.to_path_buf()), error)
    })?;
    Ok(())
}

/// Delete a staged file, logging instead of failing.
fn discard(staged: tempfile::NamedTempFile) {
    let path = staged.path().to_path_buf();
    if let Err(e) = staged.close() {
        warn!("failed to delete temporary file {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opc::config::{PackageAccess, PartStorage};
    use crate::opc::constants::{content_type as ct, relationship_type as rt};
    use crate::opc::content_type::ContentType;
    use crate::opc::marshal::PartMarshaller;
    use crate::opc::uri::Uri;
    use crate::opc::rel::TargetMode;
    use soapberry_zip::{EntrySink, SecureZipReader, ZipLimits};
    use std::io::Cursor;

    struct Contents {
        content_types: ContentTypeRegistry,
        root_rels: RelationshipCollection,
        parts: BTreeMap<PartName, Part>,
        marshallers: MarshallerRegistry,
    }

    impl Contents {
        fn new() -> Self {
            let name = PartName::parse("/word/document.xml").unwrap();
            let content_type = ContentType::parse(ct::WML_DOCUMENT_MAIN).unwrap();
            let mut content_types = ContentTypeRegistry::new();
            content_types.add_content_type(&name, content_type.clone());

            let mut part = Part::created(name.clone(), content_type, PackageAccess::ReadWrite, PartStorage::Memory);
            part.set_content(b"<w:document/>".to_vec()).unwrap();

            let mut root_rels = RelationshipCollection::new(PartName::root());
            root_rels
                .add(Uri::from(&name), TargetMode::Internal, rt::OFFICE_DOCUMENT, None)
                .unwrap();

            Self {
                content_types,
                root_rels,
                parts: BTreeMap::from([(name, part)]),
                marshallers: MarshallerRegistry::with_defaults().unwrap(),
            }
        }

        fn view(&self) -> PackageContents<'_> {
            PackageContents {
                content_types: &self.content_types,
                root_rels: &self.root_rels,
                parts: &self.parts,
                marshallers: &self.marshallers,
            }
        }
    }

    struct Failing;

    impl PartMarshaller for Failing {
        fn name(&self) -> &str {
            "Failing"
        }

        fn marshal(&self, part: &Part, sink: &mut dyn EntrySink) -> Result<()> {
            sink.write_deflated("partial.bin", &[0u8; 64])?;
            Err(OpcError::InvalidState(format!("cannot write {}", part.name())))
        }
    }

    #[test]
    fn test_entry_order() {
        let contents = Contents::new();
        let bytes = contents.view().write(Cursor::new(Vec::new())).unwrap().into_inner();
        let reader = SecureZipReader::from_bytes(bytes, ZipLimits::default()).unwrap();
        let names: Vec<&str> = reader.entries().iter().map(|e| e.name()).collect();
        assert_eq!(names, ["[Content_Types].xml", "_rels/.rels", "word/document.xml"]);
    }

    #[test]
    fn test_staged_save_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("doc.docx");
        std::fs::write(&target, b"old").unwrap();

        let contents = Contents::new();
        save_staged(&target, &contents.view(), None).unwrap();

        let bytes = std::fs::read(&target).unwrap();
        assert!(SecureZipReader::from_bytes(bytes, ZipLimits::default()).is_ok());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_failed_staged_save_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("doc.docx");
        std::fs::write(&target, b"original bytes").unwrap();

        let mut contents = Contents::new();
        contents
            .marshallers
            .insert(ContentType::parse(ct::WML_DOCUMENT_MAIN).unwrap(), Box::new(Failing));

        let err = save_staged(&target, &contents.view(), None).unwrap_err();
        assert!(matches!(err, OpcError::Marshal { .. }));
        assert_eq!(std::fs::read(&target).unwrap(), b"original bytes");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
