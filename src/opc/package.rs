/// Objects that implement reading and writing OPC packages.
///
/// This module provides the main OpcPackage type, which represents an Open Packaging
/// Convention package in memory. It owns the part table, the content-type registry
/// and the package relationships, and drives the open/save/close/revert lifecycle.
use crate::opc::config::{PackageAccess, PackageConfig};
use crate::opc::constants::{content_type as ct, relationship_type as rt};
use crate::opc::content_type::ContentType;
use crate::opc::content_types::ContentTypeRegistry;
use crate::opc::error::{OpcError, Result};
use crate::opc::marshal::{MarshallerRegistry, PartMarshaller, PartUnmarshaller, UnmarshallerRegistry};
use crate::opc::part::Part;
use crate::opc::partname::{CORE_PROPERTIES_PART, PartName};
use crate::opc::phys_pkg::PhysPkgReader;
use crate::opc::pkgreader;
use crate::opc::pkgwriter::{self, PackageContents};
use crate::opc::properties::CoreProperties;
use crate::opc::rel::{Relationship, RelationshipCollection, TargetMode};
use crate::opc::uri::Uri;
use log::{debug, warn};
use soapberry_zip::SecureZipReader;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};

/// Lifecycle state of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
    /// Created empty, in memory.
    Created,
    /// Opened from a file, buffer or stream.
    Open,
    /// Closed, after saving if it was writable and opened from a file.
    Closed,
    /// Closed without saving.
    Reverted,
}

/// Where the package came from.
#[derive(Debug)]
enum Origin {
    Memory,
    Path {
        path: PathBuf,
        canonical: Option<PathBuf>,
    },
    Stream,
}

/// Main API class for working with OPC packages.
///
/// # Example
///
/// ```no_run
/// use longan::opc::{OpcPackage, PartName};
///
/// let mut pkg = OpcPackage::create()?;
/// let name = PartName::parse("/word/document.xml")?;
/// pkg.create_part(&name, "application/xml")?
///     .set_content(b"<document/>".to_vec())?;
/// pkg.add_relationship(&name, longan::opc::constants::relationship_type::OFFICE_DOCUMENT, None)?;
/// pkg.save_to_path("new.docx")?;
/// # Ok::<(), longan::Error>(())
/// ```
pub struct OpcPackage {
    state: PackageState,
    access: PackageAccess,
    config: PackageConfig,
    origin: Origin,
    /// Source archive; `None` for created packages and once released
    phys: Option<PhysPkgReader>,
    content_types: ContentTypeRegistry,
    root_rels: RelationshipCollection,
    /// All parts, keyed case-insensitively
    parts: BTreeMap<PartName, Part>,
    core_properties: Option<CoreProperties>,
    core_properties_part: Option<PartName>,
    core_properties_dirty: bool,
    marshallers: MarshallerRegistry,
    unmarshallers: UnmarshallerRegistry,
}

impl OpcPackage {
    /// Create a new empty package in memory.
    pub fn create() -> Result<Self> {
        Self::create_with_config(PackageConfig::default())
    }

    pub fn create_with_config(config: PackageConfig) -> Result<Self> {
        Ok(Self {
            state: PackageState::Created,
            access: PackageAccess::ReadWrite,
            config,
            origin: Origin::Memory,
            phys: None,
            content_types: ContentTypeRegistry::new(),
            root_rels: RelationshipCollection::new(PartName::root()),
            parts: BTreeMap::new(),
            core_properties: None,
            core_properties_part: None,
            core_properties_dirty: false,
            marshallers: MarshallerRegistry::with_defaults()?,
            unmarshallers: UnmarshallerRegistry::with_defaults()?,
        })
    }

    /// Create a new empty package that [`close`](Self::close) writes to `path`.
    ///
    /// Fails if `path` already exists.
    pub fn create_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(OpcError::InvalidState(format!(
                "{} already exists: open it or delete the file",
                path.display()
            )));
        }
        let mut package = Self::create()?;
        package.origin = Origin::Path {
            path: path.to_path_buf(),
            canonical: None,
        };
        Ok(package)
    }

    /// Open a package file for reading and writing.
    ///
    /// # Arguments
    /// * `path` - Path to the package file (.docx, .xlsx, .pptx, etc.)
    ///
    /// # Returns
    /// The opened package, or an error telling apart a non-ZIP file, a ZIP in
    /// another format, a conformance violation, a zip bomb and an I/O failure
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, PackageAccess::ReadWrite, PackageConfig::default())
    }

    /// Open a package file with an explicit access mode and configuration.
    ///
    /// Write-only packages need an intact central directory; other modes fall
    /// back to reading the archive as a stream when it is damaged.
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        access: PackageAccess,
        config: PackageConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        let reader = match access {
            PackageAccess::Write => SecureZipReader::open_file_strict(path, config.zip_limits),
            _ => SecureZipReader::open_file(path, config.zip_limits),
        }
        .map_err(|e| with_path(OpcError::from(e), path))?;

        let origin = Origin::Path {
            path: path.to_path_buf(),
            canonical: std::fs::canonicalize(path).ok(),
        };
        Self::load(PhysPkgReader::new(reader), access, config, origin)
    }

    /// Open `path` if it exists, otherwise create a new package there.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create_at(path)
        }
    }

    /// Open a package held in memory.
    pub fn open_bytes(data: Vec<u8>) -> Result<Self> {
        Self::open_bytes_with(data, PackageAccess::ReadWrite, PackageConfig::default())
    }

    pub fn open_bytes_with(data: Vec<u8>, access: PackageAccess, config: PackageConfig) -> Result<Self> {
        let reader = SecureZipReader::from_bytes(data, config.zip_limits)?;
        Self::load(PhysPkgReader::new(reader), access, config, Origin::Memory)
    }

    /// Open a package from a forward-only stream.
    ///
    /// Every entry is inflated while opening, under the configured limits.
    /// Archives written with data descriptors (entry sizes after the data)
    /// cannot be read this way; load them with [`open_bytes`](Self::open_bytes).
    pub fn open_reader<R: Read>(reader: R) -> Result<Self> {
        Self::open_reader_with(reader, PackageAccess::ReadWrite, PackageConfig::default())
    }

    pub fn open_reader_with<R: Read>(
        reader: R,
        access: PackageAccess,
        config: PackageConfig,
    ) -> Result<Self> {
        let reader = SecureZipReader::from_stream(reader, config.zip_limits)?;
        Self::load(PhysPkgReader::new(reader), access, config, Origin::Stream)
    }

    fn load(phys: PhysPkgReader, access: PackageAccess, config: PackageConfig, origin: Origin) -> Result<Self> {
        let marshallers = MarshallerRegistry::with_defaults()?;
        let unmarshallers = UnmarshallerRegistry::with_defaults()?;
        let loaded = pkgreader::load(&phys, access, &config, &unmarshallers)?;

        Ok(Self {
            state: PackageState::Open,
            access,
            config,
            origin,
            phys: Some(phys),
            content_types: loaded.content_types,
            root_rels: loaded.root_rels,
            parts: loaded.parts,
            core_properties: loaded.core_properties,
            core_properties_part: loaded.core_properties_part,
            core_properties_dirty: false,
            marshallers,
            unmarshallers,
        })
    }

    #[inline]
    pub fn access(&self) -> PackageAccess {
        self.access
    }

    #[inline]
    pub fn state(&self) -> PackageState {
        self.state
    }

    /// The file the package was opened from or will be closed to.
    pub fn path(&self) -> Option<&Path> {
        match &self.origin {
            Origin::Path { path, .. } => Some(path),
            Origin::Memory | Origin::Stream => None,
        }
    }

    pub fn config(&self) -> &PackageConfig {
        &self.config
    }

    /// Bytes inflated from the source archive so far.
    ///
    /// Callers enforcing [`soapberry_zip::ZipLimits::max_text_size`] budget against this.
    pub fn inflated_bytes(&self) -> u64 {
        self.phys.as_ref().map_or(0, PhysPkgReader::inflated_total)
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state {
            PackageState::Closed | PackageState::Reverted => Err(OpcError::InvalidState(format!(
                "the package is {:?}",
                self.state
            ))),
            PackageState::Created | PackageState::Open => Ok(()),
        }
    }

    fn ensure_readable(&self) -> Result<()> {
        self.ensure_live()?;
        if self.access.can_read() {
            Ok(())
        } else {
            Err(OpcError::WriteOnly)
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_live()?;
        if self.access.can_write() {
            Ok(())
        } else {
            Err(OpcError::ReadOnly)
        }
    }

    // ---- parts ----

    pub fn part(&self, name: &PartName) -> Result<&Part> {
        self.ensure_readable()?;
        self.parts
            .get(name)
            .ok_or_else(|| OpcError::PartNotFound(name.to_string()))
    }

    pub fn part_mut(&mut self, name: &PartName) -> Result<&mut Part> {
        self.ensure_writable()?;
        self.parts
            .get_mut(name)
            .ok_or_else(|| OpcError::PartNotFound(name.to_string()))
    }

    /// All parts, in part-name order.
    pub fn parts(&self) -> Result<impl Iterator<Item = &Part>> {
        self.ensure_readable()?;
        Ok(self.parts.values())
    }

    pub fn part_exists(&self, name: &PartName) -> bool {
        self.parts.contains_key(name)
    }

    pub fn parts_by_content_type(&self, content_type: &str) -> Result<Vec<&Part>> {
        self.ensure_readable()?;
        let content_type = ContentType::parse(content_type)?;
        Ok(self
            .parts
            .values()
            .filter(|part| *part.content_type() == content_type)
            .collect())
    }

    /// Parts targeted by package relationships of a type.
    pub fn parts_by_relationship_type(&self, rel_type: &str) -> Result<Vec<&Part>> {
        self.ensure_readable()?;
        Ok(internal_targets(self.root_rels.by_type(rel_type).into_iter())
            .iter()
            .filter_map(|name| self.parts.get(name))
            .collect())
    }

    /// The content-type registry.
    pub fn content_types(&self) -> &ContentTypeRegistry {
        &self.content_types
    }

    /// Create an empty part and register its content type.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the new part
    /// * `content_type` - Its content type
    ///
    /// # Returns
    ///
    /// The new part, or a conformance error if the name is taken (M1.12),
    /// names a relationship part, or would be a second core-properties part (M4.1)
    pub fn create_part(&mut self, name: &PartName, content_type: &str) -> Result<&mut Part> {
        self.ensure_writable()?;
        let content_type = ContentType::parse(content_type)?;

        if name.is_relationship_part_name() {
            return Err(OpcError::conformance(
                "M1.25",
                name.as_str(),
                "relationship parts are only created through relationship collections",
            ));
        }
        if self.parts.contains_key(name) {
            return Err(OpcError::conformance(
                "M1.12",
                name.as_str(),
                "a part with the name already exists",
            ));
        }
        if content_type.matches(ct::OPC_CORE_PROPERTIES) {
            if self.core_properties_part.is_some() {
                return Err(OpcError::conformance(
                    "M4.1",
                    name.as_str(),
                    "a package can only have one core properties part",
                ));
            }
            self.core_properties_part = Some(name.clone());
            self.core_properties.get_or_insert_with(CoreProperties::default);
            self.core_properties_dirty = true;
        }

        self.content_types
            .add_content_type(name, content_type.clone());
        let part = Part::created(name.clone(), content_type, self.access, self.config.part_storage);
        Ok(self.parts.entry(name.clone()).or_insert(part))
    }

    /// Remove exactly one part.
    ///
    /// Relationships pointing at it are left alone.
    pub fn remove_part(&mut self, name: &PartName) -> Result<()> {
        self.ensure_writable()?;
        if self.parts.remove(name).is_none() {
            return Err(OpcError::PartNotFound(name.to_string()));
        }
        self.content_types
            .remove_content_type(name, self.parts.keys());
        if self.core_properties_part.as_ref() == Some(name) {
            self.core_properties_part = None;
            self.core_properties = None;
        }
        Ok(())
    }

    /// Remove a part and every part it reaches through internal relationships.
    ///
    /// A reached part is kept, with everything below it, when a part outside
    /// the removed subtree or the package itself also targets it.
    pub fn remove_part_recursive(&mut self, name: &PartName) -> Result<()> {
        self.ensure_writable()?;
        if !self.parts.contains_key(name) {
            return Err(OpcError::PartNotFound(name.to_string()));
        }

        let subtree = self.reachable_from([name.clone()], |_| true)?;

        let mut shared = BTreeSet::new();
        let outside = self
            .parts
            .iter()
            .filter(|(part_name, _)| !subtree.contains(*part_name))
            .map(|(_, part)| part.relationships());
        for rels in outside.chain(std::iter::once(Ok(&self.root_rels))) {
            for target in internal_targets(rels?.iter()) {
                if target != *name && subtree.contains(&target) {
                    shared.insert(target);
                }
            }
        }
        let kept = self.reachable_from(shared, |target| target != name)?;

        for part_name in subtree.difference(&kept) {
            debug!("removing {part_name}");
            self.remove_part(part_name)?;
        }
        Ok(())
    }

    /// Parts reachable from `start` through internal relationships, `start` included.
    fn reachable_from(
        &self,
        start: impl IntoIterator<Item = PartName>,
        follow: impl Fn(&PartName) -> bool,
    ) -> Result<BTreeSet<PartName>> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<PartName> = start.into_iter().collect();

        while let Some(part_name) = queue.pop_front() {
            let Some(part) = self.parts.get(&part_name) else {
                continue;
            };
            if !seen.insert(part_name) {
                continue;
            }
            for target in internal_targets(part.relationships()?.iter()) {
                if follow(&target) && !seen.contains(&target) {
                    queue.push_back(target);
                }
            }
        }
        Ok(seen)
    }

    /// Lowest index `n >= 1` for which the template, with `%d` replaced by
    /// `n`, names no existing part.
    ///
    /// # Example
    ///
    /// `"/ppt/slides/slide%d.xml"` gives `3` when slides 1 and 2 exist.
    pub fn unused_part_index(&self, template: &str) -> Result<u32> {
        if !template.contains("%d") {
            return Err(OpcError::ContractViolation(format!(
                "part name template '{template}' has no %d placeholder"
            )));
        }
        for index in 1..=u32::MAX {
            let candidate = PartName::parse(&template.replacen("%d", &index.to_string(), 1))?;
            if !self.parts.contains_key(&candidate) {
                return Ok(index);
            }
        }
        Err(OpcError::ContractViolation(format!(
            "no unused part index left for template '{template}'"
        )))
    }

    /// The first unused part name for a `%d` template.
    pub fn next_part_name(&self, template: &str) -> Result<PartName> {
        let index = self.unused_part_index(template)?;
        PartName::parse(&template.replacen("%d", &index.to_string(), 1))
    }

    /// Replace a content type in the registry and on every part carrying it.
    ///
    /// # Returns
    ///
    /// `true` if anything changed
    pub fn replace_content_type(&mut self, old: &str, new: &str) -> Result<bool> {
        self.ensure_writable()?;
        let old = ContentType::parse(old)?;
        let new = ContentType::parse(new)?;

        let mut changed = self.content_types.replace_content_type(&old, &new);
        for part in self.parts.values_mut() {
            if *part.content_type() == old {
                part.set_content_type(new.clone());
                changed = true;
            }
        }
        Ok(changed)
    }

    // ---- package relationships ----

    pub fn relationships(&self) -> Result<&RelationshipCollection> {
        self.ensure_readable()?;
        Ok(&self.root_rels)
    }

    pub fn relationships_by_type(&self, rel_type: &str) -> Result<Vec<&Relationship>> {
        Ok(self.relationships()?.by_type(rel_type))
    }

    /// Relate the package to a part.
    pub fn add_relationship(
        &mut self,
        target: &PartName,
        rel_type: &str,
        id: Option<&str>,
    ) -> Result<&Relationship> {
        self.ensure_writable()?;
        self.root_rels
            .add(Uri::from(target), TargetMode::Internal, rel_type, id)
    }

    /// Relate the package to a resource outside it.
    pub fn add_external_relationship(
        &mut self,
        target: &str,
        rel_type: &str,
        id: Option<&str>,
    ) -> Result<&Relationship> {
        self.ensure_writable()?;
        let target = Uri::parse(target)?;
        self.root_rels
            .add(target, TargetMode::External, rel_type, id)
    }

    pub fn remove_relationship(&mut self, id: &str) -> Result<Relationship> {
        self.ensure_writable()?;
        self.root_rels
            .remove(id)
            .ok_or_else(|| OpcError::RelationshipNotFound(id.to_string()))
    }

    // ---- marshallers ----

    /// Use `marshaller` for parts of a content type from now on.
    pub fn add_marshaller(&mut self, content_type: &str, marshaller: Box<dyn PartMarshaller>) -> Result<()> {
        self.marshallers
            .insert(ContentType::parse(content_type)?, marshaller);
        Ok(())
    }

    pub fn remove_marshaller(&mut self, content_type: &str) -> Result<bool> {
        Ok(self.marshallers.remove(&ContentType::parse(content_type)?))
    }

    /// Register an unmarshaller. It takes effect for packages loaded later
    /// through this registry, so it mostly matters before a reload.
    pub fn add_unmarshaller(&mut self, content_type: &str, unmarshaller: Box<dyn PartUnmarshaller>) -> Result<()> {
        self.unmarshallers
            .insert(ContentType::parse(content_type)?, unmarshaller);
        Ok(())
    }

    pub fn remove_unmarshaller(&mut self, content_type: &str) -> Result<bool> {
        Ok(self.unmarshallers.remove(&ContentType::parse(content_type)?))
    }

    // ---- core properties ----

    pub fn core_properties(&self) -> Option<&CoreProperties> {
        self.core_properties.as_ref()
    }

    /// Core properties for editing, created empty if the package has none.
    ///
    /// Changes are written into the core-properties part on save or flush.
    pub fn core_properties_mut(&mut self) -> Result<&mut CoreProperties> {
        self.ensure_writable()?;
        self.core_properties_dirty = true;
        Ok(self.core_properties.get_or_insert_with(CoreProperties::default))
    }

    /// Write pending core-properties changes into their part.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_writable()?;
        match self.core_properties_part.clone() {
            Some(name) => self.flush_core_properties(&name),
            None => Ok(()),
        }
    }

    fn flush_core_properties(&mut self, name: &PartName) -> Result<()> {
        let Some(part) = self.parts.get_mut(name) else {
            return Ok(());
        };
        if self.core_properties_dirty || part.size().is_none() {
            let xml = self
                .core_properties
                .get_or_insert_with(CoreProperties::default)
                .to_xml();
            part.replace_content(xml.into_bytes())?;
            self.core_properties_dirty = false;
        }
        Ok(())
    }

    /// Make sure the package has a core-properties part related from the root.
    fn prepare_save(&mut self) -> Result<()> {
        let has_core_rel = [rt::CORE_PROPERTIES, rt::CORE_PROPERTIES_ECMA376]
            .iter()
            .any(|rel_type| !self.root_rels.by_type(rel_type).is_empty());

        if self.core_properties_part.is_none() && !has_core_rel {
            let default_name = PartName::parse(CORE_PROPERTIES_PART)?;
            let name = if self.parts.contains_key(&default_name) {
                self.next_part_name("/docProps/core%d.xml")?
            } else {
                default_name
            };
            debug!("adding core properties part {name}");
            self.create_part(&name, ct::OPC_CORE_PROPERTIES)?;
        }

        if let Some(name) = self.core_properties_part.clone() {
            if !has_core_rel {
                self.root_rels
                    .add(Uri::from(&name), TargetMode::Internal, rt::CORE_PROPERTIES, None)?;
            }
            self.flush_core_properties(&name)?;
        }
        Ok(())
    }

    fn contents(&self) -> PackageContents<'_> {
        PackageContents {
            content_types: &self.content_types,
            root_rels: &self.root_rels,
            parts: &self.parts,
            marshallers: &self.marshallers,
        }
    }

    // ---- save / close ----

    /// Whether `path` is the file this package belongs to.
    fn is_origin(&self, path: &Path) -> bool {
        let Origin::Path {
            path: origin,
            canonical,
        } = &self.origin
        else {
            return false;
        };
        if origin == path {
            return true;
        }
        match (canonical, std::fs::canonicalize(path)) {
            (Some(origin), Ok(path)) => *origin == path,
            _ => false,
        }
    }

    /// Save to a file other than the one the package belongs to.
    ///
    /// Saving over the package's own file must go through [`close`](Self::close).
    pub fn save_to_path<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.ensure_writable()?;
        let path = path.as_ref();
        if self.is_origin(path) {
            return Err(OpcError::ContractViolation(format!(
                "cannot save over {}, the file the package was opened from; use close() instead",
                path.display()
            )));
        }
        self.prepare_save()?;
        self.contents().write_to_path(path)
    }

    /// Save into a seekable writer.
    pub fn save_to_writer<W: Write + Seek>(&mut self, writer: W) -> Result<W> {
        self.ensure_writable()?;
        self.prepare_save()?;
        self.contents().write(writer)
    }

    /// Save into a new buffer.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        Ok(self.save_to_writer(Cursor::new(Vec::new()))?.into_inner())
    }

    /// Save and release the package.
    ///
    /// A writable package belonging to a file is saved over it through a
    /// temporary file; if that fails, the file is untouched, the error is
    /// returned and the package stays open. A read-only package is reverted
    /// instead. Closing a closed package does nothing.
    pub fn close(&mut self) -> Result<()> {
        if matches!(self.state, PackageState::Closed | PackageState::Reverted) {
            return Ok(());
        }
        if self.access == PackageAccess::Read {
            warn!(
                "The close() method is intended to SAVE a package. This package is open in READ ONLY mode, use the revert() method instead!"
            );
            self.revert();
            return Ok(());
        }

        if let Origin::Path { path, .. } = &self.origin {
            let path = path.clone();
            self.prepare_save()?;
            pkgwriter::save_staged(&path, &self.contents(), self.phys.as_ref())?;
        }

        self.release();
        self.state = PackageState::Closed;
        Ok(())
    }

    /// Discard all changes and release the package without writing.
    pub fn revert(&mut self) {
        if matches!(self.state, PackageState::Closed | PackageState::Reverted) {
            return;
        }
        self.release();
        self.state = PackageState::Reverted;
    }

    fn release(&mut self) {
        self.parts.clear();
        if let Some(phys) = self.phys.take() {
            phys.release();
        }
    }
}

impl std::fmt::Debug for OpcPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcPackage")
            .field("state", &self.state)
            .field("access", &self.access)
            .field("origin", &self.origin)
            .field("parts", &self.parts.len())
            .finish()
    }
}

/// Part names targeted by internal relationships that resolve.
fn internal_targets<'a>(rels: impl Iterator<Item = &'a Relationship>) -> Vec<PartName> {
    rels.filter(|rel| !rel.is_external())
        .filter_map(|rel| rel.target_part_name().ok())
        .collect()
}

fn with_path(err: OpcError, path: &Path) -> OpcError {
    match err {
        OpcError::Io {
            operation,
            path: None,
            source,
        } => OpcError::Io {
            operation,
            path: Some(path.to_path_buf()),
            source,
        },
        other => other,
    }
}
