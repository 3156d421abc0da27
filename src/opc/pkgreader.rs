//! Turns a ZIP archive into the parts, content types and relationships of a package.
//!
//! Load order:
//!
//! 1. find and parse `[Content_Types].xml`, or report which foreign format
//!    the archive looks like instead
//! 2. map every remaining entry to a part name, rejecting duplicates (M1.12)
//! 3. parse the package relationships, attach every other `.rels` entry to
//!    its source part as a lazily parsed backing store
//! 4. run the unmarshallers, core properties first

use crate::opc::config::{LoadMode, PackageAccess, PackageConfig};
use crate::opc::constants::{content_type as ct, relationship_type as rt};
use crate::opc::content_types::ContentTypeRegistry;
use crate::opc::error::{ForeignFormat, OpcError, Result};
use crate::opc::marshal::{UnmarshalContext, UnmarshallerRegistry};
use crate::opc::part::Part;
use crate::opc::partname::{CONTENT_TYPES_ENTRY, PartName};
use crate::opc::phys_pkg::PhysPkgReader;
use crate::opc::properties::CoreProperties;
use crate::opc::rel::RelationshipCollection;
use crate::opc::uri;
use log::{debug, warn};
use soapberry_zip::EntryInfo;
use std::collections::BTreeMap;

/// Entries under this prefix are deleted content some producers leave behind.
const TRASH_PREFIX: &str = "[trash]";

/// Everything a package holds after open.
pub(crate) struct LoadedPackage {
    pub(crate) content_types: ContentTypeRegistry,
    pub(crate) root_rels: RelationshipCollection,
    pub(crate) parts: BTreeMap<PartName, Part>,
    pub(crate) core_properties: Option<CoreProperties>,
    pub(crate) core_properties_part: Option<PartName>,
}

/// Load a package from an opened archive.
///
/// # Arguments
///
/// * `phys` - The archive
/// * `access` - Access mode handed to every part
/// * `config` - Storage and load-mode options
/// * `unmarshallers` - Loaders to run over the parts
///
/// # Returns
///
/// The assembled package contents. With [`LoadMode::Eager`] the archive has
/// been released when this returns.
pub(crate) fn load(
    phys: &PhysPkgReader,
    access: PackageAccess,
    config: &PackageConfig,
    unmarshallers: &UnmarshallerRegistry,
) -> Result<LoadedPackage> {
    let entries = phys.entries();
    let content_types = read_content_types(phys, &entries)?;

    let mut parts: BTreeMap<PartName, Part> = BTreeMap::new();
    let mut rels_entries: BTreeMap<PartName, &EntryInfo> = BTreeMap::new();

    for entry in &entries {
        let entry_name = entry.name();
        if entry.is_dir()
            || entry_name.eq_ignore_ascii_case(CONTENT_TYPES_ENTRY)
            || entry_name.starts_with(TRASH_PREFIX)
        {
            continue;
        }

        let part_name = match uri::part_name_from_zip_item(entry_name) {
            Ok(name) => name,
            Err(e) => {
                warn!("skipping archive entry '{entry_name}' with an invalid part name: {e}");
                continue;
            },
        };

        if parts.contains_key(&part_name) || rels_entries.contains_key(&part_name) {
            return Err(OpcError::conformance(
                "M1.12",
                part_name.as_str(),
                "a package implementer shall neither create nor recognize a part with a part name derived from another part name by case-insensitive comparison",
            ));
        }

        if part_name.is_relationship_part_name() {
            rels_entries.insert(part_name, entry);
            continue;
        }

        let Some(content_type) = content_types.content_type(&part_name).cloned() else {
            return Err(OpcError::conformance(
                "M1.14",
                part_name.as_str(),
                "the part does not have any content type; package require content types when retrieving a part from a package",
            ));
        };
        let part = Part::new(
            part_name.clone(),
            content_type,
            phys.source_for(entry),
            access,
            config.part_storage,
        );
        parts.insert(part_name, part);
    }

    let root_rels = attach_relationships(phys, &mut parts, rels_entries)?;

    let core_properties_part = find_core_properties_part(&root_rels, &parts).or_else(|| {
        parts
            .values()
            .find(|part| part.content_type().matches(ct::OPC_CORE_PROPERTIES))
            .map(|part| part.name().clone())
    });
    let mut context = UnmarshalContext::default();
    if let Some(part) = core_properties_part.as_ref().and_then(|name| parts.get(name)) {
        unmarshallers.unmarshal(&mut context, part)?;
    }
    for (name, part) in &parts {
        if core_properties_part.as_ref() != Some(name) {
            unmarshallers.unmarshal(&mut context, part)?;
        }
    }

    if config.load_mode == LoadMode::Eager {
        for part in parts.values_mut() {
            part.load_eagerly()?;
        }
        phys.release();
    }

    Ok(LoadedPackage {
        content_types,
        root_rels,
        parts,
        core_properties: context.core_properties,
        core_properties_part,
    })
}

/// Parse the manifest, or explain why the archive is not a package.
fn read_content_types(phys: &PhysPkgReader, entries: &[EntryInfo]) -> Result<ContentTypeRegistry> {
    let mut manifests = entries
        .iter()
        .filter(|e| e.name().eq_ignore_ascii_case(CONTENT_TYPES_ENTRY));

    let Some(manifest) = manifests.next() else {
        return Err(classify_foreign(entries));
    };
    if manifests.next().is_some() {
        return Err(OpcError::conformance(
            "M1.12",
            CONTENT_TYPES_ENTRY,
            "the content types part is present more than once",
        ));
    }

    ContentTypeRegistry::from_xml(&phys.read(manifest.name())?)
}

/// The error for an archive without a content-types manifest.
fn classify_foreign(entries: &[EntryInfo]) -> OpcError {
    let has = |name: &str| entries.iter().any(|e| e.name() == name);

    if has("mimetype") && has("settings.xml") {
        return OpcError::ForeignFormat(ForeignFormat::OpenDocument);
    }
    if entries
        .iter()
        .any(|e| e.name().starts_with("Index/") && e.name().ends_with(".iwa"))
    {
        return OpcError::ForeignFormat(ForeignFormat::IWork);
    }
    if entries.is_empty() {
        return OpcError::EmptyArchive;
    }
    OpcError::conformance(
        "M1.13",
        CONTENT_TYPES_ENTRY,
        "package should contain a content type part",
    )
}

/// Parse the package relationships and hand every other `.rels` entry to its source part.
fn attach_relationships(
    phys: &PhysPkgReader,
    parts: &mut BTreeMap<PartName, Part>,
    rels_entries: BTreeMap<PartName, &EntryInfo>,
) -> Result<RelationshipCollection> {
    let mut root_rels = RelationshipCollection::new(PartName::root());

    for (rels_name, entry) in rels_entries {
        let source = match uri::source_part_name_from_rels(&rels_name) {
            Ok(source) => source,
            Err(e) => {
                warn!("skipping relationship entry '{}': {}", entry.name(), e);
                continue;
            },
        };

        if source.is_root() {
            root_rels = RelationshipCollection::from_xml(
                PartName::root(),
                rels_name.as_str(),
                &phys.read(entry.name())?,
            )?;
            continue;
        }

        match parts.get_mut(&source) {
            Some(part) => part.set_relationship_source(phys.source_for(entry)),
            None => debug!("dropping relationship entry '{}' without a source part", entry.name()),
        }
    }

    Ok(root_rels)
}

/// The part targeted by the package's core-properties relationship, if it exists.
fn find_core_properties_part(
    root_rels: &RelationshipCollection,
    parts: &BTreeMap<PartName, Part>,
) -> Option<PartName> {
    let candidates: Vec<PartName> = [rt::CORE_PROPERTIES, rt::CORE_PROPERTIES_ECMA376]
        .iter()
        .flat_map(|rel_type| root_rels.by_type(rel_type))
        .filter(|rel| !rel.is_external())
        .filter_map(|rel| rel.target_part_name().ok())
        .filter(|name| parts.contains_key(name))
        .collect();

    if candidates.len() > 1 {
        warn!("package has {} core properties relationships [M4.1]; using the first", candidates.len());
    }
    candidates.into_iter().next()
}
