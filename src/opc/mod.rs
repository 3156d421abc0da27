/// Open Packaging Conventions (OPC) implementation.
///
/// This module implements the container layer of Office Open XML documents:
///
/// - Package structure (parts, relationships)
/// - Content type management
/// - ZIP-based physical packaging, guarded against decompression bombs
/// - Atomic in-place saves
///
/// # Performance Features
///
/// - Uses `memchr` for fast string searching in part names and URIs
/// - Uses `atoi_simd` for fast relationship id parsing
/// - Uses `quick-xml` for XML parsing
/// - Parts and their relationships are read from the archive on first access

pub mod config;
pub mod constants;
mod content_type;
pub mod content_types;
pub mod error;
pub mod marshal;
pub mod package;
pub mod part;
pub mod partname;
mod phys_pkg;
mod pkgreader;
mod pkgwriter;
pub mod properties;
pub mod rel;
pub mod uri;

// Re-export commonly used types
pub use config::{LoadMode, PackageAccess, PackageConfig, PartStorage};
pub use content_type::ContentType;
pub use content_types::ContentTypeRegistry;
pub use error::{ErrorCategory, ForeignFormat, OpcError, Result};
pub use marshal::{
    CorePropertiesUnmarshaller, DefaultMarshaller, PartMarshaller, PartUnmarshaller,
    StoredMarshaller, UnmarshalContext, marshal_relationships,
};
pub use package::{OpcPackage, PackageState};
pub use part::{Part, PartSource, PartWriter};
pub use partname::PartName;
pub use properties::CoreProperties;
pub use rel::{Relationship, RelationshipCollection, TargetMode};
pub use uri::Uri;
