//! Longan - An Open Packaging Conventions (OPC) container engine
//!
//! This library reads, edits and writes the ZIP-based package format shared
//! by Office Open XML documents (.docx, .xlsx, .pptx) and other OPC files.
//!
//! # Features
//!
//! - **Validated names**: Part names and content types are checked against the
//!   OPC grammar when they are constructed
//! - **Relationships**: Package and part relationship graphs, loaded lazily
//! - **Core properties**: Dublin Core document metadata
//! - **Hardened ZIP layer**: Entries that inflate suspiciously are rejected
//!   before they are read (see [`soapberry_zip`])
//! - **Safe saves**: In-place saves are staged in a temporary file and only
//!   replace the original once complete
//!
//! # Example - Listing the parts of a package
//!
//! ```no_run
//! use longan::opc::{OpcPackage, PackageAccess, PackageConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pkg = OpcPackage::open_with("document.docx", PackageAccess::Read, PackageConfig::default())?;
//! for part in pkg.parts()? {
//!     println!("{} ({})", part.name(), part.content_type());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Example - Editing core properties in place
//!
//! ```no_run
//! use longan::opc::OpcPackage;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut pkg = OpcPackage::open("report.xlsx")?;
//! pkg.core_properties_mut()?.title = Some("Quarterly report".to_string());
//! // Writes through a temporary file; the original is untouched on failure
//! pkg.close()?;
//! # Ok(())
//! # }
//! ```

/// Open Packaging Conventions container layer
///
/// Part names, content types, relationships, parts and the package
/// lifecycle (open, create, save, close, revert).
pub mod opc;

// Re-export commonly used types for convenience
pub use opc::{OpcError as Error, OpcPackage, PartName, Result};
