/// Error types for OPC package operations
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Foreign ZIP-based formats recognised when the content-types manifest is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignFormat {
    /// OpenDocument (`mimetype` + `settings.xml`).
    OpenDocument,
    /// Apple iWork (`Index/*.iwa`).
    IWork,
}

impl fmt::Display for ForeignFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForeignFormat::OpenDocument => f.write_str("OpenDocument (ODF)"),
            ForeignFormat::IWork => f.write_str("Apple iWork"),
        }
    }
}

/// Broad classes of failure, for callers that react per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad part name, content type, URI or XML.
    MalformedInput,
    /// The container is a ZIP but breaks a packaging rule.
    Conformance,
    /// The input is not a package of this format at all.
    Format,
    /// A decompression limit was hit.
    SecurityLimit,
    /// File system or stream failure.
    Resource,
    /// The API was used in a way it does not allow.
    ContractViolation,
}

#[derive(Error, Debug)]
pub enum OpcError {
    #[error("Invalid part name '{name}': {reason} [{rule}]")]
    InvalidPartName {
        name: String,
        rule: &'static str,
        reason: &'static str,
    },

    #[error("Invalid content type '{value}': {reason}")]
    InvalidContentType { value: String, reason: String },

    #[error("Invalid URI '{value}': {reason}")]
    InvalidUri { value: String, reason: String },

    #[error("Invalid relationship: {0}")]
    InvalidRelationship(String),

    #[error("XML parsing error in {part}: {message}")]
    Xml { part: String, message: String },

    /// A packaging rule (M1.x, M4.x) is violated.
    #[error("OPC conformance violation [{rule}] for {part}: {message}")]
    Conformance {
        rule: &'static str,
        part: String,
        message: String,
    },

    #[error("Not a ZIP archive: {0}")]
    NotZip(String),

    #[error("The supplied data appears to be in the {0} format, not an Office Open XML package")]
    ForeignFormat(ForeignFormat),

    #[error("The supplied archive has no entries and is not an Office Open XML package")]
    EmptyArchive,

    #[error("Zip bomb detected: {0}")]
    ZipBomb(String),

    #[error("Entry too large: {0}")]
    EntryTooLarge(String),

    #[error("IO error while {operation}{}: {source}", display_path(.path))]
    Io {
        operation: &'static str,
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("ZIP error: {0}")]
    Zip(String),

    #[error("Part not found: {0}")]
    PartNotFound(String),

    #[error("Relationship not found: {0}")]
    RelationshipNotFound(String),

    #[error("The part {part} failed to be saved in the stream with marshaller {marshaller}: {source}")]
    Marshal {
        part: String,
        marshaller: String,
        #[source]
        source: Box<OpcError>,
    },

    #[error("Operation not allowed, the package is open in read-only mode")]
    ReadOnly,

    #[error("Operation not allowed, the package is open in write-only mode")]
    WriteOnly,

    #[error("Invalid package state: {0}")]
    InvalidState(String),

    /// The API was called in a way it never supports.
    #[error("Contract violation: {0}")]
    ContractViolation(String),
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" {}", p.display()),
        None => String::new(),
    }
}

impl OpcError {
    /// Build an I/O error carrying the failed operation and path.
    pub fn io(operation: &'static str, path: Option<PathBuf>, source: std::io::Error) -> Self {
        OpcError::Io {
            operation,
            path,
            source,
        }
    }

    pub(crate) fn conformance(
        rule: &'static str,
        part: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        OpcError::Conformance {
            rule,
            part: part.into(),
            message: message.into(),
        }
    }

    pub(crate) fn xml(part: impl Into<String>, message: impl fmt::Display) -> Self {
        OpcError::Xml {
            part: part.into(),
            message: message.to_string(),
        }
    }

    /// The taxonomy bucket of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            OpcError::InvalidPartName { .. }
            | OpcError::InvalidContentType { .. }
            | OpcError::InvalidUri { .. }
            | OpcError::InvalidRelationship(_)
            | OpcError::Xml { .. } => ErrorCategory::MalformedInput,
            OpcError::Conformance { .. } => ErrorCategory::Conformance,
            OpcError::NotZip(_) | OpcError::ForeignFormat(_) | OpcError::EmptyArchive => {
                ErrorCategory::Format
            },
            OpcError::ZipBomb(_) | OpcError::EntryTooLarge(_) => ErrorCategory::SecurityLimit,
            OpcError::Io { .. } | OpcError::Zip(_) | OpcError::Marshal { .. } => {
                ErrorCategory::Resource
            },
            OpcError::PartNotFound(_)
            | OpcError::RelationshipNotFound(_)
            | OpcError::ReadOnly
            | OpcError::WriteOnly
            | OpcError::InvalidState(_)
            | OpcError::ContractViolation(_) => ErrorCategory::ContractViolation,
        }
    }

    /// The conformance rule identifier, if this is a conformance violation.
    pub fn rule(&self) -> Option<&'static str> {
        match self {
            OpcError::Conformance { rule, .. } | OpcError::InvalidPartName { rule, .. } => {
                Some(rule)
            },
            _ => None,
        }
    }
}

impl From<std::io::Error> for OpcError {
    fn from(err: std::io::Error) -> Self {
        OpcError::io("performing I/O", None, err)
    }
}

impl From<soapberry_zip::Error> for OpcError {
    fn from(err: soapberry_zip::Error) -> Self {
        use soapberry_zip::Error as ZipLayer;
        match err {
            ZipLayer::NotZip(msg) => OpcError::NotZip(msg),
            err @ ZipLayer::ZipBomb { .. } => OpcError::ZipBomb(err.to_string()),
            err @ ZipLayer::EntryTooLarge { .. } => OpcError::EntryTooLarge(err.to_string()),
            ZipLayer::EntryNotFound(name) => OpcError::PartNotFound(name),
            ZipLayer::Closed => OpcError::InvalidState("the package archive is closed".to_string()),
            ZipLayer::Io { context, source } => OpcError::Io {
                operation: "accessing the archive",
                path: None,
                source: std::io::Error::new(source.kind(), format!("{context}: {source}")),
            },
            other => OpcError::Zip(other.to_string()),
        }
    }
}

impl From<zip::result::ZipError> for OpcError {
    fn from(err: zip::result::ZipError) -> Self {
        OpcError::from(soapberry_zip::Error::from(err))
    }
}

impl From<quick_xml::Error> for OpcError {
    fn from(err: quick_xml::Error) -> Self {
        OpcError::xml("package", err)
    }
}

impl From<quick_xml::events::attributes::AttrError> for OpcError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        OpcError::xml("package", err)
    }
}

pub type Result<T> = std::result::Result<T, OpcError>;
