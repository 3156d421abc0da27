//! Pluggable part serializers and loaders.
//!
//! On save, every part is handed to the [`PartMarshaller`] registered for its
//! content type, or to the [`DefaultMarshaller`]. On open, a
//! [`PartUnmarshaller`] registered for a part's content type gets a look at
//! the part before the package is returned; the core-properties loader is the
//! one registered out of the box.

use crate::opc::constants::content_type as ct;
use crate::opc::content_type::ContentType;
use crate::opc::error::{OpcError, Result};
use crate::opc::part::Part;
use crate::opc::properties::CoreProperties;
use crate::opc::uri;
use log::warn;
use soapberry_zip::EntrySink;
use std::collections::HashMap;

/// Writes a part (and its relationships) into the output archive.
pub trait PartMarshaller: Send + Sync {
    /// Name used in error messages.
    fn name(&self) -> &str;

    fn marshal(&self, part: &Part, sink: &mut dyn EntrySink) -> Result<()>;
}

/// State shared with unmarshallers while a package is opened.
#[derive(Debug, Default)]
pub struct UnmarshalContext {
    /// Core properties, once a core-properties part has been loaded
    pub core_properties: Option<CoreProperties>,
}

/// Inspects or loads a part while a package is opened.
pub trait PartUnmarshaller: Send + Sync {
    fn unmarshal(&self, context: &mut UnmarshalContext, part: &Part) -> Result<()>;
}

/// Write the part's `.rels` entry, if it has any relationships.
pub fn marshal_relationships(part: &Part, sink: &mut dyn EntrySink) -> Result<()> {
    let rels = part.relationships()?;
    if rels.is_empty() {
        return Ok(());
    }
    let rels_name = part.name().to_rels_part_name()?;
    sink.write_deflated(&uri::zip_item_name(&rels_name), rels.to_xml()?.as_bytes())?;
    Ok(())
}

/// Deflates the part content.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMarshaller;

impl PartMarshaller for DefaultMarshaller {
    fn name(&self) -> &str {
        "DefaultMarshaller"
    }

    fn marshal(&self, part: &Part, sink: &mut dyn EntrySink) -> Result<()> {
        sink.write_deflated(&uri::zip_item_name(part.name()), &part.content()?)?;
        marshal_relationships(part, sink)
    }
}

/// Stores the part content uncompressed, for media that is compressed already.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoredMarshaller;

impl PartMarshaller for StoredMarshaller {
    fn name(&self) -> &str {
        "StoredMarshaller"
    }

    fn marshal(&self, part: &Part, sink: &mut dyn EntrySink) -> Result<()> {
        sink.write_stored(&uri::zip_item_name(part.name()), &part.content()?)?;
        marshal_relationships(part, sink)
    }
}

/// Parses the core-properties part into the open context.
///
/// Only the first core-properties part counts; later ones break M4.1 and
/// are ignored with a warning.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorePropertiesUnmarshaller;

impl PartUnmarshaller for CorePropertiesUnmarshaller {
    fn unmarshal(&self, context: &mut UnmarshalContext, part: &Part) -> Result<()> {
        if context.core_properties.is_some() {
            warn!(
                "ignoring {}: a package may contain only one core properties part [M4.1]",
                part.name()
            );
            return Ok(());
        }
        let props = CoreProperties::from_xml(part.name().as_str(), &part.content()?)?;
        context.core_properties = Some(props);
        Ok(())
    }
}

/// Marshallers keyed by content type, with a fallback.
pub(crate) struct MarshallerRegistry {
    marshallers: HashMap<ContentType, Box<dyn PartMarshaller>>,
    fallback: Box<dyn PartMarshaller>,
}

impl MarshallerRegistry {
    /// Registry with [`StoredMarshaller`] for PNG, JPEG and GIF.
    pub(crate) fn with_defaults() -> Result<Self> {
        let mut registry = Self {
            marshallers: HashMap::new(),
            fallback: Box::new(DefaultMarshaller),
        };
        for media in [ct::PNG, ct::JPEG, ct::GIF] {
            registry.insert(ContentType::parse(media)?, Box::new(StoredMarshaller));
        }
        Ok(registry)
    }

    pub(crate) fn insert(&mut self, content_type: ContentType, marshaller: Box<dyn PartMarshaller>) {
        self.marshallers.insert(content_type, marshaller);
    }

    pub(crate) fn remove(&mut self, content_type: &ContentType) -> bool {
        self.marshallers.remove(content_type).is_some()
    }

    pub(crate) fn resolve(&self, content_type: &ContentType) -> &dyn PartMarshaller {
        self.marshallers
            .get(content_type)
            .map_or(self.fallback.as_ref(), |m| m.as_ref())
    }

    /// Marshal one part, wrapping any failure with the part and marshaller names.
    pub(crate) fn marshal(&self, part: &Part, sink: &mut dyn EntrySink) -> Result<()> {
        let marshaller = self.resolve(part.content_type());
        marshaller
            .marshal(part, sink)
            .map_err(|source| OpcError::Marshal {
                part: part.name().to_string(),
                marshaller: marshaller.name().to_string(),
                source: Box::new(source),
            })
    }
}

/// Unmarshallers keyed by content type.
pub(crate) struct UnmarshallerRegistry {
    unmarshallers: HashMap<ContentType, Box<dyn PartUnmarshaller>>,
}

impl UnmarshallerRegistry {
    /// Registry with [`CorePropertiesUnmarshaller`].
    pub(crate) fn with_defaults() -> Result<Self> {
        let mut registry = Self {
            unmarshallers: HashMap::new(),
        };
        registry.insert(
            ContentType::parse(ct::OPC_CORE_PROPERTIES)?,
            Box::new(CorePropertiesUnmarshaller),
        );
        Ok(registry)
    }

    pub(crate) fn insert(&mut self, content_type: ContentType, unmarshaller: Box<dyn PartUnmarshaller>) {
        self.unmarshallers.insert(content_type, unmarshaller);
    }

    pub(crate) fn remove(&mut self, content_type: &ContentType) -> bool {
        self.unmarshallers.remove(content_type).is_some()
    }

    pub(crate) fn unmarshal(&self, context: &mut UnmarshalContext, part: &Part) -> Result<()> {
        match self.unmarshallers.get(part.content_type()) {
            Some(unmarshaller) => unmarshaller.unmarshal(context, part),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opc::config::{PackageAccess, PartStorage};
    use crate::opc::constants::relationship_type as rt;
    use crate::opc::partname::PartName;
    use soapberry_zip::{SecureZipReader, StreamingArchiveWriter, ZipLimits};

    fn part(name: &str, content_type: &str, data: &[u8]) -> Part {
        let mut part = Part::created(
            PartName::parse(name).unwrap(),
            ContentType::parse(content_type).unwrap(),
            PackageAccess::ReadWrite,
            PartStorage::Memory,
        );
        part.set_content(data.to_vec()).unwrap();
        part
    }

    struct Failing;

    impl PartMarshaller for Failing {
        fn name(&self) -> &str {
            "Failing"
        }

        fn marshal(&self, _part: &Part, _sink: &mut dyn EntrySink) -> Result<()> {
            Err(OpcError::InvalidState("refusing to write".to_string()))
        }
    }

    #[test]
    fn test_default_marshaller_writes_rels_only_when_present() {
        let registry = MarshallerRegistry::with_defaults().unwrap();
        let mut with_rels = part("/word/document.xml", ct::WML_DOCUMENT_MAIN, b"<w:document/>");
        with_rels
            .add_relationship(&PartName::parse("/word/media/image1.png").unwrap(), rt::IMAGE, None)
            .unwrap();
        let plain = part("/word/styles.xml", ct::WML_STYLES, b"<w:styles/>");
        let image = part("/word/media/image1.png", ct::PNG, b"\x89PNG");

        let mut sink = StreamingArchiveWriter::new();
        for p in [&with_rels, &plain, &image] {
            registry.marshal(p, &mut sink).unwrap();
        }
        assert!(sink.contains("word/_rels/document.xml.rels"));
        assert!(!sink.contains("word/_rels/styles.xml.rels"));
        assert_eq!(registry.resolve(image.content_type()).name(), "StoredMarshaller");

        let bytes = sink.finish_to_bytes().unwrap();
        let mut reader = SecureZipReader::from_bytes(bytes, ZipLimits::default()).unwrap();
        let rels = String::from_utf8(reader.read("word/_rels/document.xml.rels").unwrap()).unwrap();
        assert!(rels.contains(r#"Target="media/image1.png""#));
        assert_eq!(reader.read("word/media/image1.png").unwrap(), b"\x89PNG");
    }

    #[test]
    fn test_failure_names_part_and_marshaller() {
        let mut registry = MarshallerRegistry::with_defaults().unwrap();
        let content_type = ContentType::parse(ct::XML).unwrap();
        registry.insert(content_type.clone(), Box::new(Failing));

        let p = part("/custom/data.xml", ct::XML, b"<x/>");
        let mut sink = StreamingArchiveWriter::new();
        let err = registry.marshal(&p, &mut sink).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("/custom/data.xml"));
        assert!(msg.contains("Failing"));

        assert!(registry.remove(&content_type));
        assert!(registry.marshal(&p, &mut sink).is_ok());
    }

    #[test]
    fn test_core_properties_unmarshaller_keeps_first() {
        let registry = UnmarshallerRegistry::with_defaults().unwrap();
        let mut context = UnmarshalContext::default();
        let first = part(
            "/docProps/core.xml",
            ct::OPC_CORE_PROPERTIES,
            br#"<cp:coreProperties xmlns:cp="c" xmlns:dc="d"><dc:title>First</dc:title></cp:coreProperties>"#,
        );
        let second = part(
            "/docProps/core2.xml",
            ct::OPC_CORE_PROPERTIES,
            br#"<cp:coreProperties xmlns:cp="c" xmlns:dc="d"><dc:title>Second</dc:title></cp:coreProperties>"#,
        );
        registry.unmarshal(&mut context, &first).unwrap();
        registry.unmarshal(&mut context, &second).unwrap();
        assert_eq!(
            context.core_properties.and_then(|p| p.title).as_deref(),
            Some("First")
        );
    }
}
