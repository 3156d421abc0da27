//! The content-types manifest (`[Content_Types].xml`).
//!
//! Parts get their content type either from a `Default` element keyed by
//! extension or from an `Override` element naming the part.

use crate::opc::constants::namespace;
use crate::opc::content_type::ContentType;
use crate::opc::error::{OpcError, Result};
use crate::opc::partname::{CONTENT_TYPES_ENTRY, PartName};
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use std::collections::BTreeMap;

/// Maps extensions and part names to content types.
#[derive(Debug, Clone, Default)]
pub struct ContentTypeRegistry {
    /// Lower-cased extension to default content type
    defaults: BTreeMap<String, ContentType>,
    /// Per-part overrides, ordered by part name
    overrides: BTreeMap<PartName, ContentType>,
}

impl ContentTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the manifest document.
    ///
    /// Any declared type that does not parse as a content type, and any
    /// override naming an invalid part, fails the whole load.
    pub fn from_xml(xml: &[u8]) -> Result<Self> {
        let mut registry = Self::new();
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                    b"Default" => {
                        let extension = required_attr(e, b"Extension")?;
                        let content_type = ContentType::parse(&required_attr(e, b"ContentType")?)?;
                        registry.add_default(&extension, content_type);
                    },
                    b"Override" => {
                        let part_name = PartName::parse(&required_attr(e, b"PartName")?)?;
                        let content_type = ContentType::parse(&required_attr(e, b"ContentType")?)?;
                        registry.add_override(part_name, content_type);
                    },
                    _ => {},
                },
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(OpcError::xml(
                        CONTENT_TYPES_ENTRY,
                        format!("Can't read content types part: {e}"),
                    ));
                },
                _ => {},
            }
            buf.clear();
        }

        Ok(registry)
    }

    /// Register the content type of a part.
    ///
    /// A `Default` entry is used when the extension has none yet and the type
    /// is not already the default of another extension; otherwise the part
    /// gets an `Override`.
    pub fn add_content_type(&mut self, part_name: &PartName, content_type: ContentType) {
        let extension = part_name.extension().to_ascii_lowercase();
        if extension.is_empty() {
            self.add_override(part_name.clone(), content_type);
            return;
        }

        match self.defaults.get(&extension) {
            Some(existing) if *existing == content_type => {},
            Some(_) => self.add_override(part_name.clone(), content_type),
            None if self.is_default_type(&content_type) => {
                self.add_override(part_name.clone(), content_type)
            },
            None => self.add_default(&extension, content_type),
        }
    }

    pub fn add_default(&mut self, extension: &str, content_type: ContentType) {
        self.defaults
            .insert(extension.to_ascii_lowercase(), content_type);
    }

    pub fn add_override(&mut self, part_name: PartName, content_type: ContentType) {
        self.overrides.insert(part_name, content_type);
    }

    /// Drop the registration of a removed part.
    ///
    /// The part's override goes if it has one; otherwise the extension
    /// default goes, unless another remaining part still uses the extension.
    ///
    /// # Arguments
    ///
    /// * `part_name` - The part being removed
    /// * `remaining` - Names of the parts still in the package
    ///
    /// # Returns
    ///
    /// `true` if an entry was removed
    pub fn remove_content_type<'a>(
        &mut self,
        part_name: &PartName,
        remaining: impl IntoIterator<Item = &'a PartName>,
    ) -> bool {
        if self.overrides.remove(part_name).is_some() {
            return true;
        }

        let extension = part_name.extension();
        let still_used = remaining.into_iter().any(|other| {
            other != part_name
                && !self.overrides.contains_key(other)
                && other.extension().eq_ignore_ascii_case(extension)
        });
        if still_used {
            return false;
        }
        self.defaults
            .remove(&extension.to_ascii_lowercase())
            .is_some()
    }

    /// Whether the type is registered as a default or an override.
    pub fn is_registered(&self, content_type: &ContentType) -> bool {
        self.is_default_type(content_type) || self.overrides.values().any(|ct| ct == content_type)
    }

    fn is_default_type(&self, content_type: &ContentType) -> bool {
        self.defaults.values().any(|ct| ct == content_type)
    }

    /// Content type of a part: its override, else the default for its extension.
    pub fn content_type(&self, part_name: &PartName) -> Option<&ContentType> {
        self.overrides.get(part_name).or_else(|| {
            self.defaults
                .get(&part_name.extension().to_ascii_lowercase())
        })
    }

    /// Replace every registration of `old` with `new`.
    ///
    /// # Returns
    ///
    /// `true` if at least one entry changed
    pub fn replace_content_type(&mut self, old: &ContentType, new: &ContentType) -> bool {
        let mut changed = false;
        for ct in self.defaults.values_mut().chain(self.overrides.values_mut()) {
            if *ct == *old {
                *ct = new.clone();
                changed = true;
            }
        }
        changed
    }

    /// Default entries, ordered by extension.
    pub fn defaults(&self) -> impl Iterator<Item = (&str, &ContentType)> {
        self.defaults.iter().map(|(ext, ct)| (ext.as_str(), ct))
    }

    /// Override entries, ordered by part name.
    pub fn overrides(&self) -> impl Iterator<Item = (&PartName, &ContentType)> {
        self.overrides.iter()
    }

    /// Serialize the manifest: `Default` elements first, then `Override` elements.
    pub fn to_xml(&self) -> String {
        let mut xml = String::with_capacity(256 + 128 * (self.defaults.len() + self.overrides.len()));

        xml.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        xml.push('\n');
        xml.push_str(&format!(r#"<Types xmlns="{}">"#, namespace::OPC_CONTENT_TYPES));

        for (ext, content_type) in &self.defaults {
            xml.push_str(&format!(
                r#"<Default Extension="{}" ContentType="{}"/>"#,
                escape(ext.as_str()),
                escape(content_type.as_str())
            ));
        }
        for (part_name, content_type) in &self.overrides {
            xml.push_str(&format!(
                r#"<Override PartName="{}" ContentType="{}"/>"#,
                escape(part_name.as_str()),
                escape(content_type.as_str())
            ));
        }

        xml.push_str("</Types>");
        xml
    }
}

fn required_attr(element: &BytesStart<'_>, name: &[u8]) -> Result<String> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| OpcError::xml(CONTENT_TYPES_ENTRY, e))?;
        if attr.key.local_name().as_ref() == name {
            return attr
                .unescape_value()
                .map(|v| v.into_owned())
                .map_err(|e| OpcError::xml(CONTENT_TYPES_ENTRY, e));
        }
    }
    Err(OpcError::xml(
        CONTENT_TYPES_ENTRY,
        format!(
            "element <{}> is missing the {} attribute",
            String::from_utf8_lossy(element.local_name().as_ref()),
            String::from_utf8_lossy(name)
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opc::constants::content_type as ct;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
  <Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
  <Default Extension="XML" ContentType="application/xml"/>
  <Default Extension="png" ContentType="image/png"/>
  <Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/>
  <Override PartName="/docProps/core.xml" ContentType="application/vnd.openxmlformats-package.core-properties+xml"/>
</Types>"#;

    fn part(name: &str) -> PartName {
        PartName::parse(name).unwrap()
    }

    fn content_type(value: &str) -> ContentType {
        ContentType::parse(value).unwrap()
    }

    #[test]
    fn test_lookup() {
        let registry = ContentTypeRegistry::from_xml(MANIFEST.as_bytes()).unwrap();
        assert_eq!(
            registry.content_type(&part("/WORD/document.xml")).unwrap().as_str(),
            ct::WML_DOCUMENT_MAIN
        );
        assert_eq!(registry.content_type(&part("/customXml/item1.xml")).unwrap().as_str(), ct::XML);
        assert_eq!(registry.content_type(&part("/media/a.PNG")).unwrap().as_str(), ct::PNG);
        assert!(registry.content_type(&part("/media/a.gif")).is_none());
        assert!(registry.is_registered(&content_type(ct::OPC_CORE_PROPERTIES)));
        assert!(!registry.is_registered(&content_type(ct::GIF)));
    }

    #[test]
    fn test_rejects_bad_declarations() {
        let bad_type = r#"<Types><Default Extension="xml" ContentType="application xml"/></Types>"#;
        assert!(matches!(
            ContentTypeRegistry::from_xml(bad_type.as_bytes()),
            Err(OpcError::InvalidContentType { .. })
        ));

        let bad_name = r#"<Types><Override PartName="word/a.xml" ContentType="application/xml"/></Types>"#;
        assert!(matches!(
            ContentTypeRegistry::from_xml(bad_name.as_bytes()),
            Err(OpcError::InvalidPartName { .. })
        ));

        let missing = r#"<Types><Default ContentType="application/xml"/></Types>"#;
        assert!(matches!(
            ContentTypeRegistry::from_xml(missing.as_bytes()),
            Err(OpcError::Xml { .. })
        ));

        assert!(ContentTypeRegistry::from_xml(b"<Types></Default>").is_err());
    }

    #[test]
    fn test_add_prefers_default_then_override() {
        let mut registry = ContentTypeRegistry::new();
        registry.add_content_type(&part("/word/document.xml"), content_type(ct::WML_DOCUMENT_MAIN));
        registry.add_content_type(&part("/word/styles.xml"), content_type(ct::WML_STYLES));
        registry.add_content_type(&part("/media/image1.png"), content_type(ct::PNG));
        registry.add_content_type(&part("/media/image2.png"), content_type(ct::PNG));
        registry.add_content_type(&part("/media/photo.jpg"), content_type(ct::PNG));
        registry.add_content_type(&part("/bin/noext"), content_type(ct::XML));

        let defaults: Vec<&str> = registry.defaults().map(|(ext, _)| ext).collect();
        assert_eq!(defaults, ["png", "xml"]);
        let overrides: Vec<&str> = registry.overrides().map(|(p, _)| p.as_str()).collect();
        assert_eq!(overrides, ["/bin/noext", "/media/photo.jpg", "/word/styles.xml"]);
    }

    #[test]
    fn test_remove_keeps_shared_default() {
        let mut registry = ContentTypeRegistry::new();
        let (a, b) = (part("/media/a.png"), part("/media/b.png"));
        registry.add_content_type(&a, content_type(ct::PNG));
        registry.add_content_type(&b, content_type(ct::PNG));

        assert!(!registry.remove_content_type(&a, [&a, &b]));
        assert!(registry.content_type(&b).is_some());
        assert!(registry.remove_content_type(&b, [&b]));
        assert!(registry.content_type(&b).is_none());
    }

    #[test]
    fn test_replace_content_type() {
        let mut registry = ContentTypeRegistry::from_xml(MANIFEST.as_bytes()).unwrap();
        let macro_enabled = content_type("application/vnd.ms-word.document.macroEnabled.main+xml");
        assert!(registry.replace_content_type(&content_type(ct::WML_DOCUMENT_MAIN), &macro_enabled));
        assert_eq!(registry.content_type(&part("/word/document.xml")), Some(&macro_enabled));
        assert!(!registry.replace_content_type(&content_type(ct::GIF), &macro_enabled));
    }

    #[test]
    fn test_to_xml_is_reparseable() {
        let registry = ContentTypeRegistry::from_xml(MANIFEST.as_bytes()).unwrap();
        let xml = registry.to_xml();
        assert!(xml.find("<Default").unwrap() < xml.find("<Override").unwrap());
        assert!(xml.contains(r#"<Default Extension="xml" ContentType="application/xml"/>"#));

        let reparsed = ContentTypeRegistry::from_xml(xml.as_bytes()).unwrap();
        assert_eq!(reparsed.defaults().count(), 3);
        assert_eq!(reparsed.overrides().count(), 2);
    }
}
