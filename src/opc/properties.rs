/// Core properties of a package.
///
/// Core properties live in the part targeted by the package-level
/// core-properties relationship (usually `/docProps/core.xml`) and hold
/// Dublin Core metadata such as title, creator and modification time.
use crate::opc::constants::namespace;
use crate::opc::error::{OpcError, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use quick_xml::Reader;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::{BytesStart, Event};

const MARKUP_COMPATIBILITY: &str = "http://schemas.openxmlformats.org/markup-compatibility/2006";
const W3CDTF: &str = "dcterms:W3CDTF";

/// Document metadata stored in the core-properties part.
///
/// All fields are optional; absent fields are omitted on serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreProperties {
    pub category: Option<String>,
    pub content_status: Option<String>,
    pub content_type: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub creator: Option<String>,
    pub description: Option<String>,
    pub identifier: Option<String>,
    pub keywords: Option<String>,
    pub language: Option<String>,
    pub last_modified_by: Option<String>,
    pub last_printed: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub revision: Option<String>,
    pub subject: Option<String>,
    pub title: Option<String>,
    pub version: Option<String>,
}

/// Which field an element fills.
#[derive(Clone, Copy)]
enum Field {
    Text(fn(&mut CoreProperties) -> &mut Option<String>),
    Date(fn(&mut CoreProperties) -> &mut Option<DateTime<Utc>>),
}

fn field_for(local_name: &[u8]) -> Option<Field> {
    let field = match local_name {
        b"category" => Field::Text(|p| &mut p.category),
        b"contentStatus" => Field::Text(|p| &mut p.content_status),
        b"contentType" => Field::Text(|p| &mut p.content_type),
        b"created" => Field::Date(|p| &mut p.created),
        b"creator" => Field::Text(|p| &mut p.creator),
        b"description" => Field::Text(|p| &mut p.description),
        b"identifier" => Field::Text(|p| &mut p.identifier),
        b"keywords" => Field::Text(|p| &mut p.keywords),
        b"language" => Field::Text(|p| &mut p.language),
        b"lastModifiedBy" => Field::Text(|p| &mut p.last_modified_by),
        b"lastPrinted" => Field::Date(|p| &mut p.last_printed),
        b"modified" => Field::Date(|p| &mut p.modified),
        b"revision" => Field::Text(|p| &mut p.revision),
        b"subject" => Field::Text(|p| &mut p.subject),
        b"title" => Field::Text(|p| &mut p.title),
        b"version" => Field::Text(|p| &mut p.version),
        _ => return None,
    };
    Some(field)
}

impl CoreProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no property is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Parse a core-properties part.
    ///
    /// # Arguments
    ///
    /// * `part` - Name of the part, for error messages
    /// * `xml` - The part content
    ///
    /// # Returns
    ///
    /// The parsed properties, or an error if the XML is malformed, a date is
    /// not W3CDTF, or the markup breaks a core-properties rule (M4.2, M4.5)
    pub fn from_xml(part: &str, xml: &[u8]) -> Result<Self> {
        let mut props = Self::new();
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut current: Option<(Field, String)> = None;
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    check_attributes(part, e)?;
                    current = field_for(e.local_name().as_ref()).map(|field| (field, String::new()));
                },
                Ok(Event::Empty(ref e)) => check_attributes(part, e)?,
                Ok(Event::Text(ref e)) => {
                    if let Some((_, text)) = current.as_mut() {
                        let raw = std::str::from_utf8(e.as_ref()).map_err(|err| {
                            OpcError::xml(part, format!("Invalid UTF-8 in text content: {err}"))
                        })?;
                        text.push_str(raw);
                    }
                },
                Ok(Event::GeneralRef(ref e)) => {
                    if let Some((_, text)) = current.as_mut() {
                        let raw = std::str::from_utf8(e.as_ref()).map_err(|err| {
                            OpcError::xml(part, format!("Invalid UTF-8 in entity reference: {err}"))
                        })?;
                        text.push('&');
                        text.push_str(raw);
                        text.push(';');
                    }
                },
                Ok(Event::End(_)) => {
                    if let Some((field, raw)) = current.take() {
                        let value = unescape(&raw).map_err(|e| OpcError::xml(part, e))?;
                        let value = value.trim();
                        if !value.is_empty() {
                            match field {
                                Field::Text(slot) => *slot(&mut props) = Some(value.to_string()),
                                Field::Date(slot) => {
                                    *slot(&mut props) = Some(parse_datetime(part, value)?)
                                },
                            }
                        }
                    }
                },
                Ok(Event::Eof) => break,
                Err(e) => return Err(OpcError::xml(part, e)),
                _ => {},
            }
            buf.clear();
        }

        Ok(props)
    }

    /// Serialize to a core-properties part document.
    pub fn to_xml(&self) -> String {
        let mut xml = String::with_capacity(512);
        xml.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        xml.push('\n');
        xml.push_str(&format!(
            r#"<cp:coreProperties xmlns:cp="{}" xmlns:dc="{}" xmlns:dcterms="{}" xmlns:dcmitype="{}" xmlns:xsi="{}">"#,
            namespace::OPC_CORE_PROPERTIES,
            namespace::DUBLIN_CORE,
            namespace::DUBLIN_CORE_TERMS,
            namespace::DUBLIN_CORE_TYPES,
            namespace::XML_SCHEMA_INSTANCE
        ));

        push_text(&mut xml, "cp:category", &self.category);
        push_text(&mut xml, "cp:contentStatus", &self.content_status);
        push_text(&mut xml, "cp:contentType", &self.content_type);
        push_date(&mut xml, "dcterms:created", &self.created, true);
        push_text(&mut xml, "dc:creator", &self.creator);
        push_text(&mut xml, "dc:description", &self.description);
        push_text(&mut xml, "dc:identifier", &self.identifier);
        push_text(&mut xml, "cp:keywords", &self.keywords);
        push_text(&mut xml, "dc:language", &self.language);
        push_text(&mut xml, "cp:lastModifiedBy", &self.last_modified_by);
        push_date(&mut xml, "cp:lastPrinted", &self.last_printed, false);
        push_date(&mut xml, "dcterms:modified", &self.modified, true);
        push_text(&mut xml, "cp:revision", &self.revision);
        push_text(&mut xml, "dc:subject", &self.subject);
        push_text(&mut xml, "dc:title", &self.title);
        push_text(&mut xml, "cp:version", &self.version);

        xml.push_str("</cp:coreProperties>");
        xml
    }
}

fn push_text(xml: &mut String, element: &str, value: &Option<String>) {
    if let Some(value) = value {
        xml.push_str(&format!("<{element}>{}</{element}>", escape(value.as_str())));
    }
}

fn push_date(xml: &mut String, element: &str, value: &Option<DateTime<Utc>>, typed: bool) {
    if let Some(value) = value {
        let xsi_type = if typed {
            format!(r#" xsi:type="{W3CDTF}""#)
        } else {
            String::new()
        };
        xml.push_str(&format!(
            "<{element}{xsi_type}>{}</{element}>",
            value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        ));
    }
}

/// Markup compatibility is forbidden (M4.2); `xsi:type` is only allowed as
/// `dcterms:W3CDTF` on `created` and `modified` (M4.5).
fn check_attributes(part: &str, element: &BytesStart<'_>) -> Result<()> {
    let local_name = element.local_name();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| OpcError::xml(part, e))?;
        let key = attr.key.as_ref();
        let value = attr.unescape_value().map_err(|e| OpcError::xml(part, e))?;

        if key.starts_with(b"xmlns") && value == MARKUP_COMPATIBILITY {
            return Err(OpcError::conformance(
                "M4.2",
                part,
                "a format consumer shall consider the use of the Markup Compatibility namespace to be an error",
            ));
        }
        if attr.key.local_name().as_ref() == b"type" && !key.starts_with(b"xmlns") {
            let allowed = matches!(local_name.as_ref(), b"created" | b"modified");
            if !allowed || value != W3CDTF {
                return Err(OpcError::conformance(
                    "M4.5",
                    part,
                    format!(
                        "the xsi:type attribute '{value}' is not allowed on '{}'",
                        String::from_utf8_lossy(local_name.as_ref())
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Parse a W3CDTF timestamp.
///
/// Supports formats like:
/// - 2023-10-10T14:30:00Z
/// - 2023-10-10T14:30:00.1234567+02:00
/// - 2023-10-10T14:30:00
/// - 2023-10-10
fn parse_datetime(part: &str, s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, format) {
            return Ok(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Some(dt) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(DateTime::from_naive_utc_and_offset(dt, Utc));
    }

    Err(OpcError::xml(part, format!("Invalid W3CDTF date: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const PART: &str = "/docProps/core.xml";

    #[test]
    fn test_parse_core_properties_xml() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties"
                   xmlns:dc="http://purl.org/dc/elements/1.1/"
                   xmlns:dcterms="http://purl.org/dc/terms/"
                   xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
    <dc:title>Q3 &amp; Q4 Report</dc:title>
    <dc:creator>Test Author</dc:creator>
    <cp:keywords>test, document</cp:keywords>
    <cp:revision>5</cp:revision>
    <cp:lastPrinted>2023-10-09</cp:lastPrinted>
    <dcterms:created xsi:type="dcterms:W3CDTF">2023-10-10T14:30:00Z</dcterms:created>
    <dcterms:modified xsi:type="dcterms:W3CDTF">2023-10-10T17:30:00+02:00</dcterms:modified>
</cp:coreProperties>"#;

        let props = CoreProperties::from_xml(PART, xml.as_bytes()).unwrap();
        assert_eq!(props.title.as_deref(), Some("Q3 & Q4 Report"));
        assert_eq!(props.creator.as_deref(), Some("Test Author"));
        assert_eq!(props.keywords.as_deref(), Some("test, document"));
        assert_eq!(props.revision.as_deref(), Some("5"));
        assert_eq!(props.created.unwrap().year(), 2023);
        assert_eq!(props.modified.unwrap().hour(), 15);
        assert_eq!(props.last_printed.unwrap().day(), 9);
        assert!(props.subject.is_none());
    }

    #[test]
    fn test_serialize_then_parse() {
        let props = CoreProperties {
            title: Some("<Draft>".to_string()),
            creator: Some("someone".to_string()),
            created: DateTime::parse_from_rfc3339("2024-02-29T08:00:00Z")
                .ok()
                .map(|d| d.with_timezone(&Utc)),
            ..CoreProperties::default()
        };

        let xml = props.to_xml();
        assert!(xml.contains("&lt;Draft&gt;"));
        assert!(xml.contains(r#"<dcterms:created xsi:type="dcterms:W3CDTF">2024-02-29T08:00:00Z</dcterms:created>"#));
        assert_eq!(CoreProperties::from_xml(PART, xml.as_bytes()).unwrap(), props);
        assert!(CoreProperties::new().is_empty());
        assert!(!props.is_empty());
    }

    #[test]
    fn test_rejects_rule_violations() {
        let mc = r#"<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties"
            xmlns:mc="http://schemas.openxmlformats.org/markup-compatibility/2006"/>"#;
        let err = CoreProperties::from_xml(PART, mc.as_bytes()).unwrap_err();
        assert_eq!(err.rule(), Some("M4.2"));

        let bad_type = r#"<cp:coreProperties xmlns:cp="c" xmlns:dc="d" xmlns:xsi="x">
            <dc:title xsi:type="dcterms:W3CDTF">x</dc:title></cp:coreProperties>"#;
        let err = CoreProperties::from_xml(PART, bad_type.as_bytes()).unwrap_err();
        assert_eq!(err.rule(), Some("M4.5"));

        let bad_date = r#"<cp:coreProperties xmlns:cp="c" xmlns:dcterms="t">
            <dcterms:created>yesterday</dcterms:created></cp:coreProperties>"#;
        assert!(matches!(
            CoreProperties::from_xml(PART, bad_date.as_bytes()),
            Err(OpcError::Xml { .. })
        ));
    }
}
