/// Relationship-related objects for OPC packages.
///
/// This module provides types for managing relationships between parts in an OPC package,
/// including internal and external relationships.
use crate::opc::constants::{namespace, target_mode};
use crate::opc::error::{OpcError, Result};
use crate::opc::partname::PartName;
use crate::opc::uri::{self, Uri};
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use smallvec::SmallVec;

/// Whether a relationship target lives inside the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetMode {
    /// The target is a part, resolved relative to the source part.
    #[default]
    Internal,
    /// The target is an opaque URI outside the package.
    External,
}

impl TargetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetMode::Internal => target_mode::INTERNAL,
            TargetMode::External => target_mode::EXTERNAL,
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            target_mode::INTERNAL => Ok(TargetMode::Internal),
            target_mode::EXTERNAL => Ok(TargetMode::External),
            other => Err(OpcError::InvalidRelationship(format!(
                "unknown TargetMode '{other}'"
            ))),
        }
    }
}

/// A single relationship from a source part (or the package root) to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    /// Relationship ID (e.g., "rId1", "rId2")
    id: String,

    /// Relationship type URI
    rel_type: String,

    /// Target reference, relative or absolute, exactly as it will be written
    target: Uri,

    target_mode: TargetMode,

    /// Part the relationship is declared in
    source: PartName,
}

impl Relationship {
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn rel_type(&self) -> &str {
        &self.rel_type
    }

    /// The target reference.
    ///
    /// For internal relationships this is usually relative to the source
    /// part; use [`target_part_name`](Self::target_part_name) to resolve it.
    #[inline]
    pub fn target(&self) -> &Uri {
        &self.target
    }

    #[inline]
    pub fn target_mode(&self) -> TargetMode {
        self.target_mode
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        self.target_mode == TargetMode::External
    }

    #[inline]
    pub fn source(&self) -> &PartName {
        &self.source
    }

    /// Resolve the target of an internal relationship to a part name.
    ///
    /// Resolution happens on demand, so a relationship may point at a part
    /// that has not been loaded (or does not exist) yet.
    pub fn target_part_name(&self) -> Result<PartName> {
        if self.is_external() {
            return Err(OpcError::InvalidRelationship(format!(
                "relationship {} is external and has no target part",
                self.id
            )));
        }
        uri::resolve_part_name(&self.source, &self.target)
    }
}

/// Ordered relationships declared by one source part.
///
/// Insertion order is preserved; ids are unique within the collection and
/// removing a relationship never renumbers the others.
#[derive(Debug, Clone)]
pub struct RelationshipCollection {
    source: PartName,
    rels: SmallVec<[Relationship; 8]>,
}

impl RelationshipCollection {
    /// Create an empty collection for a source part (or [`PartName::root`]).
    pub fn new(source: PartName) -> Self {
        Self {
            source,
            rels: SmallVec::new(),
        }
    }

    pub fn source(&self) -> &PartName {
        &self.source
    }

    /// Add a relationship.
    ///
    /// # Arguments
    /// * `target` - Target reference; internal targets may be relative or absolute part names
    /// * `target_mode` - Internal or external
    /// * `rel_type` - Relationship type URI
    /// * `id` - Explicit id, or `None` to allocate the next `rIdN`
    ///
    /// # Returns
    /// The stored relationship, or `OpcError::InvalidRelationship` if the explicit id is taken
    pub fn add(
        &mut self,
        target: Uri,
        target_mode: TargetMode,
        rel_type: &str,
        id: Option<&str>,
    ) -> Result<&Relationship> {
        let id = match id {
            Some(id) if id.is_empty() => {
                return Err(OpcError::InvalidRelationship(
                    "relationship id must not be empty".to_string(),
                ));
            },
            Some(id) if self.contains_id(id) => {
                return Err(OpcError::InvalidRelationship(format!(
                    "duplicate relationship id '{id}' in {}",
                    self.source
                )));
            },
            Some(id) => id.to_string(),
            None => self.next_id()?,
        };

        self.rels.push(Relationship {
            id,
            rel_type: rel_type.to_string(),
            target,
            target_mode,
            source: self.source.clone(),
        });
        Ok(&self.rels[self.rels.len() - 1])
    }

    /// Next automatic id: one past the highest `rIdN` in use.
    ///
    /// Once `rId4294967295` is taken, the lowest free `rIdN` is used instead.
    fn next_id(&self) -> Result<String> {
        let max = self
            .rels
            .iter()
            .filter_map(|rel| {
                let digits = rel.id.as_bytes().strip_prefix(b"rId")?;
                atoi_simd::parse_pos::<u32, false>(digits).ok()
            })
            .max()
            .unwrap_or(0);

        if let Some(n) = max.checked_add(1) {
            let candidate = format!("rId{n}");
            if !self.contains_id(&candidate) {
                return Ok(candidate);
            }
        }

        (1..=u32::MAX)
            .map(|n| format!("rId{n}"))
            .find(|candidate| !self.contains_id(candidate))
            .ok_or_else(|| {
                OpcError::InvalidRelationship(format!("no relationship id left in {}", self.source))
            })
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.rels.iter().any(|rel| rel.id == id)
    }

    /// Remove a relationship by id.
    pub fn remove(&mut self, id: &str) -> Option<Relationship> {
        let pos = self.rels.iter().position(|rel| rel.id == id)?;
        Some(self.rels.remove(pos))
    }

    pub fn by_id(&self, id: &str) -> Option<&Relationship> {
        self.rels.iter().find(|rel| rel.id == id)
    }

    /// Relationships of a type, in insertion order.
    pub fn by_type(&self, rel_type: &str) -> Vec<&Relationship> {
        self.rels
            .iter()
            .filter(|rel| rel.rel_type == rel_type)
            .collect()
    }

    /// All relationships, in insertion order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Relationship> {
        self.rels.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rels.is_empty()
    }

    pub fn clear(&mut self) {
        self.rels.clear();
    }

    /// Parse a relationship part.
    ///
    /// Targets are kept as written (after URI repair) and resolved lazily.
    ///
    /// # Arguments
    /// * `source` - The part the relationships belong to
    /// * `rels_part` - Name of the relationship part, for error messages
    /// * `xml` - The `.rels` document
    pub fn from_xml(source: PartName, rels_part: &str, xml: &[u8]) -> Result<Self> {
        let mut collection = Self::new(source);
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e))
                    if e.local_name().as_ref() == b"Relationship" =>
                {
                    collection.push_parsed(e, rels_part)?;
                },
                Ok(Event::Eof) => break,
                Err(e) => return Err(OpcError::xml(rels_part, e)),
                _ => {},
            }
            buf.clear();
        }

        Ok(collection)
    }

    fn push_parsed(&mut self, element: &BytesStart<'_>, rels_part: &str) -> Result<()> {
        let mut id = None;
        let mut rel_type = None;
        let mut target = None;
        let mut mode = TargetMode::Internal;

        for attr in element.attributes() {
            let attr = attr.map_err(|e| OpcError::xml(rels_part, e))?;
            let value = attr
                .unescape_value()
                .map_err(|e| OpcError::xml(rels_part, e))?;
            match attr.key.local_name().as_ref() {
                b"Id" => id = Some(value.into_owned()),
                b"Type" => rel_type = Some(value.into_owned()),
                b"Target" => target = Some(value.into_owned()),
                b"TargetMode" => mode = TargetMode::parse(&value)?,
                _ => {},
            }
        }

        let missing = |attr: &str| {
            OpcError::InvalidRelationship(format!(
                "a relationship in {rels_part} is missing the {attr} attribute"
            ))
        };
        let id = id.ok_or_else(|| missing("Id"))?;
        let rel_type = rel_type.ok_or_else(|| missing("Type"))?;
        let target = target.ok_or_else(|| missing("Target"))?;

        let target = uri::normalize_to_uri(&target).map_err(|e| {
            OpcError::InvalidRelationship(format!(
                "relationship {id} in {rels_part} has an invalid target: {e}"
            ))
        })?;
        self.add(target, mode, &rel_type, Some(&id))?;
        Ok(())
    }

    /// Serialize to a relationship part document, in insertion order.
    ///
    /// Internal targets held as absolute part names are written relative to
    /// the source part.
    pub fn to_xml(&self) -> Result<String> {
        let mut xml = String::with_capacity(128 + 160 * self.rels.len());

        xml.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        xml.push('\n');
        xml.push_str(&format!(
            r#"<Relationships xmlns="{}">"#,
            namespace::OPC_RELATIONSHIPS
        ));

        let source = Uri::from(&self.source);
        for rel in &self.rels {
            let target = if !rel.is_external() && rel.target.as_str().starts_with('/') {
                uri::relativize(&source, &rel.target, true)?
            } else {
                rel.target.clone()
            };
            let target_mode = if rel.is_external() {
                r#" TargetMode="External""#
            } else {
                ""
            };

            xml.push_str(&format!(
                r#"<Relationship Id="{}" Type="{}" Target="{}"{}/>"#,
                escape(rel.id.as_str()),
                escape(rel.rel_type.as_str()),
                escape(target.as_str()),
                target_mode
            ));
        }

        xml.push_str("</Relationships>");
        Ok(xml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opc::constants::relationship_type as rt;
    use proptest::prelude::*;

    fn part(name: &str) -> PartName {
        PartName::parse(name).unwrap()
    }

    fn target(value: &str) -> Uri {
        Uri::parse(value).unwrap()
    }

    #[test]
    fn test_next_id_is_one_past_maximum() {
        let mut rels = RelationshipCollection::new(part("/word/document.xml"));
        for i in 1..=6 {
            let rel = rels
                .add(target(&format!("http://example.com/{i}")), TargetMode::External, rt::HYPERLINK, None)
                .unwrap();
            assert_eq!(rel.id(), format!("rId{i}"));
        }

        assert!(rels.remove("rId3").is_some());
        let added = rels
            .add(target("http://example.com/new"), TargetMode::External, rt::HYPERLINK, None)
            .unwrap();
        assert_eq!(added.id(), "rId7");
        assert!(rels.by_id("rId3").is_none());
        assert_eq!(rels.len(), 6);
    }

    #[test]
    fn test_explicit_ids() {
        let mut rels = RelationshipCollection::new(PartName::root());
        rels.add(target("word/document.xml"), TargetMode::Internal, rt::OFFICE_DOCUMENT, Some("rId9"))
            .unwrap();
        rels.add(target("docProps/core.xml"), TargetMode::Internal, rt::CORE_PROPERTIES, Some("custom"))
            .unwrap();

        let err = rels
            .add(target("x.xml"), TargetMode::Internal, rt::STYLES, Some("rId9"))
            .unwrap_err();
        assert!(matches!(err, OpcError::InvalidRelationship(_)));

        let next = rels
            .add(target("y.xml"), TargetMode::Internal, rt::STYLES, None)
            .unwrap();
        assert_eq!(next.id(), "rId10");
    }

    #[test]
    fn test_next_id_after_largest_id() {
        let mut rels = RelationshipCollection::new(PartName::root());
        rels.add(target("a.xml"), TargetMode::Internal, rt::STYLES, Some("rId4294967295"))
            .unwrap();

        let first = rels
            .add(target("b.xml"), TargetMode::Internal, rt::STYLES, None)
            .unwrap()
            .id()
            .to_string();
        assert_eq!(first, "rId1");
        let second = rels
            .add(target("c.xml"), TargetMode::Internal, rt::STYLES, None)
            .unwrap()
            .id()
            .to_string();
        assert_eq!(second, "rId2");
    }

    #[test]
    fn test_next_id_beside_irregular_ids() {
        let cases: [(&[&str], &str); 6] = [
            (&["rIdX"], "rId1"),
            (&["rId007"], "rId8"),
            (&["rId7", "rId007"], "rId8"),
            (&["rId4294967296"], "rId1"),
            (&["rId4294967294"], "rId4294967295"),
            (&["custom", "rId", "rId-3"], "rId1"),
        ];
        for (existing, expected) in cases {
            let mut rels = RelationshipCollection::new(PartName::root());
            for id in existing {
                rels.add(target("x.xml"), TargetMode::Internal, rt::STYLES, Some(*id))
                    .unwrap();
            }
            let next = rels
                .add(target("y.xml"), TargetMode::Internal, rt::STYLES, None)
                .unwrap();
            assert_eq!(next.id(), expected, "existing ids {existing:?}");
        }
    }

    proptest! {
        #[test]
        fn prop_next_id_is_fresh(ids in proptest::collection::vec(0u64..=u64::from(u32::MAX) + 2, 0..8)) {
            let mut rels = RelationshipCollection::new(PartName::root());
            for n in ids {
                let id = format!("rId{n}");
                if !rels.contains_id(&id) {
                    rels.add(target("x.xml"), TargetMode::Internal, rt::STYLES, Some(id.as_str())).unwrap();
                }
            }
            let before = rels.len();
            let next = rels
                .add(target("y.xml"), TargetMode::Internal, rt::STYLES, None)
                .unwrap()
                .id()
                .to_string();
            prop_assert!(next.starts_with("rId"));
            prop_assert_eq!(rels.len(), before + 1);
            prop_assert_eq!(rels.iter().filter(|rel| rel.id() == next).count(), 1);
        }
    }

    #[test]
    fn test_lookup_preserves_order() {
        let mut rels = RelationshipCollection::new(part("/ppt/slides/slide1.xml"));
        rels.add(target("../media/b.png"), TargetMode::Internal, rt::IMAGE, None).unwrap();
        rels.add(target("../theme/theme1.xml"), TargetMode::Internal, rt::THEME, None).unwrap();
        rels.add(target("../media/a.png"), TargetMode::Internal, rt::IMAGE, None).unwrap();

        let images: Vec<&str> = rels.by_type(rt::IMAGE).iter().map(|r| r.target().as_str()).collect();
        assert_eq!(images, ["../media/b.png", "../media/a.png"]);
        let all: Vec<&str> = rels.iter().map(Relationship::id).collect();
        assert_eq!(all, ["rId1", "rId2", "rId3"]);

        let image = rels.by_id("rId3").unwrap();
        assert_eq!(image.target_part_name().unwrap().as_str(), "/ppt/media/a.png");
    }

    #[test]
    fn test_parse_rels_xml() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>
  <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink" Target="http://" TargetMode="External"/>
  <Relationship Id="rId3" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="media\image1.png"/>
</Relationships>"#;

        let rels = RelationshipCollection::from_xml(part("/word/document.xml"), "/word/_rels/document.xml.rels", xml.as_bytes())
            .unwrap();
        assert_eq!(rels.len(), 3);
        assert_eq!(rels.iter().next().unwrap().id(), "rId2");

        let link = rels.by_id("rId1").unwrap();
        assert!(link.is_external());
        assert_eq!(link.target().as_str(), "http:///");
        assert!(link.target_part_name().is_err());

        let styles = rels.by_id("rId2").unwrap();
        assert_eq!(styles.target_part_name().unwrap().as_str(), "/word/styles.xml");
        assert_eq!(
            rels.by_id("rId3").unwrap().target_part_name().unwrap().as_str(),
            "/word/media/image1.png"
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let source = part("/word/document.xml");
        let missing_target = r#"<Relationships><Relationship Id="rId1" Type="t"/></Relationships>"#;
        assert!(matches!(
            RelationshipCollection::from_xml(source.clone(), "x.rels", missing_target.as_bytes()),
            Err(OpcError::InvalidRelationship(_))
        ));

        let duplicate = r#"<Relationships>
            <Relationship Id="rId1" Type="t" Target="a.xml"/>
            <Relationship Id="rId1" Type="t" Target="b.xml"/>
        </Relationships>"#;
        assert!(RelationshipCollection::from_xml(source.clone(), "x.rels", duplicate.as_bytes()).is_err());

        let bad_mode = r#"<Relationships><Relationship Id="rId1" Type="t" Target="a.xml" TargetMode="Elsewhere"/></Relationships>"#;
        assert!(RelationshipCollection::from_xml(source, "x.rels", bad_mode.as_bytes()).is_err());
    }

    #[test]
    fn test_to_xml_relativizes_absolute_targets() {
        let mut root = RelationshipCollection::new(PartName::root());
        root.add(target("/word/document.xml"), TargetMode::Internal, rt::OFFICE_DOCUMENT, None)
            .unwrap();
        root.add(target("https://example.com/?a=1&b=2"), TargetMode::External, rt::HYPERLINK, None)
            .unwrap();

        let xml = root.to_xml().unwrap();
        assert!(xml.contains(r#"Target="word/document.xml""#));
        assert!(xml.contains(r#"Target="https://example.com/?a=1&amp;b=2" TargetMode="External""#));

        let reparsed = RelationshipCollection::from_xml(PartName::root(), "/_rels/.rels", xml.as_bytes()).unwrap();
        assert_eq!(reparsed.by_id("rId2").unwrap().target().as_str(), "https://example.com/?a=1&b=2");
        assert_eq!(
            reparsed.by_id("rId1").unwrap().target_part_name().unwrap().as_str(),
            "/word/document.xml"
        );

        let mut nested = RelationshipCollection::new(part("/ppt/slides/slide1.xml"));
        nested
            .add(target("/ppt/media/image1.png"), TargetMode::Internal, rt::IMAGE, None)
            .unwrap();
        assert!(nested.to_xml().unwrap().contains(r#"Target="../media/image1.png""#));
    }
}
