//! Validated part names.
//!
//! A [`PartName`] is the absolute, slash-rooted name of a part inside a
//! package (for example `/word/document.xml`). Construction checks the part
//! name grammar and fails on the first violated rule; there is no way to hold
//! an invalid name.

use crate::opc::error::{OpcError, Result};
use crate::opc::uri;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Name of the package root pseudo-part.
pub const PACKAGE_ROOT: &str = "/";

/// Name of the package-level relationships part.
pub const PACKAGE_RELATIONSHIPS: &str = "/_rels/.rels";

/// Folder segment holding relationship parts.
pub const RELATIONSHIP_SEGMENT: &str = "_rels";

/// Extension of relationship parts.
pub const RELATIONSHIP_EXTENSION: &str = "rels";

/// Archive entry name of the content-types manifest. Never a part name.
pub const CONTENT_TYPES_ENTRY: &str = "[Content_Types].xml";

/// Default location of the core properties part.
pub const CORE_PROPERTIES_PART: &str = "/docProps/core.xml";

/// Immutable, validated part name.
///
/// Equality, hashing and ordering ignore ASCII case, so `/Word/Document.xml`
/// and `/word/document.xml` name the same part. Ordering is "natural": digit
/// runs compare by value, so `/slide2.xml` sorts before `/slide10.xml`.
#[derive(Clone)]
pub struct PartName {
    name: String,
    is_relationship: bool,
}

impl PartName {
    /// Parse and validate a part name.
    ///
    /// # Arguments
    ///
    /// * `candidate` - The part name in URI form, e.g. `/ppt/slides/slide1.xml`
    ///
    /// # Returns
    ///
    /// The part name, or `OpcError::InvalidPartName` naming the violated rule
    pub fn parse(candidate: &str) -> Result<Self> {
        validate(candidate)?;
        Ok(Self::new_validated(candidate.to_string()))
    }

    /// Construct a name without the conformance checks.
    ///
    /// Only the package root `/` may be built this way; anything else is a
    /// contract violation.
    pub fn from_unchecked(uri: &str) -> Result<Self> {
        if uri != PACKAGE_ROOT {
            return Err(OpcError::ContractViolation(format!(
                "only the package root may bypass part name validation, got '{uri}'"
            )));
        }
        Ok(Self::root())
    }

    /// The package root pseudo-part `/`.
    pub fn root() -> Self {
        Self {
            name: PACKAGE_ROOT.to_string(),
            is_relationship: false,
        }
    }

    /// The package relationships part `/_rels/.rels`.
    pub fn package_relationships() -> Self {
        Self {
            name: PACKAGE_RELATIONSHIPS.to_string(),
            is_relationship: true,
        }
    }

    pub(crate) fn new_validated(name: String) -> Self {
        let is_relationship = uri::is_relationship_path(&name);
        Self {
            name,
            is_relationship,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn is_root(&self) -> bool {
        self.name == PACKAGE_ROOT
    }

    /// Whether this names a relationship part (`.../_rels/<name>.rels`).
    pub fn is_relationship_part_name(&self) -> bool {
        self.is_relationship
    }

    /// Extension of the last segment, without the dot; empty if there is none.
    pub fn extension(&self) -> &str {
        let filename = self.filename();
        match memchr::memrchr(b'.', filename.as_bytes()) {
            Some(pos) => &filename[pos + 1..],
            None => "",
        }
    }

    /// Last path segment, e.g. `slide1.xml` for `/ppt/slides/slide1.xml`.
    pub fn filename(&self) -> &str {
        match memchr::memrchr(b'/', self.name.as_bytes()) {
            Some(pos) => &self.name[pos + 1..],
            None => "",
        }
    }

    /// Directory portion, e.g. `/ppt/slides` for `/ppt/slides/slide1.xml`.
    pub fn base_uri(&self) -> &str {
        match memchr::memrchr(b'/', self.name.as_bytes()) {
            Some(0) | None => PACKAGE_ROOT,
            Some(pos) => &self.name[..pos],
        }
    }

    /// Name of the relationship part describing this part.
    pub fn to_rels_part_name(&self) -> Result<PartName> {
        uri::relationship_part_name(self)
    }
}

/// Validate a candidate part name.
fn validate(candidate: &str) -> Result<()> {
    let fail = |rule, reason| {
        Err(OpcError::InvalidPartName {
            name: candidate.to_string(),
            rule,
            reason,
        })
    };

    if candidate.is_empty() || candidate == PACKAGE_ROOT {
        return fail("M1.1", "a part name must not be empty");
    }
    if uri::has_scheme(candidate) {
        return fail("M1.4", "absolute URIs with a scheme are forbidden");
    }
    if !candidate.starts_with('/') {
        return fail("M1.4", "a part name must start with a forward slash");
    }
    if candidate.ends_with('/') {
        return fail("M1.5", "a part name must not end with a forward slash");
    }

    for segment in candidate[1..].split('/') {
        if segment.is_empty() {
            return fail("M1.3", "a part name must not contain empty segments");
        }
        if segment.bytes().all(|b| b == b'.') {
            return fail("M1.10", "a segment must include at least one non-dot character");
        }
        if segment.ends_with('.') {
            return fail("M1.9", "a segment must not end with a dot character");
        }
        validate_segment_chars(segment).or_else(|(rule, reason)| fail(rule, reason))?;
    }
    Ok(())
}

fn validate_segment_chars(segment: &str) -> std::result::Result<(), (&'static str, &'static str)> {
    let bytes = segment.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            let decoded = match (bytes.get(i + 1), bytes.get(i + 2)) {
                (Some(&h), Some(&l)) => uri::decode_hex_pair(h, l),
                _ => None,
            };
            let Some(decoded) = decoded else {
                return Err(("M1.6", "a percent sign must be followed by two hexadecimal digits"));
            };
            if decoded == b'/' || decoded == b'\\' {
                return Err(("M1.7", "a segment must not contain percent-encoded slashes"));
            }
            if uri::is_unreserved(decoded) {
                return Err(("M1.8", "unreserved characters must not be percent-encoded"));
            }
            i += 3;
            continue;
        }
        if !uri::is_pchar_unescaped(b) {
            return Err(("M1.6", "a segment contains a character that is not allowed"));
        }
        i += 1;
    }
    Ok(())
}

/// Compare two names ignoring ASCII case, with digit runs compared by value.
fn compare_natural(a: &[u8], b: &[u8]) -> Ordering {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let (ca, cb) = (a[i].to_ascii_lowercase(), b[j].to_ascii_lowercase());
        if ca.is_ascii_digit() && cb.is_ascii_digit() {
            let (si, sj) = (i, j);
            while i < a.len() && a[i].is_ascii_digit() {
                i += 1;
            }
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            match compare_digit_runs(&a[si..i], &b[sj..j]) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        if ca != cb {
            return ca.cmp(&cb);
        }
        i += 1;
        j += 1;
    }

    (a.len() - i)
        .cmp(&(b.len() - j))
        .then_with(|| a.len().cmp(&b.len()))
        .then_with(|| {
            a.iter()
                .map(u8::to_ascii_lowercase)
                .cmp(b.iter().map(u8::to_ascii_lowercase))
        })
}

fn compare_digit_runs(a: &[u8], b: &[u8]) -> Ordering {
    let trim = |run: &[u8]| -> usize { run.iter().take_while(|&&d| d == b'0').count() };
    let (a, b) = (&a[trim(a)..], &b[trim(b)..]);
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

impl PartialEq for PartName {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for PartName {}

impl Hash for PartName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.name.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

impl Ord for PartName {
    fn cmp(&self, other: &Self) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        compare_natural(self.name.as_bytes(), other.name.as_bytes())
    }
}

impl PartialOrd for PartName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PartName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for PartName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartName({})", self.name)
    }
}

impl AsRef<str> for PartName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl std::str::FromStr for PartName {
    type Err = OpcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
