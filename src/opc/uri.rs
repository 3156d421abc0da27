//! URI utilities for part names and relationship targets.
//!
//! Everything here is a pure function over strings. [`Uri`] is a checked
//! URI reference (RFC 3986 syntax, ASCII only); relationship targets and
//! resolved part names pass through it.

use crate::opc::error::{OpcError, Result};
use crate::opc::partname::{PACKAGE_ROOT, PartName};
use std::fmt;

const RELS_SEGMENT_PATTERN: &str = "/_rels/";
const RELS_SUFFIX: &str = ".rels";
const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// `ALPHA / DIGIT / "-" / "." / "_" / "~"`
pub fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

/// `"!" / "$" / "&" / "'" / "(" / ")" / "*" / "+" / "," / ";" / "="`
pub fn is_sub_delim(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'='
    )
}

/// Characters allowed unescaped in a path segment.
pub fn is_pchar_unescaped(b: u8) -> bool {
    is_unreserved(b) || is_sub_delim(b) || b == b':' || b == b'@'
}

fn is_uri_char(b: u8) -> bool {
    is_pchar_unescaped(b) || matches!(b, b'/' | b'?' | b'#' | b'[' | b']')
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode the two hex digits following a `%`.
pub fn decode_hex_pair(high: u8, low: u8) -> Option<u8> {
    Some(hex_value(high)? << 4 | hex_value(low)?)
}

fn push_encoded(out: &mut String, b: u8) {
    out.push('%');
    out.push(HEX_UPPER[(b >> 4) as usize] as char);
    out.push(HEX_UPPER[(b & 0x0f) as usize] as char);
}

fn is_valid_escape(bytes: &[u8], i: usize) -> bool {
    match (bytes.get(i + 1), bytes.get(i + 2)) {
        (Some(&h), Some(&l)) => decode_hex_pair(h, l).is_some(),
        _ => false,
    }
}

/// Decode every `%HH` escape. Invalid escapes are kept literally.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    if memchr::memchr(b'%', bytes).is_none() {
        return input.to_string();
    }
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && is_valid_escape(bytes, i) {
            if let Some(decoded) = decode_hex_pair(bytes[i + 1], bytes[i + 2]) {
                out.push(decoded);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    match String::from_utf8(out) {
        Ok(decoded) => decoded,
        Err(_) => input.to_string(),
    }
}

/// Whether the string starts with an RFC 3986 scheme (`alpha *( alpha / digit / + / - / . ) ":"`).
pub fn has_scheme(s: &str) -> bool {
    scheme_end(s).is_some()
}

fn scheme_end(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    if !bytes.first()?.is_ascii_alphabetic() {
        return None;
    }
    let colon = bytes.iter().position(|&b| matches!(b, b':' | b'/' | b'?' | b'#'))?;
    if bytes[colon] != b':' {
        return None;
    }
    bytes[..colon]
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
        .then_some(colon)
}

/// Whether a path follows the relationship part convention `.../_rels/<name>.rels`.
pub fn is_relationship_path(path: &str) -> bool {
    match memchr::memmem::find(path.as_bytes(), RELS_SEGMENT_PATTERN.as_bytes()) {
        Some(pos) => path[pos + RELS_SEGMENT_PATTERN.len()..].ends_with(RELS_SUFFIX),
        None => false,
    }
}

/// A syntactically checked URI reference.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    value: String,
}

impl Uri {
    /// Parse a URI reference.
    ///
    /// Only ASCII is accepted: non-ASCII characters, whitespace and stray `%`
    /// signs must already be percent-encoded (see [`normalize_to_uri`]).
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            Err(OpcError::InvalidUri {
                value: value.to_string(),
                reason: reason.to_string(),
            })
        };

        let bytes = value.as_bytes();
        let mut fragments = 0;
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if b == b'%' {
                if !is_valid_escape(bytes, i) {
                    return invalid("malformed percent escape");
                }
                i += 3;
                continue;
            }
            if !is_uri_char(b) {
                return invalid("illegal character");
            }
            if b == b'#' {
                fragments += 1;
                if fragments > 1 {
                    return invalid("more than one fragment delimiter");
                }
            }
            i += 1;
        }

        if let Some(end) = scheme_end(value) {
            let rest = &value[end + 1..];
            if rest.is_empty() {
                return invalid("expected scheme-specific part");
            }
            if let Some(after) = rest.strip_prefix("//") {
                let authority_end = after
                    .find(['/', '?', '#'])
                    .unwrap_or(after.len());
                if authority_end == 0 && after.is_empty() {
                    return invalid("expected authority");
                }
            }
        }

        Ok(Self {
            value: value.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn scheme(&self) -> Option<&str> {
        scheme_end(&self.value).map(|end| &self.value[..end])
    }

    /// Whether the reference carries a scheme.
    pub fn is_absolute(&self) -> bool {
        self.scheme().is_some()
    }

    fn without_fragment(&self) -> &str {
        match self.value.find('#') {
            Some(pos) => &self.value[..pos],
            None => &self.value,
        }
    }

    fn hier_part(&self) -> &str {
        let s = self.without_fragment();
        let s = match s.find('?') {
            Some(pos) => &s[..pos],
            None => s,
        };
        match scheme_end(s) {
            Some(end) => &s[end + 1..],
            None => s,
        }
    }

    fn authority(&self) -> Option<&str> {
        let hier = self.hier_part().strip_prefix("//")?;
        let end = hier.find('/').unwrap_or(hier.len());
        Some(&hier[..end])
    }

    /// Path component, without scheme, authority, query or fragment.
    pub fn path(&self) -> &str {
        let hier = self.hier_part();
        match hier.strip_prefix("//") {
            Some(after) => match after.find('/') {
                Some(pos) => &after[pos..],
                None => "",
            },
            None => hier,
        }
    }

    pub fn query(&self) -> Option<&str> {
        let s = self.without_fragment();
        s.find('?').map(|pos| &s[pos + 1..])
    }

    pub fn fragment(&self) -> Option<&str> {
        self.value.find('#').map(|pos| &self.value[pos + 1..])
    }
}

impl From<&PartName> for Uri {
    fn from(name: &PartName) -> Self {
        Self {
            value: name.as_str().to_string(),
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uri({})", self.value)
    }
}

/// Shortest relative reference from `source` to `target`.
///
/// # Arguments
///
/// * `source` - URI of the part the reference is written in
/// * `target` - URI of the part (or resource) being referenced
/// * `ms_compatible` - When `source` is the package root, drop the leading
///   slash of the result the way Office writes package-level targets
pub fn relativize(source: &Uri, target: &Uri, ms_compatible: bool) -> Result<Uri> {
    let source_path = source.path();
    let target_path = target.path();

    if source_path == PACKAGE_ROOT {
        let mut path = target.without_fragment();
        if ms_compatible {
            path = path.strip_prefix('/').unwrap_or(path);
        }
        return Uri::parse(&with_fragment(path.to_string(), target.fragment()));
    }

    let src: Vec<&str> = source_path.split('/').collect();
    let tgt: Vec<&str> = target_path.split('/').collect();
    let common = src
        .iter()
        .zip(tgt.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = String::new();
    if common == src.len() && common == tgt.len() {
        out.push_str(src.last().copied().unwrap_or_default());
    } else {
        // Climb from the source's directory; always keep the target's last segment.
        let shared = common
            .min(src.len().saturating_sub(1))
            .min(tgt.len().saturating_sub(1));
        for _ in shared..src.len().saturating_sub(1) {
            out.push_str("../");
        }
        out.push_str(&tgt[shared..].join("/"));
    }

    Uri::parse(&with_fragment(out, target.fragment()))
}

fn with_fragment(mut path: String, fragment: Option<&str>) -> String {
    if let Some(fragment) = fragment {
        path.push('#');
        path.push_str(fragment);
    }
    path
}

/// Resolve `target` against the URI of the part it was written in (RFC 3986 §5.2).
///
/// Both sides must be scheme-less: this is for internal targets only.
pub fn resolve(source: &Uri, target: &Uri) -> Result<Uri> {
    for side in [source, target] {
        if side.is_absolute() {
            return Err(OpcError::InvalidUri {
                value: side.to_string(),
                reason: "an internal reference must not carry a scheme".to_string(),
            });
        }
    }
    if target.authority().is_some() {
        return Err(OpcError::InvalidUri {
            value: target.to_string(),
            reason: "an internal reference must not carry an authority".to_string(),
        });
    }

    let target_path = target.path();
    let (path, query) = if target_path.is_empty() {
        (source.path().to_string(), target.query().or(source.query()))
    } else if target_path.starts_with('/') {
        (remove_dot_segments(target_path), target.query())
    } else {
        (remove_dot_segments(&merge(source.path(), target_path)), target.query())
    };

    let mut out = path;
    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }
    Uri::parse(&with_fragment(out, target.fragment()))
}

fn merge(base: &str, reference: &str) -> String {
    match base.rfind('/') {
        Some(pos) => format!("{}{}", &base[..=pos], reference),
        None => reference.to_string(),
    }
}

fn remove_dot_segments(path: &str) -> String {
    let absolute = path.starts_with('/');
    let segments: Vec<&str> = path.split('/').collect();
    let skip = usize::from(absolute);
    let last = segments.len() - 1;
    let mut out: Vec<&str> = Vec::with_capacity(segments.len());

    for (idx, segment) in segments.iter().enumerate().skip(skip) {
        match *segment {
            "." => {
                if idx == last {
                    out.push("");
                }
            },
            ".." => {
                out.pop();
                if idx == last {
                    out.push("");
                }
            },
            s => out.push(s),
        }
    }

    let joined = out.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

/// Resolve an internal target to the part name it designates.
///
/// Query and fragment are not part of a part name and are dropped.
pub fn resolve_part_name(source: &PartName, target: &Uri) -> Result<PartName> {
    let resolved = resolve(&Uri::from(source), target)?;
    PartName::parse(resolved.path())
}

/// Name of the relationship part for `part`.
///
/// `/a/b/c.xml` maps to `/a/b/_rels/c.xml.rels`; the package root maps to
/// `/_rels/.rels`.
pub fn relationship_part_name(part: &PartName) -> Result<PartName> {
    if part.is_root() {
        return Ok(PartName::package_relationships());
    }
    if part.is_relationship_part_name() {
        return Err(OpcError::conformance(
            "M1.25",
            part.as_str(),
            "a relationship part cannot have relationships of its own",
        ));
    }
    let base = part.base_uri().trim_end_matches('/');
    PartName::parse(&format!("{base}/_rels/{}{RELS_SUFFIX}", part.filename()))
}

/// Inverse of [`relationship_part_name`].
pub fn source_part_name_from_rels(rels: &PartName) -> Result<PartName> {
    if !rels.is_relationship_part_name() {
        return Err(OpcError::ContractViolation(format!(
            "{rels} is not a relationship part name"
        )));
    }
    let path = rels.as_str();
    let Some(pos) = memchr::memmem::rfind(path.as_bytes(), RELS_SEGMENT_PATTERN.as_bytes()) else {
        return Err(OpcError::ContractViolation(format!(
            "{rels} is not a relationship part name"
        )));
    };
    let dir = &path[..pos];
    let file = path[pos + RELS_SEGMENT_PATTERN.len()..]
        .strip_suffix(RELS_SUFFIX)
        .unwrap_or_default();
    if dir.is_empty() && file.is_empty() {
        return Ok(PartName::root());
    }
    PartName::parse(&format!("{dir}/{file}"))
}

/// Turn a raw target string into a [`Uri`], repairing what producers commonly get wrong.
///
/// The repairs are exactly these:
///
/// - backslashes become forward slashes
/// - non-ASCII characters and whitespace are percent-encoded (UTF-8, upper-case hex)
/// - `%` not starting a valid escape is encoded; valid escapes are kept
/// - in the fragment, `|` is encoded as well
/// - a bare `scheme://` with nothing after it gets a trailing `/`
pub fn normalize_to_uri(raw: &str) -> Result<Uri> {
    let value = raw.replace('\\', "/");
    let (head, fragment) = match value.find('#') {
        Some(pos) => (&value[..pos], Some(&value[pos + 1..])),
        None => (value.as_str(), None),
    };

    let mut out = encode_unsafe(head, false);
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(&encode_unsafe(fragment, true));
    } else if is_bare_scheme_prefix(&out) {
        out.push('/');
    }
    Uri::parse(&out)
}

fn encode_unsafe(input: &str, in_fragment: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    for (i, ch) in input.char_indices() {
        let unsafe_char = !ch.is_ascii()
            || ch.is_whitespace()
            || (ch == '%' && !is_valid_escape(bytes, i))
            || (in_fragment && ch == '|');
        if unsafe_char {
            let mut buf = [0u8; 4];
            for &b in ch.encode_utf8(&mut buf).as_bytes() {
                push_encoded(&mut out, b);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// `^\w+://$`
fn is_bare_scheme_prefix(s: &str) -> bool {
    match s.strip_suffix("://") {
        Some(prefix) => {
            !prefix.is_empty()
                && prefix
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        },
        None => false,
    }
}

/// Part name for a ZIP entry name.
///
/// Entry names are stored decoded; every byte that may not appear literally
/// in a part name is percent-encoded here.
pub fn part_name_from_zip_item(entry_name: &str) -> Result<PartName> {
    let mut name = String::with_capacity(entry_name.len() + 1);
    name.push('/');
    for &b in entry_name.as_bytes() {
        if is_pchar_unescaped(b) || b == b'/' {
            name.push(b as char);
        } else {
            push_encoded(&mut name, b);
        }
    }
    PartName::parse(&name)
}

/// ZIP entry name for a part name.
pub fn zip_item_name(part: &PartName) -> String {
    percent_decode(part.as_str().trim_start_matches('/'))
}
