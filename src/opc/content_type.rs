//! Media types as used in the content-types manifest.
//!
//! Grammar (RFC 2616 §3.7, without linear whitespace or comments):
//!
//! ```text
//! media-type = type "/" subtype *( ";" parameter )
//! parameter  = attribute "=" ( token | quoted-string )
//! ```

use crate::opc::error::{OpcError, Result};
use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A validated media type with optional parameters.
///
/// Type and subtype compare case-insensitively; parameter names compare
/// case-insensitively and parameter values case-sensitively. Parameter order
/// is kept for output but ignored by equality.
#[derive(Clone)]
pub struct ContentType {
    original: String,
    media_type: String,
    sub_type: String,
    parameters: SmallVec<[(String, String); 2]>,
}

fn is_separator(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':' | b'\\' | b'"' | b'/' | b'[' | b']'
            | b'?' | b'=' | b'{' | b'}' | b' ' | b'\t'
    )
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii() && !b.is_ascii_control() && !is_separator(b)
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_token_char)
}

impl ContentType {
    /// Parse a content type string.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |reason: &str| OpcError::InvalidContentType {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        // Whitespace and comment parentheses are separators, so the token
        // checks below reject them outside quoted strings.
        let (essence, mut rest) = match value.find(';') {
            Some(pos) => (&value[..pos], Some(&value[pos + 1..])),
            None => (value, None),
        };
        let (media_type, sub_type) = essence
            .split_once('/')
            .ok_or_else(|| invalid("missing '/' between type and subtype"))?;
        if !is_token(media_type) || !is_token(sub_type) {
            return Err(invalid("type and subtype must be non-empty tokens"));
        }

        let mut parameters: SmallVec<[(String, String); 2]> = SmallVec::new();
        while let Some(params) = rest {
            let (name, after_name) = params
                .split_once('=')
                .ok_or_else(|| invalid("parameter without '='"))?;
            if !is_token(name) {
                return Err(invalid("parameter name must be a token"));
            }

            let (param_value, remainder) = if let Some(quoted) = after_name.strip_prefix('"') {
                let (unquoted, consumed) =
                    read_quoted(quoted).ok_or_else(|| invalid("unterminated quoted string"))?;
                let remainder = &quoted[consumed..];
                match remainder.strip_prefix(';') {
                    Some(next) => (unquoted, Some(next)),
                    None if remainder.is_empty() => (unquoted, None),
                    None => return Err(invalid("unexpected characters after quoted string")),
                }
            } else {
                let (token, remainder) = match after_name.find(';') {
                    Some(pos) => (&after_name[..pos], Some(&after_name[pos + 1..])),
                    None => (after_name, None),
                };
                if !is_token(token) {
                    return Err(invalid("parameter value must be a token or quoted string"));
                }
                (token.to_string(), remainder)
            };

            if parameters.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)) {
                return Err(invalid("duplicate parameter"));
            }
            parameters.push((name.to_string(), param_value));
            rest = remainder;
        }

        Ok(Self {
            original: value.to_string(),
            media_type: media_type.to_string(),
            sub_type: sub_type.to_string(),
            parameters,
        })
    }

    /// Primary type, e.g. `application`.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Subtype, e.g. `vnd.openxmlformats-package.relationships+xml`.
    pub fn sub_type(&self) -> &str {
        &self.sub_type
    }

    pub fn has_parameters(&self) -> bool {
        !self.parameters.is_empty()
    }

    /// Value of a parameter, looked up case-insensitively by name.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parameters in declaration order.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// The content type as originally written.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Whether this equals `other` when parsed; unparseable strings never match.
    pub fn matches(&self, other: &str) -> bool {
        ContentType::parse(other).is_ok_and(|ct| ct == *self)
    }
}

/// Read a quoted-string body (after the opening quote).
///
/// Returns the unescaped value and the number of bytes consumed, including
/// the closing quote.
fn read_quoted(input: &str) -> Option<(String, usize)> {
    let mut value = String::new();
    let mut chars = input.char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '"' => return Some((value, i + 1)),
            '\\' => {
                let (_, escaped) = chars.next()?;
                value.push(escaped);
            },
            c if c.is_ascii_control() => return None,
            c => value.push(c),
        }
    }
    None
}

impl PartialEq for ContentType {
    fn eq(&self, other: &Self) -> bool {
        self.media_type.eq_ignore_ascii_case(&other.media_type)
            && self.sub_type.eq_ignore_ascii_case(&other.sub_type)
            && self.parameters.len() == other.parameters.len()
            && self
                .parameters
                .iter()
                .all(|(name, value)| other.parameter(name) == Some(value.as_str()))
    }
}

impl Eq for ContentType {}

impl Hash for ContentType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.media_type.to_ascii_lowercase().hash(state);
        self.sub_type.to_ascii_lowercase().hash(state);
        self.parameters.len().hash(state);
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl fmt::Debug for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentType({})", self.original)
    }
}

impl std::str::FromStr for ContentType {
    type Err = OpcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opc::constants::content_type as ct;

    #[test]
    fn test_parse_simple() {
        let content_type = ContentType::parse(ct::OPC_RELATIONSHIPS).unwrap();
        assert_eq!(content_type.media_type(), "application");
        assert_eq!(content_type.sub_type(), "vnd.openxmlformats-package.relationships+xml");
        assert!(!content_type.has_parameters());
        assert_eq!(content_type.to_string(), ct::OPC_RELATIONSHIPS);
    }

    #[test]
    fn test_parse_parameters() {
        let content_type =
            ContentType::parse("application/xml;charset=utf-8;name=\"a \\\"b\\\"\"").unwrap();
        assert_eq!(content_type.parameter("CHARSET"), Some("utf-8"));
        assert_eq!(content_type.parameter("name"), Some("a \"b\""));
        let names: Vec<&str> = content_type.parameters().map(|(n, _)| n).collect();
        assert_eq!(names, ["charset", "name"]);
    }

    #[test]
    fn test_equality_rules() {
        let a = ContentType::parse("Application/XML;a=1;b=2").unwrap();
        let b = ContentType::parse("application/xml;b=2;A=1").unwrap();
        assert_eq!(a, b);

        let c = ContentType::parse("application/xml;a=X").unwrap();
        let d = ContentType::parse("application/xml;a=x").unwrap();
        assert_ne!(c, d);
        assert_ne!(a, ContentType::parse("application/xml").unwrap());
        assert!(a.matches("application/xml;b=2;a=1"));
        assert!(!a.matches("not a type"));
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "application",
            "application/",
            "/xml",
            "application/xml; charset=utf-8",
            "application/xml (comment)",
            "application/xml;charset",
            "application/xml;charset=",
            "application/xml;a=1;a=2",
            "application/x@ml",
            "application/xml;name=\"open",
            "application/xml;name=\"a\"b",
        ] {
            assert!(
                matches!(ContentType::parse(bad), Err(OpcError::InvalidContentType { .. })),
                "{bad:?} should be rejected"
            );
        }
    }
}
