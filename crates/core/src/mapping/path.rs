//! Source-path expressions over an [`AttributeValue`] tree.
//!
//! A path is a dot-separated list of accessors. Any accessor may carry an
//! integer index, written either as its own segment (`emails.0.value`) or in
//! brackets (`emails[0].value`).

use std::fmt;

use crate::errors::ConfigError;
use crate::models::AttributeValue;

/// One accessor in a [`SourcePath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed source-path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePath {
    raw: String,
    segments: Vec<Segment>,
}

impl SourcePath {
    /// Parse an expression such as `name.givenName` or `emails[0].value`.
    pub fn parse(expr: &str) -> Result<Self, ConfigError> {
        let invalid = |detail: &str| ConfigError::InvalidMapping {
            expr: expr.to_string(),
            detail: detail.to_string(),
        };

        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(invalid("path is empty"));
        }

        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            if part.is_empty() {
                return Err(invalid("empty path segment"));
            }

            let (head, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };

            if !head.is_empty() {
                match head.parse::<usize>() {
                    Ok(idx) => segments.push(Segment::Index(idx)),
                    Err(_) => segments.push(Segment::Key(head.to_string())),
                }
            } else if rest.is_empty() {
                return Err(invalid("empty path segment"));
            }

            while !rest.is_empty() {
                if !rest.starts_with('[') {
                    return Err(invalid("unexpected text after ']'"));
                }
                let close = rest
                    .find(']')
                    .ok_or_else(|| invalid("unterminated '['"))?;
                let idx = rest[1..close]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid("index must be a non-negative integer"))?;
                segments.push(Segment::Index(idx));
                rest = &rest[close + 1..];
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Walk the tree. Returns `None` as soon as a key is missing, an index is
    /// out of bounds, or a segment is applied to the wrong kind of node.
    pub fn resolve<'a>(&self, root: &'a AttributeValue) -> Option<&'a AttributeValue> {
        walk(root, &self.segments)
    }
}

fn walk<'a>(node: &'a AttributeValue, segments: &[Segment]) -> Option<&'a AttributeValue> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(node);
    };
    let next = match (first, node) {
        (Segment::Key(key), AttributeValue::Map(_)) => node.get(key)?,
        (Segment::Index(idx), AttributeValue::List(_)) => node.index(*idx)?,
        // Numeric segments may also name a map key.
        (Segment::Index(idx), AttributeValue::Map(map)) => map.get(&idx.to_string())?,
        _ => return None,
    };
    walk(next, rest)
}

impl fmt::Display for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for SourcePath {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scim_user() -> AttributeValue {
        AttributeValue::from(serde_json::json!({
            "userName": "alice",
            "name": {"givenName": "Alice", "familyName": "Liddell"},
            "emails": [
                {"value": "alice@example.com", "primary": true},
                {"value": "al@example.org"}
            ],
            "meta": {"0": "zero-key"}
        }))
    }

    #[test]
    fn test_parse_dot_and_bracket_forms_agree() {
        let dotted = SourcePath::parse("emails.0.value").unwrap();
        let bracketed = SourcePath::parse("emails[0].value").unwrap();
        assert_eq!(dotted.segments(), bracketed.segments());
        assert_eq!(
            dotted.segments(),
            &[
                Segment::Key("emails".into()),
                Segment::Index(0),
                Segment::Key("value".into())
            ]
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "a..b", "emails[x]", "emails[0", "a[0]b", "."] {
            assert!(
                matches!(SourcePath::parse(bad), Err(ConfigError::InvalidMapping { .. })),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_resolve_nested_and_indexed() {
        let root = scim_user();
        let path = SourcePath::parse("name.givenName").unwrap();
        assert_eq!(path.resolve(&root).and_then(|v| v.as_str()), Some("Alice"));

        let path = SourcePath::parse("emails[1].value").unwrap();
        assert_eq!(
            path.resolve(&root).and_then(|v| v.as_str()),
            Some("al@example.org")
        );
    }

    #[test]
    fn test_resolve_misses_yield_none() {
        let root = scim_user();
        for expr in [
            "emails[5].value",
            "name.middleName",
            "userName.first",
            "phoneNumbers.0",
            "name[0]",
        ] {
            let path = SourcePath::parse(expr).unwrap();
            assert!(path.resolve(&root).is_none(), "{expr} should be absent");
        }
    }

    #[test]
    fn test_numeric_segment_on_map_uses_key() {
        let root = scim_user();
        let path = SourcePath::parse("meta.0").unwrap();
        assert_eq!(path.resolve(&root).and_then(|v| v.as_str()), Some("zero-key"));
    }

    #[test]
    fn test_multiple_bracket_indices() {
        let root = AttributeValue::from(serde_json::json!({"m": [[1, 2], [3]]}));
        let path = SourcePath::parse("m[0][1]").unwrap();
        assert_eq!(path.resolve(&root).and_then(|v| v.scalar_string()), Some("2".into()));
    }
}
