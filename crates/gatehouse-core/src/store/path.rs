//! Document paths
//!
//! A [`Path`] addresses a location in the JSON document tree held by the
//! store. Paths are parsed from URL-style strings (`/a/b/3/c`) with
//! per-segment percent-decoding, and compared segment-wise for prefix
//! containment when checking bundle roots and plugin mounts.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::StoreError;

/// One step into the document tree: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    /// Object key
    Key(String),
    /// Array index
    Index(usize),
}

impl Segment {
    /// The segment as an object key, regardless of how it parsed.
    ///
    /// Array indices render as their decimal form so that a path can be
    /// matched against object keys like `"0"` in raw bundle data.
    #[must_use]
    pub fn as_key(&self) -> String {
        match self {
            Self::Key(k) => k.clone(),
            Self::Index(i) => i.to_string(),
        }
    }
}

/// An ordered sequence of segments rooted at the document root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Path(pub Vec<Segment>);

impl Path {
    /// The document root.
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a path from its URL form, e.g. `/a/b/3/c`.
    ///
    /// Each segment is percent-decoded individually. A digits-only segment
    /// parses as an array index. The empty string and `/` both denote the
    /// root.
    ///
    /// # Errors
    /// Returns `StoreError::InvalidPath` when a segment fails to decode as
    /// UTF-8.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let trimmed = raw.strip_prefix('/').unwrap_or(raw);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for part in trimmed.split('/') {
            let decoded = percent_decode_str(part)
                .decode_utf8()
                .map_err(|_| StoreError::InvalidPath {
                    path: raw.to_string(),
                })?
                .into_owned();
            if !decoded.is_empty() && decoded.bytes().all(|b| b.is_ascii_digit()) {
                // Leading zeros stay keys so "007" round-trips.
                if decoded == "0" || !decoded.starts_with('0') {
                    if let Ok(index) = decoded.parse::<usize>() {
                        segments.push(Segment::Index(index));
                        continue;
                    }
                }
            }
            segments.push(Segment::Key(decoded));
        }
        Ok(Self(segments))
    }

    /// Build a path from plain string keys.
    #[must_use]
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(|k| Segment::Key(k.into())).collect())
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the root path.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` is a prefix of `other` (including equality).
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.0.len() <= other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.as_key() == b.as_key())
    }

    /// Whether two paths overlap: one contains the other.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// A new path with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: Segment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    /// A new path with a key segment appended.
    #[must_use]
    pub fn child_key(&self, key: &str) -> Self {
        self.child(Segment::Key(key.to_string()))
    }

    /// The segments as plain keys (dot-free), for package-path comparison.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.0.iter().map(Segment::as_key).collect()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.0 {
            write!(f, "/{}", segment.as_key())?;
        }
        Ok(())
    }
}

impl From<Vec<&str>> for Path {
    fn from(keys: Vec<&str>) -> Self {
        Self::from_keys(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_path() {
        let path = Path::parse("/a/b/c").unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path.to_string(), "/a/b/c");
    }

    #[test]
    fn test_parse_root() {
        assert!(Path::parse("/").unwrap().is_empty());
        assert!(Path::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_index_segment() {
        let path = Path::parse("/a/3/c").unwrap();
        assert_eq!(path.0[1], Segment::Index(3));
    }

    #[test]
    fn test_parse_percent_encoded_segment() {
        let path = Path::parse("/a%2Fb/c").unwrap();
        assert_eq!(path.0[0], Segment::Key("a/b".to_string()));
        assert_eq!(path.0[1], Segment::Key("c".to_string()));
    }

    #[test]
    fn test_prefix_containment() {
        let a = Path::parse("/plugins/ldap").unwrap();
        let b = Path::parse("/plugins/ldap/users").unwrap();
        let c = Path::parse("/plugins/http").unwrap();

        assert!(a.is_prefix_of(&b));
        assert!(!b.is_prefix_of(&a));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(Path::root().is_prefix_of(&c));
    }

    #[test]
    fn test_leading_zero_stays_key() {
        let path = Path::parse("/a/007").unwrap();
        assert_eq!(path.0[1], Segment::Key("007".to_string()));
    }
}
