use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

/// Characters that may never appear anywhere in a path.
const FORBIDDEN_CHARS: &[char] = &['#', '?', '\\', '"', '<', '>', '|', '*', ':'];

/// A validated, normalized hierarchical key.
///
/// Paths are slash-separated sequences of non-empty segments. Leading and
/// trailing separators are stripped during parsing; consecutive separators,
/// surrounding whitespace, and the characters `# ? \ " < > | * :` are
/// rejected outright.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path(String);

impl Path {
    pub fn parse(raw: &str) -> MeshResult<Self> {
        if raw.is_empty() {
            return Err(MeshError::InvalidPath("path is empty".to_string()));
        }
        if raw.trim() != raw {
            return Err(MeshError::InvalidPath(format!(
                "path '{}' has leading or trailing whitespace",
                raw
            )));
        }
        if let Some(ch) = raw.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
            return Err(MeshError::InvalidPath(format!(
                "path '{}' contains forbidden character '{}'",
                raw, ch
            )));
        }

        // Normalization strips leading/trailing separators only.
        let normalized = raw.trim_matches('/');
        if normalized.is_empty() {
            return Err(MeshError::InvalidPath(format!(
                "path '{}' has no segments",
                raw
            )));
        }
        if normalized.split('/').any(|segment| segment.is_empty()) {
            return Err(MeshError::InvalidPath(format!(
                "path '{}' contains consecutive separators",
                raw
            )));
        }

        Ok(Path(normalized.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Prefix match used by scans and subscriptions: `prefix` matches itself
    /// and anything under `prefix + "/"`.
    pub fn is_under(&self, prefix: &str) -> bool {
        path_is_under(&self.0, prefix)
    }
}

/// Prefix predicate shared by components that deal with raw path strings.
pub fn path_is_under(path: &str, prefix: &str) -> bool {
    path == prefix || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Path {
    type Error = MeshError;

    fn try_from(raw: String) -> MeshResult<Self> {
        Path::parse(&raw)
    }
}

impl From<Path> for String {
    fn from(path: Path) -> String {
        path.0
    }
}

impl AsRef<str> for Path {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_separators() {
        assert_eq!(Path::parse("/users/bob/").unwrap().as_str(), "users/bob");
        assert_eq!(Path::parse("users/bob").unwrap().as_str(), "users/bob");
        assert_eq!(Path::parse("a").unwrap().as_str(), "a");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(Path::parse("").is_err());
        assert!(Path::parse("   ").is_err());
        assert!(Path::parse(" users/bob").is_err());
        assert!(Path::parse("users/bob ").is_err());
        assert!(Path::parse("users//bob").is_err());
        assert!(Path::parse("/").is_err());
        for ch in ['#', '?', '\\', '"', '<', '>', '|', '*', ':'] {
            assert!(Path::parse(&format!("users/b{}b", ch)).is_err(), "{}", ch);
        }
    }

    #[test]
    fn test_prefix_matching() {
        let path = Path::parse("users/bob/email").unwrap();
        assert!(path.is_under("users"));
        assert!(path.is_under("users/bob"));
        assert!(path.is_under("users/bob/email"));
        assert!(!path.is_under("users/bo"));
        assert!(!path.is_under("products"));
    }

    #[test]
    fn test_serde_round_trip() {
        let path = Path::parse("users/bob").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"users/bob\"");
        let back: Path = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
        assert!(serde_json::from_str::<Path>("\"bad:path\"").is_err());
    }
}
