//! Lenient version parsing and ordering.
//!
//! Versions have up to four numeric parts, an optional `-` release label
//! list and optional `+` metadata. Parsing never fails outright: text that
//! does not fit the grammar produces a version flagged `invalid` whose
//! unparsed remainder is kept as metadata. The original text is preserved
//! and is what [`Version`] displays as.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One dot-separated release label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseLabel {
    Numeric(u32),
    Text(String),
}

/// Returned by [`Version::parse_strict`].
#[derive(Debug, thiserror::Error)]
#[error("invalid version: {0:?}")]
pub struct VersionError(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Version {
    raw: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub revision: u32,
    pub labels: Vec<ReleaseLabel>,
    pub metadata: Option<String>,
    pub invalid: bool,
}

impl Version {
    /// Parse leniently. A leading `v`/`V` is ignored.
    pub fn parse(text: &str) -> Self {
        let raw = text.to_string();
        let trimmed = text.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        let mut version = Self {
            raw,
            major: 0,
            minor: 0,
            patch: 0,
            revision: 0,
            labels: Vec::new(),
            metadata: None,
            invalid: false,
        };

        if body.is_empty() {
            version.invalid = true;
            return version;
        }

        let bytes = body.as_bytes();
        let mut pos = 0;
        let mut part = 0;
        loop {
            let start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            let number = match body[start..pos].parse::<u32>() {
                Ok(n) if pos > start => n,
                _ => return version.into_invalid(&body[start..]),
            };
            match part {
                0 => version.major = number,
                1 => version.minor = number,
                2 => version.patch = number,
                _ => version.revision = number,
            }
            part += 1;

            if pos < bytes.len() && bytes[pos] == b'.' && part < 4 {
                pos += 1;
                continue;
            }
            break;
        }

        if pos < bytes.len() && bytes[pos] == b'-' {
            pos += 1;
            let end = body[pos..].find('+').map_or(body.len(), |i| pos + i);
            for label in body[pos..end].split('.') {
                if label.is_empty()
                    || !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
                {
                    return version.into_invalid(&body[pos..]);
                }
                version.labels.push(match label.parse::<u32>() {
                    Ok(n) => ReleaseLabel::Numeric(n),
                    Err(_) => ReleaseLabel::Text(label.to_string()),
                });
            }
            pos = end;
        }

        if pos < bytes.len() {
            if bytes[pos] == b'+' {
                version.metadata = Some(body[pos + 1..].to_string());
            } else {
                return version.into_invalid(&body[pos..]);
            }
        }

        version
    }

    /// Parse, rejecting anything that would be flagged invalid.
    pub fn parse_strict(text: &str) -> Result<Self, VersionError> {
        let version = Self::parse(text);
        if version.invalid {
            Err(VersionError(text.to_string()))
        } else {
            Ok(version)
        }
    }

    /// Build a version from numeric parts.
    pub fn from_parts(major: u32, minor: u32, patch: u32, revision: u32) -> Self {
        Self::parse(&format!("{major}.{minor}.{patch}.{revision}"))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether every numeric part is zero and there are no labels.
    pub fn is_zero(&self) -> bool {
        self.major == 0
            && self.minor == 0
            && self.patch == 0
            && self.revision == 0
            && self.labels.is_empty()
    }

    fn into_invalid(mut self, remainder: &str) -> Self {
        self.invalid = true;
        self.metadata = Some(remainder.to_string());
        self
    }
}

fn compare_labels(left: &[ReleaseLabel], right: &[ReleaseLabel]) -> Ordering {
    // A version without labels is a release and sorts after any prerelease.
    match (left.is_empty(), right.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    for (l, r) in left.iter().zip(right) {
        let ordering = match (l, r) {
            (ReleaseLabel::Numeric(a), ReleaseLabel::Numeric(b)) => a.cmp(b),
            (ReleaseLabel::Numeric(_), ReleaseLabel::Text(_)) => Ordering::Less,
            (ReleaseLabel::Text(_), ReleaseLabel::Numeric(_)) => Ordering::Greater,
            (ReleaseLabel::Text(a), ReleaseLabel::Text(b)) => a
                .to_ascii_lowercase()
                .cmp(&b.to_ascii_lowercase()),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch, self.revision)
            .cmp(&(other.major, other.minor, other.patch, other.revision))
            .then_with(|| compare_labels(&self.labels, &other.labels))
            .then_with(|| match (self.invalid, other.invalid) {
                (false, false) => Ordering::Equal,
                (false, true) => Ordering::Greater,
                (true, false) => Ordering::Less,
                (true, true) => self.metadata.cmp(&other.metadata),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<String> for Version {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.raw
    }
}

impl std::str::FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_strict(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_four_parts() {
        let v = Version::parse("1.2.3.4");
        assert_eq!((v.major, v.minor, v.patch, v.revision), (1, 2, 3, 4));
        assert!(!v.invalid);
    }

    #[test]
    fn test_parse_prefix_and_short_form() {
        let v = Version::parse("v2.1");
        assert_eq!((v.major, v.minor, v.patch), (2, 1, 0));
        assert_eq!(v.to_string(), "v2.1");
    }

    #[test]
    fn test_parse_labels_and_metadata() {
        let v = Version::parse("1.0.0-beta.2+build.7");
        assert_eq!(
            v.labels,
            vec![
                ReleaseLabel::Text("beta".into()),
                ReleaseLabel::Numeric(2)
            ]
        );
        assert_eq!(v.metadata.as_deref(), Some("build.7"));
        assert!(!v.invalid);
    }

    #[test]
    fn test_parse_invalid_keeps_remainder() {
        let v = Version::parse("1.2.x");
        assert!(v.invalid);
        assert_eq!(v.major, 1);
        assert_eq!(v.minor, 2);
        assert_eq!(v.metadata.as_deref(), Some("x"));
        assert!(Version::parse("").invalid);
        assert!(Version::parse("1.2.3.4.5").invalid);
    }

    #[test]
    fn test_ordering() {
        assert!(Version::parse("1.0.1") > Version::parse("1.0.0.9"));
        assert!(Version::parse("1.0.0") > Version::parse("1.0.0-rc.1"));
        assert!(Version::parse("1.0.0-rc.2") > Version::parse("1.0.0-rc.1"));
        assert!(Version::parse("1.0.0-rc") > Version::parse("1.0.0-1"));
        assert!(Version::parse("1.0.0") > Version::parse("1.0.0.x"));
        assert_eq!(Version::parse("1.0"), Version::parse("1.0.0.0"));
        assert_eq!(Version::parse("1.0+a"), Version::parse("1.0+b"));
    }

    #[test]
    fn test_strict_parse() {
        assert!("1.2.3".parse::<Version>().is_ok());
        assert!("one".parse::<Version>().is_err());
    }

    #[test]
    fn test_serde_uses_original_text() {
        let v = Version::parse("3.1-preview");
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"3.1-preview\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
