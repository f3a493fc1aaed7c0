//! Tolerant database version parsing
//!
//! Cassandra reports versions like "3.9" that are not valid semantic
//! versions. [`Version`] parses such strings by inserting missing `.0`
//! components before retrying a strict semver parse, while preserving the
//! original string byte-for-byte for serialization.
//!
//! Equality, ordering and hashing are defined only on the canonical parsed
//! form: `Version::parse("3.9")` equals `Version::parse("3.9.0")` even
//! though they serialize differently.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// A database version parsed from a loosely-formatted string.
///
/// Immutable once constructed. Round-trips exactly: serializing a parsed
/// version reproduces the original input string.
#[derive(Clone, Debug)]
pub struct Version {
    original: String,
    parsed: semver::Version,
}

impl Version {
    /// Parse a version string, tolerating missing components.
    ///
    /// Tries a strict semver parse first. On failure, `.0` components are
    /// inserted immediately before any `-` or `+` label segment (or
    /// appended) until the numeric core has three components, retrying
    /// after each insertion. If every variant fails, the error lists each
    /// attempted string together with its underlying parse error.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let mut attempts: Vec<(String, semver::Error)> = Vec::new();
        let mut candidate = s.to_string();

        loop {
            match semver::Version::parse(&candidate) {
                Ok(parsed) => {
                    return Ok(Self {
                        original: s.to_string(),
                        parsed,
                    });
                }
                Err(err) => attempts.push((candidate.clone(), err)),
            }

            match insert_zero_component(&candidate) {
                Some(next) => candidate = next,
                None => break,
            }
        }

        let detail = attempts
            .iter()
            .map(|(variant, err)| format!("{variant:?}: {err}"))
            .collect::<Vec<_>>()
            .join(", ");
        Err(Error::version_parse(format!(
            "unable to parse version {s:?}, attempted: {detail}"
        )))
    }

    /// The original input string, reproduced verbatim
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Major component of the canonical form
    pub fn major(&self) -> u64 {
        self.parsed.major
    }

    /// Minor component of the canonical form
    pub fn minor(&self) -> u64 {
        self.parsed.minor
    }

    /// Patch component of the canonical form (0 when absent from the input)
    pub fn patch(&self) -> u64 {
        self.parsed.patch
    }

    /// New version with the patch component incremented.
    ///
    /// The string form is regenerated from the canonical components; the
    /// original input string and any labels are not preserved.
    pub fn bump_patch(&self) -> Self {
        Self::from_components(self.parsed.major, self.parsed.minor, self.parsed.patch + 1)
    }

    /// New version with the minor component incremented and patch reset
    pub fn bump_minor(&self) -> Self {
        Self::from_components(self.parsed.major, self.parsed.minor + 1, 0)
    }

    /// New version with the major component incremented and minor/patch reset
    pub fn bump_major(&self) -> Self {
        Self::from_components(self.parsed.major + 1, 0, 0)
    }

    fn from_components(major: u64, minor: u64, patch: u64) -> Self {
        let parsed = semver::Version::new(major, minor, patch);
        Self {
            original: parsed.to_string(),
            parsed,
        }
    }
}

/// Insert a `.0` component into the numeric core of a version string.
///
/// The core ends at the first `-` (pre-release) or `+` (build metadata)
/// marker. Returns None once the core already has three dotted components.
fn insert_zero_component(s: &str) -> Option<String> {
    let core_end = s.find(['-', '+']).unwrap_or(s.len());
    let (core, rest) = s.split_at(core_end);
    if core.is_empty() || core.split('.').count() >= 3 {
        return None;
    }
    Some(format!("{core}.0{rest}"))
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.parsed == other.parsed
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parsed.cmp(&other.parsed)
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parsed.hash(state);
    }
}

impl fmt::Display for Version {
    /// Shows the original string so logs match what the database reported
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.original)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct VersionVisitor;

        impl Visitor<'_> for VersionVisitor {
            type Value = Version;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a quoted version string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Version, E> {
                Version::parse(value).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(VersionVisitor)
    }
}

impl schemars::JsonSchema for Version {
    fn schema_name() -> String {
        "Version".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_semver() {
        let v = Version::parse("3.11.1").unwrap();
        assert_eq!(v.major(), 3);
        assert_eq!(v.minor(), 11);
        assert_eq!(v.patch(), 1);
        assert_eq!(v.as_str(), "3.11.1");
    }

    #[test]
    fn parses_missing_patch() {
        let v = Version::parse("3.9").unwrap();
        assert_eq!((v.major(), v.minor(), v.patch()), (3, 9, 0));
        assert_eq!(v.as_str(), "3.9");
    }

    #[test]
    fn parses_single_component() {
        let v = Version::parse("3").unwrap();
        assert_eq!((v.major(), v.minor(), v.patch()), (3, 0, 0));
        assert_eq!(v.as_str(), "3");
    }

    #[test]
    fn parses_missing_patch_with_labels() {
        let v = Version::parse("3.9-alpha1+dev2").unwrap();
        assert_eq!((v.major(), v.minor(), v.patch()), (3, 9, 0));
        assert_eq!(v.as_str(), "3.9-alpha1+dev2");
    }

    #[test]
    fn parses_missing_patch_with_build_metadata_only() {
        let v = Version::parse("3.9+dev2").unwrap();
        assert_eq!((v.major(), v.minor(), v.patch()), (3, 9, 0));
        assert_eq!(v.as_str(), "3.9+dev2");
    }

    #[test]
    fn error_lists_all_attempted_variants() {
        let err = Version::parse("not-a-version").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("\"not-a-version\""), "got: {text}");
        assert!(text.contains("\"not.0-a-version\""), "got: {text}");
        assert!(text.contains("\"not.0.0-a-version\""), "got: {text}");
    }

    #[test]
    fn error_for_empty_string() {
        assert!(Version::parse("").is_err());
    }

    #[test]
    fn equality_uses_canonical_form() {
        let short = Version::parse("3.9").unwrap();
        let long = Version::parse("3.9.0").unwrap();
        assert_eq!(short, long);
        assert_ne!(short.as_str(), long.as_str());
    }

    #[test]
    fn ordering_is_numeric_not_lexical() {
        let old = Version::parse("3.9.0").unwrap();
        let new = Version::parse("3.11.0").unwrap();
        assert!(old < new);
    }

    #[test]
    fn serialize_round_trips_original_exactly() {
        for input in ["3.9", "3.9.0", "3", "3.9-alpha1+dev2", "1.2.3"] {
            let v = Version::parse(input).unwrap();
            let json = serde_json::to_string(&v).unwrap();
            assert_eq!(json, format!("{input:?}"));
            let back: Version = serde_json::from_str(&json).unwrap();
            assert_eq!(back.as_str(), input);
            assert_eq!(back, v);
        }
    }

    #[test]
    fn deserialize_rejects_non_string() {
        assert!(serde_json::from_str::<Version>("3.9").is_err());
        assert!(serde_json::from_str::<Version>("{}").is_err());
    }

    #[test]
    fn deserialize_rejects_malformed_literal() {
        assert!(serde_json::from_str::<Version>("\"bogus.version\"").is_err());
    }

    #[test]
    fn bumps_regenerate_string_from_canonical_form() {
        let v = Version::parse("3.9-alpha1").unwrap();
        assert_eq!(v.bump_patch().as_str(), "3.9.1");
        assert_eq!(v.bump_minor().as_str(), "3.10.0");
        assert_eq!(v.bump_major().as_str(), "4.0.0");
        // the source version is unchanged
        assert_eq!(v.as_str(), "3.9-alpha1");
    }
}
