// src/version.rs

//! Package versions and version constraints
//!
//! Versions follow semantic versioning but are parsed leniently: repository
//! metadata routinely says `1.0` where semver wants `1.0.0`, so missing minor
//! and patch components are filled with zero. The original spelling is kept
//! for display.
//!
//! Constraint syntax:
//! - `*` or empty: any version
//! - `=V`, `==V`, or a bare version `V`: exactly `V`
//! - anything else: a semver requirement (`>=1.0`, `^2`, `>=1.2, <2`)

use crate::error::{Error, Result};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// A package version with semver ordering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageVersion {
    raw: String,
    parsed: Version,
}

impl PackageVersion {
    /// Parse a version, padding missing minor/patch components
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::ParseError("empty version string".to_string()));
        }

        let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
        let (core, suffix) = trimmed.split_at(split);
        let mut parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(Error::ParseError(format!("invalid version: {}", trimmed)));
        }
        while parts.len() < 3 {
            parts.push("0");
        }

        let normalized = format!("{}{}", parts.join("."), suffix);
        let parsed = Version::parse(&normalized)
            .map_err(|e| Error::ParseError(format!("invalid version {}: {}", trimmed, e)))?;

        Ok(Self {
            raw: trimmed.to_string(),
            parsed,
        })
    }

    /// The normalized semver value
    pub fn semver(&self) -> &Version {
        &self.parsed
    }

    /// The version as written in metadata
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for PackageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parsed == other.parsed
    }
}

impl Eq for PackageVersion {}

impl Hash for PackageVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parsed.hash(state);
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parsed.cmp(&other.parsed)
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for PackageVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PackageVersion {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<PackageVersion> for String {
    fn from(v: PackageVersion) -> Self {
        v.raw
    }
}

/// Version predicate attached to a dependency or conflict
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionConstraint {
    #[default]
    Any,
    Exact(PackageVersion),
    Range(VersionReq),
}

impl VersionConstraint {
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(VersionConstraint::Any);
        }

        if let Some(rest) = trimmed
            .strip_prefix("==")
            .or_else(|| trimmed.strip_prefix('='))
        {
            return Ok(VersionConstraint::Exact(PackageVersion::parse(rest)?));
        }

        if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
            if let Ok(version) = PackageVersion::parse(trimmed) {
                return Ok(VersionConstraint::Exact(version));
            }
        }

        VersionReq::parse(trimmed)
            .map(VersionConstraint::Range)
            .map_err(|e| Error::ParseError(format!("invalid version constraint {}: {}", trimmed, e)))
    }

    /// Check whether a version satisfies this constraint
    pub fn matches(&self, version: &PackageVersion) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Exact(expected) => expected == version,
            VersionConstraint::Range(req) => req.matches(version.semver()),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, VersionConstraint::Any)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => f.write_str("*"),
            VersionConstraint::Exact(v) => write!(f, "={}", v),
            VersionConstraint::Range(req) => write!(f, "{}", req),
        }
    }
}

impl FromStr for VersionConstraint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<VersionConstraint> for String {
    fn from(c: VersionConstraint) -> Self {
        c.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> PackageVersion {
        PackageVersion::parse(s).unwrap()
    }

    #[test]
    fn test_lenient_version_parsing() {
        assert_eq!(v("1.0"), v("1.0.0"));
        assert_eq!(v("2"), v("2.0.0"));
        assert_eq!(v("1.0").to_string(), "1.0");
        assert!(v("1.0-beta") < v("1.0"));
        assert!(PackageVersion::parse("").is_err());
        assert!(PackageVersion::parse("1..2").is_err());
        assert!(PackageVersion::parse("1.2.3.4").is_err());
    }

    #[test]
    fn test_version_ordering() {
        let mut versions = vec![v("1.10"), v("1.2"), v("2.0"), v("1.2.1")];
        versions.sort();
        let rendered: Vec<String> = versions.iter().map(|v| v.to_string()).collect();
        assert_eq!(rendered, vec!["1.2", "1.2.1", "1.10", "2.0"]);
    }

    #[test]
    fn test_constraint_parsing() {
        assert_eq!(VersionConstraint::parse("").unwrap(), VersionConstraint::Any);
        assert_eq!(VersionConstraint::parse("*").unwrap(), VersionConstraint::Any);
        assert_eq!(
            VersionConstraint::parse("=1.0").unwrap(),
            VersionConstraint::Exact(v("1.0.0"))
        );
        assert_eq!(
            VersionConstraint::parse("1.2").unwrap(),
            VersionConstraint::Exact(v("1.2"))
        );
        assert!(matches!(
            VersionConstraint::parse(">=1.0").unwrap(),
            VersionConstraint::Range(_)
        ));
        assert!(VersionConstraint::parse(">=banana").is_err());
    }

    #[test]
    fn test_constraint_matching() {
        let at_least_two = VersionConstraint::parse(">=2.0").unwrap();
        assert!(!at_least_two.matches(&v("1.0")));
        assert!(at_least_two.matches(&v("2.0")));
        assert!(at_least_two.matches(&v("3.1")));

        let window = VersionConstraint::parse(">=1.2, <2").unwrap();
        assert!(window.matches(&v("1.5")));
        assert!(!window.matches(&v("2.0")));

        assert!(VersionConstraint::Any.matches(&v("0.0.1")));
        assert!(VersionConstraint::parse("==1.0").unwrap().matches(&v("1.0.0")));
    }

    #[test]
    fn test_serde_uses_string_form() {
        let json = serde_json::to_string(&VersionConstraint::parse(">=1.0").unwrap()).unwrap();
        assert_eq!(json, "\">=1.0\"");
        let back: VersionConstraint = serde_json::from_str(&json).unwrap();
        assert!(back.matches(&v("1.0")));

        let version: PackageVersion = serde_json::from_str("\"1.4\"").unwrap();
        assert_eq!(version, v("1.4.0"));
    }
}
