//! Semantic versions and the compatibility predicate
//!
//! A version `v` satisfies a requirement `r` iff the majors are equal and
//! `v.minor >= r.minor`. The patch component is informational. Ordering is
//! lexicographic over `(major, minor, patch)`.

use crate::error::{PluginError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Semantic version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    /// Major component; differing majors are incompatible
    pub major: u64,
    /// Minor component; providers must be at least the requested minor
    pub minor: u64,
    /// Patch component
    pub patch: u64,
}

/// Which component changed between two versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionBump {
    /// Only the patch component increased
    Patch,
    /// The minor component increased
    Minor,
    /// The major component increased
    Major,
}

impl Version {
    /// Create a version
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `MAJOR[.MINOR[.PATCH]]`, with an optional leading `v`.
    ///
    /// Pre-release and build suffixes are accepted and discarded.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        let core_len = trimmed
            .find(|c| c == '-' || c == '+')
            .unwrap_or(trimmed.len());
        let dots = trimmed[..core_len].matches('.').count();
        let normalized = match dots {
            0 => format!("{}.0.0{}", &trimmed[..core_len], &trimmed[core_len..]),
            1 => format!("{}.0{}", &trimmed[..core_len], &trimmed[core_len..]),
            _ => trimmed.to_string(),
        };

        let parsed = semver::Version::parse(&normalized).map_err(|e| {
            PluginError::invalid_format(format!("Invalid version '{input}': {e}"))
        })?;
        Ok(parsed.into())
    }

    /// Whether this version satisfies `requirement`
    pub fn satisfies(&self, requirement: &Version) -> bool {
        self.major == requirement.major && self.minor >= requirement.minor
    }

    /// Whether two versions share a major component
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// The kind of increase from `self` to `newer`, or `None` if `newer` is not newer
    pub fn bump_to(&self, newer: &Version) -> Option<VersionBump> {
        if newer <= self {
            None
        } else if newer.major != self.major {
            Some(VersionBump::Major)
        } else if newer.minor != self.minor {
            Some(VersionBump::Minor)
        } else {
            Some(VersionBump::Patch)
        }
    }
}

impl From<semver::Version> for Version {
    fn from(v: semver::Version) -> Self {
        Self::new(v.major, v.minor, v.patch)
    }
}

impl From<Version> for semver::Version {
    fn from(v: Version) -> Self {
        semver::Version::new(v.major, v.minor, v.patch)
    }
}

impl FromStr for Version {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Version::parse(&raw).map_err(|e| serde::de::Error::custom(e.message()))
    }
}
