//! Semantic versions and half-open version ranges
//!
//! Versions are ordered by MAJOR.MINOR.PATCH, then pre-release identifiers
//! (a pre-release sorts below its release), then build metadata.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during version parsing
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SemverError {
    /// Invalid version format
    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    /// Invalid range format or empty range
    #[error("Invalid version range: {0}")]
    InvalidRange(String),
}

/// Semantic version (MAJOR.MINOR.PATCH[-PRERELEASE][+BUILD])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

impl Version {
    /// Create a new release version
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Version {
            major,
            minor,
            patch,
            prerelease: None,
            build: None,
        }
    }

    /// Parse a version string, accepting an optional `v` prefix (as used by tags)
    pub fn parse(s: &str) -> Result<Self, SemverError> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);

        let (version_part, build) = match s.split_once('+') {
            Some((v, b)) => (v, Some(b.to_string())),
            None => (s, None),
        };

        let (core, prerelease) = match version_part.split_once('-') {
            Some((v, p)) => (v, Some(p.to_string())),
            None => (version_part, None),
        };

        if prerelease.as_deref() == Some("") || build.as_deref() == Some("") {
            return Err(SemverError::InvalidVersion(s.to_string()));
        }

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(SemverError::InvalidVersion(format!(
                "Expected MAJOR.MINOR.PATCH, got '{}'",
                s
            )));
        }

        let component = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| SemverError::InvalidVersion(format!("Invalid component '{}' in '{}'", part, s)))
        };

        Ok(Version {
            major: component(parts[0])?,
            minor: component(parts[1])?,
            patch: component(parts[2])?,
            prerelease,
            build,
        })
    }

    /// Check if this is a prerelease version
    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }

    /// Next major version (resets minor and patch to 0)
    pub fn bump_major(&self) -> Self {
        Version::new(self.major + 1, 0, 0)
    }

    /// Next minor version (resets patch to 0)
    pub fn bump_minor(&self) -> Self {
        Version::new(self.major, self.minor + 1, 0)
    }

    /// The same MAJOR.MINOR.PATCH without pre-release or build parts
    pub fn release(&self) -> Self {
        Version::new(self.major, self.minor, self.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.prerelease {
            write!(f, "-{}", pre)?;
        }
        if let Some(ref build) = self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = SemverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => compare_prerelease(a, b),
            })
            .then_with(|| self.build.cmp(&other.build))
    }
}

/// Dot-separated identifiers: numeric ones compare numerically and sort
/// below alphanumeric ones; a shorter list sorts first on a common prefix.
fn compare_prerelease(a: &str, b: &str) -> Ordering {
    let mut lhs = a.split('.');
    let mut rhs = b.split('.');
    loop {
        match (lhs.next(), rhs.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Whether pre-release versions take part in range matching
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrereleasePolicy {
    /// Pre-releases are only admitted when a requirement names one explicitly
    #[default]
    Exclude,

    /// Pre-releases are ordinary candidates, ordered below their release
    Include,
}

/// Half-open version range `lower..<upper`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionRange {
    pub lower: Version,
    pub upper: Version,
}

impl VersionRange {
    /// Create a range; fails if it would be empty
    pub fn new(lower: Version, upper: Version) -> Result<Self, SemverError> {
        if lower >= upper {
            return Err(SemverError::InvalidRange(format!("{}..<{}", lower, upper)));
        }
        Ok(VersionRange { lower, upper })
    }

    /// `version..<(major + 1).0.0`
    pub fn up_to_next_major(version: Version) -> Self {
        let upper = version.bump_major();
        VersionRange {
            lower: version,
            upper,
        }
    }

    /// `version..<major.(minor + 1).0`
    pub fn up_to_next_minor(version: Version) -> Self {
        let upper = version.bump_minor();
        VersionRange {
            lower: version,
            upper,
        }
    }

    /// Plain interval membership
    pub fn contains(&self, version: &Version) -> bool {
        &self.lower <= version && version < &self.upper
    }

    /// Membership under a pre-release policy
    ///
    /// With [`PrereleasePolicy::Exclude`] a pre-release is only admitted when
    /// the lower bound is itself a pre-release of the same release.
    pub fn admits(&self, version: &Version, policy: PrereleasePolicy) -> bool {
        if !self.contains(version) {
            return false;
        }
        match policy {
            PrereleasePolicy::Include => true,
            PrereleasePolicy::Exclude => {
                !version.is_prerelease()
                    || (self.lower.is_prerelease() && self.lower.release() == version.release())
            }
        }
    }

    /// Parse `lower..<upper`
    pub fn parse(s: &str) -> Result<Self, SemverError> {
        let (lower, upper) = s
            .split_once("..<")
            .ok_or_else(|| SemverError::InvalidRange(s.to_string()))?;
        VersionRange::new(Version::parse(lower)?, Version::parse(upper)?)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..<{}", self.lower, self.upper)
    }
}
