//! Contract versioning utilities

use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic version of a contract (e.g. "1.2.3")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractVersion(pub Version);

impl ContractVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(Version::new(major, minor, patch))
    }

    /// Create from a version string
    pub fn parse(version_str: &str) -> Result<Self, semver::Error> {
        // Strip leading 'v' if present
        let version_str = version_str.trim();
        let version_str = version_str.strip_prefix('v').unwrap_or(version_str);
        Version::parse(version_str).map(Self)
    }

    pub fn bump_major(&self) -> Self {
        Self::new(self.0.major + 1, 0, 0)
    }

    pub fn bump_minor(&self) -> Self {
        Self::new(self.0.major, self.0.minor + 1, 0)
    }

    pub fn bump_patch(&self) -> Self {
        Self::new(self.0.major, self.0.minor, self.0.patch + 1)
    }
}

impl fmt::Display for ContractVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ContractVersion {
    type Err = semver::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
