//! Update policy and update candidates

use plexus_core::{Version, VersionBump};
use serde::{Deserialize, Serialize};

/// What the host may do on its own when a newer version is published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Never check
    Disabled,
    /// Check and report, never apply
    #[default]
    CheckOnly,
    /// Apply patch releases
    Patch,
    /// Apply patch and minor releases
    Minor,
    /// Apply any newer release
    All,
}

impl UpdatePolicy {
    /// Whether the policy checks for updates at all
    pub fn checks(self) -> bool {
        self != UpdatePolicy::Disabled
    }

    /// Whether an update of kind `bump` may be applied automatically
    pub fn allows(self, bump: VersionBump) -> bool {
        match self {
            UpdatePolicy::Disabled | UpdatePolicy::CheckOnly => false,
            UpdatePolicy::Patch => bump == VersionBump::Patch,
            UpdatePolicy::Minor => bump <= VersionBump::Minor,
            UpdatePolicy::All => true,
        }
    }
}

/// A newer published version of an installed plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCandidate {
    /// Plugin id
    pub plugin_id: String,
    /// Installed version
    pub current: Version,
    /// Newest published version
    pub available: Version,
    /// Size of the increase
    pub bump: VersionBump,
    /// Repository offering it
    pub repository: String,
}

impl UpdateCandidate {
    /// Build a candidate if `available` is newer than `current`
    pub fn new(
        plugin_id: impl Into<String>,
        current: Version,
        available: Version,
        repository: impl Into<String>,
    ) -> Option<Self> {
        let bump = current.bump_to(&available)?;
        Some(Self {
            plugin_id: plugin_id.into(),
            current,
            available,
            bump,
            repository: repository.into(),
        })
    }

    /// Whether `policy` lets this update apply without a caller
    pub fn is_automatic(&self, policy: UpdatePolicy) -> bool {
        policy.allows(self.bump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_allows() {
        assert!(!UpdatePolicy::CheckOnly.allows(VersionBump::Patch));
        assert!(UpdatePolicy::Patch.allows(VersionBump::Patch));
        assert!(!UpdatePolicy::Patch.allows(VersionBump::Minor));
        assert!(UpdatePolicy::Minor.allows(VersionBump::Minor));
        assert!(!UpdatePolicy::Minor.allows(VersionBump::Major));
        assert!(UpdatePolicy::All.allows(VersionBump::Major));
        assert!(!UpdatePolicy::Disabled.checks());
    }

    #[test]
    fn test_candidate_requires_newer() {
        let c = UpdateCandidate::new("a.b", Version::new(1, 0, 0), Version::new(1, 1, 0), "main")
            .unwrap();
        assert_eq!(c.bump, VersionBump::Minor);
        assert!(c.is_automatic(UpdatePolicy::Minor));
        assert!(UpdateCandidate::new("a.b", Version::new(1, 0, 0), Version::new(1, 0, 0), "main")
            .is_none());
    }
}
