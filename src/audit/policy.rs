//! Governance policy: classification levels and what each permits.
//!
//! The policy is consulted before executing an operation; violations are
//! rejected with `PolicyDenied` before any index access. Rejections are
//! surfaced opaquely — callers never learn which rule fired.

use crate::types::{Result, ThemisError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Classification label gating encryption, cacheability, export and
/// vector search.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Offen,
    VsNfd,
    Geheim,
    StrengGeheim,
}

/// What vector search is allowed to do at a classification level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorPolicy {
    /// Unrestricted ANN search
    Allow,
    /// Search allowed; results carry URNs and distances only, no payloads
    AllowMetadataOnly,
    /// Search allowed only through the pre-filtered (whitelist) path
    Restricted,
    /// No ANN at all
    DisableAnn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPolicy {
    Allow,
    Deny,
}

/// Per-level policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelPolicy {
    pub encryption_required: bool,
    pub double_encrypt: bool,
    pub pii_auto_anonymize: bool,
    pub vector_policy: VectorPolicy,
    pub export_policy: ExportPolicy,
    pub cache_ttl_seconds: u64,
}

/// The governance policy: one `LevelPolicy` per classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernancePolicy {
    levels: BTreeMap<Classification, LevelPolicy>,
}

impl Default for GovernancePolicy {
    fn default() -> Self {
        let mut levels = BTreeMap::new();
        levels.insert(
            Classification::Offen,
            LevelPolicy {
                encryption_required: false,
                double_encrypt: false,
                pii_auto_anonymize: false,
                vector_policy: VectorPolicy::Allow,
                export_policy: ExportPolicy::Allow,
                cache_ttl_seconds: 3600,
            },
        );
        levels.insert(
            Classification::VsNfd,
            LevelPolicy {
                encryption_required: true,
                double_encrypt: false,
                pii_auto_anonymize: true,
                vector_policy: VectorPolicy::Allow,
                export_policy: ExportPolicy::Allow,
                cache_ttl_seconds: 600,
            },
        );
        levels.insert(
            Classification::Geheim,
            LevelPolicy {
                encryption_required: true,
                double_encrypt: false,
                pii_auto_anonymize: true,
                vector_policy: VectorPolicy::Restricted,
                export_policy: ExportPolicy::Deny,
                cache_ttl_seconds: 60,
            },
        );
        levels.insert(
            Classification::StrengGeheim,
            LevelPolicy {
                encryption_required: true,
                double_encrypt: true,
                pii_auto_anonymize: true,
                vector_policy: VectorPolicy::DisableAnn,
                export_policy: ExportPolicy::Deny,
                cache_ttl_seconds: 0,
            },
        );
        Self { levels }
    }
}

impl GovernancePolicy {
    /// The policy for a level. Every level is always present.
    pub fn level(&self, classification: Classification) -> &LevelPolicy {
        self.levels
            .get(&classification)
            .expect("all classification levels configured")
    }

    /// Gate a vector search before any index access.
    pub fn check_vector_search(&self, classification: Classification) -> Result<()> {
        match self.level(classification).vector_policy {
            VectorPolicy::DisableAnn => Err(ThemisError::PolicyDenied),
            _ => Ok(()),
        }
    }

    /// Whether vector search must go through the whitelist path.
    pub fn vector_requires_prefilter(&self, classification: Classification) -> bool {
        matches!(
            self.level(classification).vector_policy,
            VectorPolicy::Restricted | VectorPolicy::AllowMetadataOnly
        )
    }

    /// Whether vector results must be stripped to URN + distance.
    pub fn vector_metadata_only(&self, classification: Classification) -> bool {
        matches!(
            self.level(classification).vector_policy,
            VectorPolicy::AllowMetadataOnly
        )
    }

    /// Gate an export operation.
    pub fn check_export(&self, classification: Classification) -> Result<()> {
        match self.level(classification).export_policy {
            ExportPolicy::Allow => Ok(()),
            ExportPolicy::Deny => Err(ThemisError::PolicyDenied),
        }
    }

    /// Entity-cache TTL for a level; zero disables caching.
    pub fn cache_ttl_seconds(&self, classification: Classification) -> u64 {
        self.level(classification).cache_ttl_seconds
    }

    /// Whether audit events for this level must anonymize detected PII.
    pub fn pii_auto_anonymize(&self, classification: Classification) -> bool {
        self.level(classification).pii_auto_anonymize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_streng_geheim_disables_ann() {
        let policy = GovernancePolicy::default();
        assert!(matches!(
            policy.check_vector_search(Classification::StrengGeheim),
            Err(ThemisError::PolicyDenied)
        ));
        assert!(policy.check_vector_search(Classification::Offen).is_ok());
    }

    #[test]
    fn test_geheim_requires_prefilter() {
        let policy = GovernancePolicy::default();
        assert!(policy.vector_requires_prefilter(Classification::Geheim));
        assert!(!policy.vector_requires_prefilter(Classification::Offen));
    }

    #[test]
    fn test_export_gate() {
        let policy = GovernancePolicy::default();
        assert!(policy.check_export(Classification::Offen).is_ok());
        assert!(policy.check_export(Classification::Geheim).is_err());
    }

    #[test]
    fn test_classification_serde_names() {
        let json = serde_json::to_string(&Classification::StrengGeheim).unwrap();
        assert_eq!(json, "\"streng-geheim\"");
        let parsed: Classification = serde_json::from_str("\"vs-nfd\"").unwrap();
        assert_eq!(parsed, Classification::VsNfd);
    }

    #[test]
    fn test_cache_ttl_zero_for_top_secret() {
        let policy = GovernancePolicy::default();
        assert_eq!(policy.cache_ttl_seconds(Classification::StrengGeheim), 0);
        assert!(policy.cache_ttl_seconds(Classification::Offen) > 0);
    }
}
