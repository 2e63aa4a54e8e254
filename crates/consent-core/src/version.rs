//! Immutable consent versions.
//!
//! A version freezes an effective decision set at a point in time. Versions
//! are numbered from 1 per enrollment with no gaps, and are never updated
//! after they are written.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical::canonical_value_bytes;
use crate::crypto::Sha256Hash;
use crate::grants::DecisionSet;
use crate::types::{EnrollmentId, VersionId};

/// A snapshot of a participant's decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentVersion {
    pub id: VersionId,
    pub enrollment_id: EnrollmentId,
    pub version: u32,
    pub created_at: i64,
    pub decisions: DecisionSet,
    pub receipt_hash: Sha256Hash,
}

impl ConsentVersion {
    /// Build version `version` of an enrollment, deriving its id and hash.
    pub fn new(
        enrollment_id: EnrollmentId,
        version: u32,
        decisions: DecisionSet,
        created_at: i64,
    ) -> Self {
        Self {
            id: VersionId::derive(&enrollment_id, version),
            receipt_hash: receipt_hash(&decisions),
            enrollment_id,
            version,
            created_at,
            decisions,
        }
    }

    /// Whether the stored id and hash still match the content.
    pub fn is_intact(&self) -> bool {
        self.id == VersionId::derive(&self.enrollment_id, self.version)
            && self.receipt_hash == receipt_hash(&self.decisions)
    }
}

/// SHA-256 over the canonical `{"permissions":[...]}` document.
pub fn receipt_hash(decisions: &DecisionSet) -> Sha256Hash {
    let keys: Vec<&str> = decisions.iter().map(|k| k.as_str()).collect();
    Sha256Hash::hash(&canonical_value_bytes(&json!({ "permissions": keys })))
}

/// How a caller names a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Number(u32),
    Id(VersionId),
}

impl VersionSelector {
    pub fn matches(&self, version: &ConsentVersion) -> bool {
        match self {
            VersionSelector::Number(n) => version.version == *n,
            VersionSelector::Id(id) => version.id == *id,
        }
    }
}

impl From<u32> for VersionSelector {
    fn from(n: u32) -> Self {
        VersionSelector::Number(n)
    }
}

impl From<VersionId> for VersionSelector {
    fn from(id: VersionId) -> Self {
        VersionSelector::Id(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PermKey;

    fn decisions(keys: &[&str]) -> DecisionSet {
        keys.iter().map(|k| PermKey::from(*k)).collect()
    }

    #[test]
    fn test_receipt_hash_ignores_input_order() {
        assert_eq!(receipt_hash(&decisions(&["b", "a"])), receipt_hash(&decisions(&["a", "b"])));
        assert_ne!(receipt_hash(&decisions(&["a"])), receipt_hash(&decisions(&["a", "b"])));
    }

    #[test]
    fn test_receipt_hash_of_empty_set() {
        // sha256 of {"permissions":[]}
        assert_eq!(
            receipt_hash(&DecisionSet::new()).to_hex(),
            Sha256Hash::hash(br#"{"permissions":[]}"#).to_hex()
        );
    }

    #[test]
    fn test_new_version_is_intact() {
        let enrollment = EnrollmentId::derive(&"s".into(), &"u".into());
        let mut v = ConsentVersion::new(enrollment, 1, decisions(&["a"]), 10);
        assert!(v.is_intact());
        v.decisions.insert("b".into());
        assert!(!v.is_intact());
    }

    #[test]
    fn test_selector() {
        let enrollment = EnrollmentId::derive(&"s".into(), &"u".into());
        let v = ConsentVersion::new(enrollment, 3, DecisionSet::new(), 10);
        assert!(VersionSelector::from(3).matches(&v));
        assert!(VersionSelector::from(v.id).matches(&v));
        assert!(!VersionSelector::from(2).matches(&v));
    }
}
