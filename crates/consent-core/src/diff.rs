//! Differences between two consent versions of the same enrollment.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{EnrollmentId, PermKey};
use crate::version::ConsentVersion;

/// `added = to ∖ from`, `removed = from ∖ to`, `unchanged = from ∩ to`.
/// Each list is sorted by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentDiff {
    pub enrollment_id: EnrollmentId,
    pub from: u32,
    pub to: u32,
    pub added: Vec<PermKey>,
    pub removed: Vec<PermKey>,
    pub unchanged: Vec<PermKey>,
}

impl ConsentDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compare two versions. Both must belong to the same enrollment.
pub fn diff(from: &ConsentVersion, to: &ConsentVersion) -> Result<ConsentDiff, CoreError> {
    if from.enrollment_id != to.enrollment_id {
        return Err(CoreError::InvalidComparison);
    }

    Ok(ConsentDiff {
        enrollment_id: from.enrollment_id,
        from: from.version,
        to: to.version,
        added: to.decisions.difference(&from.decisions),
        removed: from.decisions.difference(&to.decisions),
        unchanged: from.decisions.intersection(&to.decisions),
    })
}
