//! Outbound signals.
//!
//! The ledger publishes on a tokio broadcast channel. Delivery is best
//! effort: a send with no subscribers is not an error, and slow receivers
//! observe `RecvError::Lagged` rather than blocking writers.

use consent_core::{AuditAction, Blake3Hash, EnrollmentStatus, StudyId, UserId};

/// Something observable happened in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentEvent {
    /// A participant's enrollment status changed.
    StatusChanged {
        study_id: StudyId,
        participant_id: UserId,
        /// `None` when the participant had no enrollment row.
        from: Option<EnrollmentStatus>,
        to: EnrollmentStatus,
    },
    /// An audit entry was written.
    AuditAppended {
        study_id: StudyId,
        action: AuditAction,
        /// Position in the study's log.
        index: u64,
        /// `None` for entries recorded out-of-band.
        entry_hash: Option<Blake3Hash>,
    },
}

impl ConsentEvent {
    pub fn study_id(&self) -> &StudyId {
        match self {
            ConsentEvent::StatusChanged { study_id, .. }
            | ConsentEvent::AuditAppended { study_id, .. } => study_id,
        }
    }
}
