//! Error types for the ledger.

use consent_core::{ChainError, CoreError, EnrollmentStatus, PermKey, StudyId, StudyStatus};
use consent_store::StoreError;
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum ConsentError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Study not found.
    #[error("study not found: {0}")]
    StudyNotFound(StudyId),

    /// Study already registered.
    #[error("study already exists: {0}")]
    StudyExists(StudyId),

    /// The study is archived or dropped.
    #[error("study {0} is closed")]
    StudyClosed(StudyId),

    /// The lifecycle change does not apply to the study's current status.
    #[error("study {study_id} cannot leave status {status}")]
    StudyTransitionRejected {
        study_id: StudyId,
        status: StudyStatus,
    },

    /// Permission not bound to the study, or not in the catalog.
    #[error("permission not found: {0}")]
    PermissionNotFound(PermKey),

    /// Catalog slug already taken.
    #[error("permission already defined: {0}")]
    PermissionExists(PermKey),

    /// Required permission; cannot be toggled.
    #[error("permission {0} is required and cannot be changed")]
    PermissionLocked(PermKey),

    /// Participant is not ENROLLED.
    #[error("participant is not enrolled")]
    NotEnrolled,

    /// Enrollment transition not allowed.
    #[error("invalid enrollment transition from {from} to {to}")]
    InvalidTransition {
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    },

    /// Version absent, or belongs to another enrollment.
    #[error("consent version not found")]
    VersionNotFound,

    /// Versions belong to different enrollments.
    #[error("versions belong to different enrollments")]
    InvalidComparison,

    /// Bounded retries exhausted under contention.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The study's audit chain failed verification.
    #[error("audit chain of study {study_id} broken at entry {at}")]
    ChainBroken { study_id: StudyId, at: usize },

    /// Document id does not match the payload.
    #[error("document signature mismatch")]
    SignatureMismatch,

    /// Document id is not 24 hex characters.
    #[error("malformed document id: {0}")]
    MalformedDocId(String),

    /// Not authorized.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Encoding failure.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ConsentError {
    /// Message safe to show to the person who made the request.
    pub fn user_message(&self) -> String {
        match self {
            ConsentError::PermissionLocked(_) => {
                "This permission is required by the study and cannot be changed.".to_string()
            }
            ConsentError::NotEnrolled => "You are not enrolled in this study.".to_string(),
            ConsentError::StudyNotFound(_)
            | ConsentError::PermissionNotFound(_)
            | ConsentError::VersionNotFound => "Not found.".to_string(),
            ConsentError::StudyClosed(_) => "This study is no longer open.".to_string(),
            ConsentError::InvalidTransition { .. }
            | ConsentError::StudyTransitionRejected { .. } => {
                "That change is not allowed right now.".to_string()
            }
            ConsentError::InvalidComparison => {
                "Only versions of the same enrollment can be compared.".to_string()
            }
            ConsentError::SignatureMismatch | ConsentError::MalformedDocId(_) => {
                "This document could not be verified.".to_string()
            }
            ConsentError::NotAuthorized(_) => "You are not allowed to do that.".to_string(),
            ConsentError::StudyExists(_) | ConsentError::PermissionExists(_) => {
                "That already exists.".to_string()
            }
            ConsentError::ServiceUnavailable(_) => {
                "The service is busy. Please try again.".to_string()
            }
            ConsentError::Store(_)
            | ConsentError::ChainBroken { .. }
            | ConsentError::Encoding(_)
            | ConsentError::Config(_) => "Something went wrong.".to_string(),
        }
    }

    /// Whether an operator must look at this failure.
    pub fn is_operator_alert(&self) -> bool {
        match self {
            ConsentError::ChainBroken { .. } | ConsentError::Config(_) => true,
            ConsentError::Store(e) => !e.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn chain_broken(study_id: &StudyId, err: &ChainError) -> Self {
        ConsentError::ChainBroken {
            study_id: study_id.clone(),
            at: err.index(),
        }
    }
}

impl From<CoreError> for ConsentError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotEnrolled => ConsentError::NotEnrolled,
            CoreError::InvalidTransition { from, to } => {
                ConsentError::InvalidTransition { from, to }
            }
            CoreError::PermissionNotFound(key) => ConsentError::PermissionNotFound(key),
            CoreError::PermissionLocked(key) => ConsentError::PermissionLocked(key),
            CoreError::InvalidComparison => ConsentError::InvalidComparison,
            CoreError::MalformedDocId(s) => ConsentError::MalformedDocId(s),
            CoreError::Encoding(s) | CoreError::Decoding(s) => ConsentError::Encoding(s),
        }
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, ConsentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_message_is_clear() {
        let err = ConsentError::PermissionLocked(PermKey::new("study-participation"));
        assert!(err.user_message().contains("cannot be changed"));
        assert!(!err.is_operator_alert());
    }

    #[test]
    fn test_chain_broken_alerts_operator() {
        let err = ConsentError::ChainBroken {
            study_id: StudyId::new("s1"),
            at: 3,
        };
        assert!(err.is_operator_alert());
        assert_eq!(err.to_string(), "audit chain of study s1 broken at entry 3");
    }

    #[test]
    fn test_core_errors_map_to_taxonomy() {
        let err: ConsentError = CoreError::PermissionNotFound(PermKey::new("x")).into();
        assert!(matches!(err, ConsentError::PermissionNotFound(_)));
        let err: ConsentError = CoreError::InvalidComparison.into();
        assert!(matches!(err, ConsentError::InvalidComparison));
        let err: ConsentError = CoreError::NotEnrolled.into();
        assert_eq!(err.user_message(), "You are not enrolled in this study.");
    }
}
