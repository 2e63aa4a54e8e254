//! Error types for the consent ledger core.

use thiserror::Error;

use crate::crypto::Blake3Hash;
use crate::enrollment::EnrollmentStatus;
use crate::types::PermKey;

/// Core errors raised by the pure state machines and encoders.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("participant is not enrolled")]
    NotEnrolled,

    #[error("invalid enrollment transition from {from} to {to}")]
    InvalidTransition {
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    },

    #[error("permission {0} is not bound to this study")]
    PermissionNotFound(PermKey),

    #[error("permission {0} is required and cannot be changed")]
    PermissionLocked(PermKey),

    #[error("versions belong to different enrollments")]
    InvalidComparison,

    #[error("malformed document id: {0}")]
    MalformedDocId(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Audit chain verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// The recomputed hash of the entry at `at` does not match its stored hash,
    /// or its `prev_hash` does not point at the preceding linked entry.
    #[error("audit chain broken at entry {at}")]
    Broken {
        at: usize,
        expected: Option<Blake3Hash>,
        actual: Option<Blake3Hash>,
    },
}

impl ChainError {
    /// Index of the first entry that failed verification.
    pub fn index(&self) -> usize {
        match self {
            ChainError::Broken { at, .. } => *at,
        }
    }
}
