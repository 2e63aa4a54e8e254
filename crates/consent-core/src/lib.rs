//! # Consent Core
//!
//! Pure primitives for the consent ledger: the permission catalog, study
//! bindings, the enrollment state machine, grant merging, immutable consent
//! versions, diffs, the audit hash chain and signed documents.
//!
//! This crate contains no I/O and no storage. Every function is a
//! deterministic computation over the types defined here; persistence and
//! concurrency live in `consent-store` and `consent-ledger`.
//!
//! ## Key Types
//!
//! - [`PermissionTemplate`] / [`BoundPermission`] - what may be shared, and how a study asks for it
//! - [`Enrollment`] - a participant's relationship to a study
//! - [`DecisionSet`] - the effective set of granted permission keys
//! - [`ConsentVersion`] - an immutable, numbered snapshot of decisions
//! - [`AuditEntry`] - one link in a study's tamper-evident log
//! - [`DocumentSigner`] - mints and checks shareable document ids
//!
//! ## Hashing
//!
//! Hashes and signatures are computed over canonical JSON. See [`canonical`].

pub mod audit;
pub mod binding;
pub mod canonical;
pub mod catalog;
pub mod crypto;
pub mod diff;
pub mod document;
pub mod enrollment;
pub mod error;
pub mod grants;
pub mod study;
pub mod types;
pub mod version;

pub use audit::{
    chain_tail, compute_entry_hash, verify_chain, Actor, ActorRole, AuditAction, AuditBuilder,
    AuditEntry, ChainLink,
};
pub use binding::{sort_for_display, BoundPermission, StudyPermissionBinding};
pub use canonical::{canonical_json, canonical_string, canonical_value_bytes};
pub use catalog::{builtin_catalog, PermissionSource, PermissionTemplate, PiiLevel};
pub use crypto::{pseudonym, Blake3Hash, Sha256Hash, SigningSecret};
pub use diff::{diff, ConsentDiff};
pub use document::{
    verify_url, DocId, DocumentKind, DocumentPayload, DocumentSigner, ReceiptAction,
    SignedDocument,
};
pub use enrollment::{EnrollOutcome, Enrollment, EnrollmentStatus};
pub use error::{ChainError, CoreError};
pub use grants::{effective_decisions, DecisionSet, PermissionGrant};
pub use study::{Study, StudyStatus, StudyTransition};
pub use types::{EnrollmentId, PermKey, StudyId, TemplateId, UserId, VersionId};
pub use version::{receipt_hash, ConsentVersion, VersionSelector};
