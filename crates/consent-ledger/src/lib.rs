//! # Consent Ledger
//!
//! The unified API for recording research-participant consent: who is
//! enrolled in which study, what each participant has agreed to share,
//! immutable numbered snapshots of those decisions, and a tamper-evident log
//! of every change.
//!
//! ## Overview
//!
//! - **Catalog & bindings**: reusable permission templates, customised per
//!   study (required, sensitive, default-allow, display order)
//! - **Enrollment**: INVITED / ENROLLED / WITHDRAWN / COMPLETED per
//!   participant and study
//! - **Grants**: live decisions on optional permissions; required ones are
//!   locked on
//! - **Versions**: append-only snapshots numbered 1, 2, 3... per enrollment,
//!   each carrying a SHA-256 receipt hash
//! - **Audit chain**: a BLAKE3 hash chain per study, verified on demand
//! - **Documents**: HMAC-signed, shareable snapshot / history / diff /
//!   receipt payloads that can be re-verified later
//!
//! ## Usage
//!
//! ```rust,no_run
//! use consent_ledger::{ConsentConfig, ConsentLedger};
//! use consent_ledger::core::{Study, VersionSelector};
//! use consent_ledger::store::SqliteStore;
//!
//! async fn example() -> consent_ledger::Result<()> {
//!     let store = SqliteStore::open("consent.db")?;
//!     let ledger = ConsentLedger::new(store, ConsentConfig::from_env()?);
//!
//!     ledger.seed_catalog().await?;
//!     let study = ledger
//!         .register_study(Study::new("sleep-2026", "dr-lee", "Sleep patterns"))
//!         .await?;
//!
//!     let outcome = ledger.enroll(&study.id, &"alice".into()).await?;
//!     let version = ledger.save_version(&outcome.enrollment().id, None).await?;
//!     assert_eq!(version.version, 1);
//!
//!     let same = ledger
//!         .get_version(&outcome.enrollment().id, VersionSelector::Number(1))
//!         .await?;
//!     assert_eq!(same.receipt_hash, version.receipt_hash);
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `consent_ledger::core` - Core primitives (Enrollment, ConsentVersion, AuditEntry, etc.)
//! - `consent_ledger::store` - Storage abstraction and SQLite

pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
mod locks;

// Re-export component crates
pub use consent_core as core;
pub use consent_store as store;

// Re-export main types for convenience
pub use config::ConsentConfig;
pub use error::{ConsentError, Result};
pub use events::ConsentEvent;
pub use ledger::{
    BindingOptions, ConsentLedger, DocumentRequest, EventRow, ExportOptions, LedgerRow,
    ParticipantRow, PermissionRow, StudyExport, Verification,
};

// Re-export commonly used core types
pub use consent_core::{
    ActorRole, AuditAction, AuditEntry, ConsentDiff, ConsentVersion, DecisionSet, DocumentPayload,
    EnrollOutcome, Enrollment, EnrollmentId, EnrollmentStatus, PermKey, ReceiptAction,
    SignedDocument, StudyId, UserId, VersionSelector,
};
