//! Store trait: the abstract interface for consent persistence.
//!
//! This trait allows the ledger to be storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use consent_core::{
    effective_decisions, AuditEntry, Blake3Hash, BoundPermission, ConsentVersion, DecisionSet,
    Enrollment, EnrollmentId, PermKey, PermissionGrant, PermissionTemplate, Study, StudyId,
    StudyPermissionBinding, StudyStatus, UserId, VersionSelector,
};

use crate::error::Result;

/// Result of an insert-only write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    /// The row was new.
    Inserted,
    /// The key is already taken (idempotent - not an error).
    AlreadyExists,
}

/// A state change that is only ever written together with the audit entry
/// recording it.
#[derive(Debug, Clone)]
pub enum RowWrite {
    /// Insert a template. The slug must be free.
    Template(PermissionTemplate),
    /// Insert or replace the binding for `(study, template)`.
    Binding(StudyPermissionBinding),
    /// Set a study's status. Fails with `NotFound` if the study is unknown.
    StudyStatus { study_id: StudyId, status: StudyStatus },
    /// Insert or replace the enrollment row for its `(study, participant)`.
    Enrollment(Enrollment),
    /// Insert or replace a grant.
    Grant(PermissionGrant),
    /// Insert a version. Its number must be free.
    Version(ConsentVersion),
}

/// Result of a conditional audit append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendResult {
    /// The entry was written at `index` in its study's log.
    Appended { index: u64 },
    /// The entry's `prev_hash` no longer matches the chain tail.
    TailMoved {
        /// The tail the entry must be re-linked onto.
        tail: Option<Blake3Hash>,
    },
}

/// Result of [`Store::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// The row and the entry were written; the entry sits at `index`.
    Committed { index: u64 },
    /// The entry's `prev_hash` no longer matches the chain tail. Nothing
    /// was written.
    TailMoved { tail: Option<Blake3Hash> },
    /// The template slug or version number is already taken. Nothing was
    /// written.
    SlotTaken,
}

impl From<AppendResult> for CommitResult {
    fn from(result: AppendResult) -> Self {
        match result {
            AppendResult::Appended { index } => CommitResult::Committed { index },
            AppendResult::TailMoved { tail } => CommitResult::TailMoved { tail },
        }
    }
}

/// The Store trait: async interface for consent persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Insert-only history**: consent versions and audit entries are never
///   updated or deleted; there are no methods to do so.
/// - **Audited writes**: every state change the ledger audits goes through
///   [`Store::commit`], which writes the row and its audit entry in one
///   transaction or not at all.
/// - **Version slots**: committing a version whose number is taken returns
///   `SlotTaken`, so concurrent savers can retry with the next number.
/// - **Conditional appends**: an audit entry is written only if its
///   `prev_hash` equals the current tail, checked atomically with the write.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Catalog
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a template. Returns `AlreadyExists` if the slug is taken.
    async fn insert_template(&self, template: &PermissionTemplate) -> Result<InsertResult>;

    /// Get a template by slug.
    async fn get_template(&self, slug: &PermKey) -> Result<Option<PermissionTemplate>>;

    /// All templates, ordered by slug.
    async fn list_templates(&self) -> Result<Vec<PermissionTemplate>>;

    /// Replace a template's description. Returns false if the slug is unknown.
    async fn update_template_description(&self, slug: &PermKey, description: &str)
        -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Studies & bindings
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a study. Returns `AlreadyExists` if the id is taken.
    async fn insert_study(&self, study: &Study) -> Result<InsertResult>;

    async fn get_study(&self, study_id: &StudyId) -> Result<Option<Study>>;

    /// Bindings of a study joined with their templates, in display order.
    async fn list_bound_permissions(&self, study_id: &StudyId) -> Result<Vec<BoundPermission>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Enrollments
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_enrollment(
        &self,
        study_id: &StudyId,
        participant_id: &UserId,
    ) -> Result<Option<Enrollment>>;

    async fn get_enrollment_by_id(&self, id: &EnrollmentId) -> Result<Option<Enrollment>>;

    /// All enrollments of a study, ordered by participant.
    async fn list_enrollments(&self, study_id: &StudyId) -> Result<Vec<Enrollment>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Grants
    // ─────────────────────────────────────────────────────────────────────────

    /// Grants of one participant in a study, ordered by key.
    async fn list_grants(&self, study_id: &StudyId, user_id: &UserId)
        -> Result<Vec<PermissionGrant>>;

    /// Grants of every participant in a study, ordered by participant then key.
    async fn list_study_grants(&self, study_id: &StudyId) -> Result<Vec<PermissionGrant>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Consent versions
    // ─────────────────────────────────────────────────────────────────────────

    /// Highest version number of an enrollment, or 0 if none exist.
    async fn latest_version_number(&self, enrollment_id: &EnrollmentId) -> Result<u32>;

    /// Versions of an enrollment, newest first.
    async fn list_versions(&self, enrollment_id: &EnrollmentId) -> Result<Vec<ConsentVersion>>;

    /// A version of this enrollment by number or id.
    async fn get_version(
        &self,
        enrollment_id: &EnrollmentId,
        selector: VersionSelector,
    ) -> Result<Option<ConsentVersion>>;

    /// Every version of every enrollment in a study, ordered by enrollment
    /// then version.
    async fn list_study_versions(&self, study_id: &StudyId) -> Result<Vec<ConsentVersion>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Audit chain
    // ─────────────────────────────────────────────────────────────────────────

    /// Hash of the study's last linked entry.
    async fn audit_tail(&self, study_id: &StudyId) -> Result<Option<Blake3Hash>>;

    /// Append an entry.
    ///
    /// Linked entries are written only if their `prev_hash` equals the tail;
    /// otherwise `TailMoved` carries the current tail. Detached entries are
    /// always written.
    async fn append_audit(&self, entry: &AuditEntry) -> Result<AppendResult>;

    /// A study's log in append order.
    async fn list_audit(&self, study_id: &StudyId) -> Result<Vec<AuditEntry>>;

    /// Apply a row write and append its audit entry atomically.
    ///
    /// A linked entry is checked against the tail first, as in
    /// [`Store::append_audit`]. If the tail moved or the row's slot is taken,
    /// neither the row nor the entry is written.
    async fn commit(&self, write: &RowWrite, entry: &AuditEntry) -> Result<CommitResult>;
}

/// Extension trait for common store patterns.
pub trait StoreExt: Store {
    /// Load bindings and grants and merge them into the effective decisions.
    fn effective_decisions(
        &self,
        study_id: &StudyId,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<DecisionSet>> + Send;
}

impl<S: Store + ?Sized> StoreExt for S {
    async fn effective_decisions(&self, study_id: &StudyId, user_id: &UserId) -> Result<DecisionSet> {
        let bound = self.list_bound_permissions(study_id).await?;
        let grants = self.list_grants(study_id, user_id).await?;
        Ok(effective_decisions(&bound, &grants))
    }
}
