use consent_core::grants::normalize_selection;
use consent_core::{
    diff, effective_decisions, ActorRole, AuditAction, AuditBuilder, ConsentDiff, ConsentVersion,
    DecisionSet, Enrollment, EnrollmentId, PermKey, VersionSelector,
};
use consent_store::{RowWrite, Store};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{now_millis, ConsentLedger};
use crate::error::{ConsentError, Result};

impl<S: Store> ConsentLedger<S> {
    // ─────────────────────────────────────────────────────────────────────────
    // Consent Versions
    // ─────────────────────────────────────────────────────────────────────────

    /// Freeze the participant's decisions into the next numbered version.
    ///
    /// Without a selection the current effective decisions are frozen. An
    /// explicit selection is de-duplicated, sorted and always includes the
    /// study's required permissions; unbound keys fail with
    /// `PermissionNotFound`.
    ///
    /// The enrollment, bindings and grants are read under the participant's
    /// lock, so a save never interleaves with a withdrawal or a grant change.
    /// The version and its VERSION_SAVED entry are written as one unit.
    ///
    /// Saves for one enrollment each get a distinct number with no gaps. A
    /// save that loses a number to another process retries with the next
    /// one, up to `version_retries` attempts, then fails with
    /// `ServiceUnavailable`.
    pub async fn save_version(
        &self,
        enrollment_id: &EnrollmentId,
        selection: Option<&[PermKey]>,
    ) -> Result<ConsentVersion> {
        let key = self
            .store
            .get_enrollment_by_id(enrollment_id)
            .await?
            .ok_or(ConsentError::NotEnrolled)?;

        let _study_guard = self.study_locks.share(key.study_id.clone()).await;
        let _guard = self
            .participant_locks
            .lock((key.study_id.clone(), key.participant_id.clone()))
            .await;

        // Re-read under the lock; a withdrawal may have committed meanwhile.
        let enrollment = self
            .store
            .get_enrollment_by_id(enrollment_id)
            .await?
            .filter(Enrollment::is_active)
            .ok_or(ConsentError::NotEnrolled)?;
        self.ensure_chain_open(&enrollment.study_id)?;

        let bound = self.store.list_bound_permissions(&enrollment.study_id).await?;
        let decisions = match selection {
            Some(keys) => normalize_selection(&bound, keys)?,
            None => {
                let grants = self
                    .store
                    .list_grants(&enrollment.study_id, &enrollment.participant_id)
                    .await?;
                effective_decisions(&bound, &grants)
            }
        };

        let version = self.claim_version(&enrollment, decisions).await?;
        info!(
            study = %enrollment.study_id,
            enrollment = %enrollment.id.to_hex(),
            version = version.version,
            "saved consent version"
        );
        Ok(version)
    }

    /// Versions of an enrollment, newest first.
    pub async fn list_versions(&self, enrollment_id: &EnrollmentId) -> Result<Vec<ConsentVersion>> {
        self.read("list_versions", move || self.store.list_versions(enrollment_id))
            .await
    }

    /// A version by number or id. Fails with `VersionNotFound` if it does
    /// not exist or belongs to another enrollment.
    pub async fn get_version(
        &self,
        enrollment_id: &EnrollmentId,
        selector: impl Into<VersionSelector>,
    ) -> Result<ConsentVersion> {
        let selector = selector.into();
        self.read("get_version", move || {
            self.store.get_version(enrollment_id, selector)
        })
        .await?
        .ok_or(ConsentError::VersionNotFound)
    }

    /// The newest version of an enrollment, if any.
    pub async fn latest_version(&self, enrollment_id: &EnrollmentId) -> Result<Option<ConsentVersion>> {
        Ok(self.list_versions(enrollment_id).await?.into_iter().next())
    }

    /// Compare two versions of the same enrollment.
    pub fn diff(&self, from: &ConsentVersion, to: &ConsentVersion) -> Result<ConsentDiff> {
        Ok(diff(from, to)?)
    }

    /// Look up two versions of an enrollment and compare them.
    pub async fn diff_versions(
        &self,
        enrollment_id: &EnrollmentId,
        from: impl Into<VersionSelector>,
        to: impl Into<VersionSelector>,
    ) -> Result<ConsentDiff> {
        let from = self.get_version(enrollment_id, from).await?;
        let to = self.get_version(enrollment_id, to).await?;
        self.diff(&from, &to)
    }

    /// Take the next free number and write the version with its audit entry.
    async fn claim_version(
        &self,
        enrollment: &Enrollment,
        decisions: DecisionSet,
    ) -> Result<ConsentVersion> {
        for attempt in 1..=self.config.version_retries {
            let number = self.store.latest_version_number(&enrollment.id).await? + 1;
            let candidate =
                ConsentVersion::new(enrollment.id, number, decisions.clone(), now_millis());

            let saved = self
                .commit(
                    RowWrite::Version(candidate.clone()),
                    AuditBuilder::new(enrollment.study_id.clone(), AuditAction::VersionSaved)
                        .actor(ActorRole::Participant, enrollment.participant_id.clone())
                        .details(json!({
                            "enrollmentId": enrollment.id.to_hex(),
                            "version": candidate.version,
                            "receiptHash": candidate.receipt_hash.to_hex(),
                        }))
                        .timestamp(candidate.created_at),
                )
                .await?;
            if saved.is_some() {
                return Ok(candidate);
            }

            debug!(attempt, version = number, "version number taken, retrying");
            tokio::task::yield_now().await;
        }

        warn!(
            enrollment = %enrollment.id.to_hex(),
            attempts = self.config.version_retries,
            "gave up claiming a version number"
        );
        Err(ConsentError::ServiceUnavailable(
            "too many concurrent consent saves".to_string(),
        ))
    }
}
