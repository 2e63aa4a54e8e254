use consent_core::{
    enrollment, ActorRole, AuditAction, AuditBuilder, EnrollOutcome, Enrollment,
    EnrollmentStatus, StudyId, UserId,
};
use consent_store::{RowWrite, Store};
use serde_json::json;
use tracing::info;

use super::{now_millis, ConsentLedger};
use crate::error::{ConsentError, Result};
use crate::events::ConsentEvent;

impl<S: Store> ConsentLedger<S> {
    // ─────────────────────────────────────────────────────────────────────────
    // Enrollment
    // ─────────────────────────────────────────────────────────────────────────

    /// Enroll a participant.
    ///
    /// The enrollment row and its ENROLL entry are written together or not
    /// at all. Enrolling an already ENROLLED participant is a no-op that
    /// returns `AlreadyEnrolled`: nothing is written, audited or signalled.
    /// Required permissions are implied by the bindings, so no grant rows are
    /// written.
    pub async fn enroll(&self, study_id: &StudyId, participant_id: &UserId) -> Result<EnrollOutcome> {
        let _study_guard = self.study_locks.share(study_id.clone()).await;
        let study = self.study(study_id).await?;
        if study.status.is_closed() {
            return Err(ConsentError::StudyClosed(study_id.clone()));
        }
        self.ensure_chain_open(study_id)?;

        let _guard = self
            .participant_locks
            .lock((study_id.clone(), participant_id.clone()))
            .await;

        let current = self.store.get_enrollment(study_id, participant_id).await?;
        let now = now_millis();
        let outcome = enrollment::enroll(current.as_ref(), study_id, participant_id, now)?;

        if let EnrollOutcome::Enrolled(next) = &outcome {
            let previous = current.as_ref().map(|e| e.status);
            self.commit(
                RowWrite::Enrollment(next.clone()),
                AuditBuilder::new(study_id.clone(), AuditAction::Enroll)
                    .actor(ActorRole::Participant, participant_id.clone())
                    .details(json!({
                        "enrollmentId": next.id.to_hex(),
                        "previousStatus": previous.map(|s| s.as_str()),
                    }))
                    .timestamp(now),
            )
            .await?;
            self.status_changed(next, previous);
        }

        Ok(outcome)
    }

    /// Withdraw an ENROLLED participant. Fails with `NotEnrolled` otherwise.
    ///
    /// Grants are kept so a later re-enrollment resumes from them.
    pub async fn unenroll(&self, study_id: &StudyId, participant_id: &UserId) -> Result<Enrollment> {
        self.study(study_id).await?;
        self.ensure_chain_open(study_id)?;

        let _guard = self
            .participant_locks
            .lock((study_id.clone(), participant_id.clone()))
            .await;

        let current = self.store.get_enrollment(study_id, participant_id).await?;
        let now = now_millis();
        let next = enrollment::unenroll(current.as_ref(), now)?;

        self.commit(
            RowWrite::Enrollment(next.clone()),
            AuditBuilder::new(study_id.clone(), AuditAction::Unenroll)
                .actor(ActorRole::Participant, participant_id.clone())
                .details(json!({ "enrollmentId": next.id.to_hex() }))
                .timestamp(now),
        )
        .await?;
        self.status_changed(&next, Some(EnrollmentStatus::Enrolled));

        Ok(next)
    }

    /// Invite a participant on behalf of the study owner.
    ///
    /// Creates an INVITED row only when the participant has none; returns
    /// `None` otherwise.
    pub async fn invite(
        &self,
        researcher: &UserId,
        study_id: &StudyId,
        participant_id: &UserId,
    ) -> Result<Option<Enrollment>> {
        let _study_guard = self.study_locks.share(study_id.clone()).await;
        let study = self.owned_study(study_id, researcher).await?;
        if study.status.is_closed() {
            return Err(ConsentError::StudyClosed(study_id.clone()));
        }
        self.ensure_chain_open(study_id)?;

        let _guard = self
            .participant_locks
            .lock((study_id.clone(), participant_id.clone()))
            .await;

        let current = self.store.get_enrollment(study_id, participant_id).await?;
        let Some(invited) = enrollment::invite(current.as_ref(), study_id, participant_id) else {
            return Ok(None);
        };

        self.commit(
            RowWrite::Enrollment(invited.clone()),
            AuditBuilder::new(study_id.clone(), AuditAction::Invite)
                .actor(ActorRole::Researcher, researcher.clone())
                .details(json!({ "enrollmentId": invited.id.to_hex() }))
                .timestamp(now_millis()),
        )
        .await?;
        self.status_changed(&invited, None);

        Ok(Some(invited))
    }

    /// Mark an ENROLLED participant as having completed the study.
    ///
    /// COMPLETED is terminal.
    pub async fn complete(
        &self,
        researcher: &UserId,
        study_id: &StudyId,
        participant_id: &UserId,
    ) -> Result<Enrollment> {
        self.owned_study(study_id, researcher).await?;
        self.ensure_chain_open(study_id)?;

        let _guard = self
            .participant_locks
            .lock((study_id.clone(), participant_id.clone()))
            .await;

        let current = self.store.get_enrollment(study_id, participant_id).await?;
        let next = enrollment::complete(current.as_ref())?;

        self.commit(
            RowWrite::Enrollment(next.clone()),
            AuditBuilder::new(study_id.clone(), AuditAction::EnrollmentCompleted)
                .actor(ActorRole::Researcher, researcher.clone())
                .details(json!({ "enrollmentId": next.id.to_hex() }))
                .timestamp(now_millis()),
        )
        .await?;
        self.status_changed(&next, Some(EnrollmentStatus::Enrolled));

        Ok(next)
    }

    /// A participant's enrollment row, if any.
    pub async fn enrollment(
        &self,
        study_id: &StudyId,
        participant_id: &UserId,
    ) -> Result<Option<Enrollment>> {
        self.read("get_enrollment", move || {
            self.store.get_enrollment(study_id, participant_id)
        })
        .await
    }

    /// All enrollment rows of a study.
    pub async fn enrollments(&self, study_id: &StudyId) -> Result<Vec<Enrollment>> {
        self.read("list_enrollments", move || self.store.list_enrollments(study_id))
            .await
    }

    fn status_changed(&self, enrollment: &Enrollment, from: Option<EnrollmentStatus>) {
        info!(
            study = %enrollment.study_id,
            participant = %enrollment.participant_id,
            from = from.map(|s| s.as_str()).unwrap_or("UNENROLLED"),
            to = enrollment.status.as_str(),
            "enrollment status changed"
        );
        self.publish(ConsentEvent::StatusChanged {
            study_id: enrollment.study_id.clone(),
            participant_id: enrollment.participant_id.clone(),
            from,
            to: enrollment.status,
        });
    }
}
