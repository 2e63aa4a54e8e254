use consent_core::grants::check_settable;
use consent_core::{
    ActorRole, AuditAction, AuditBuilder, DecisionSet, PermKey, PermissionGrant, StudyId, UserId,
};
use consent_store::{RowWrite, Store, StoreExt};
use serde_json::json;
use tracing::debug;

use super::{now_millis, ConsentLedger};
use crate::error::{ConsentError, Result};

impl<S: Store> ConsentLedger<S> {
    // ─────────────────────────────────────────────────────────────────────────
    // Permission Grants
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a participant's decision on an optional permission.
    ///
    /// Checked in order: the key must be bound to the study
    /// (`PermissionNotFound`), must not be required (`PermissionLocked`), and
    /// the participant must be ENROLLED (`NotEnrolled`). Setting the value a
    /// grant already holds returns the stored row unchanged.
    ///
    /// Bindings and enrollment are read under the study's shared lock and
    /// the participant's lock, so a concurrent rebinding or withdrawal lands
    /// either wholly before or wholly after this call.
    pub async fn set_grant(
        &self,
        study_id: &StudyId,
        participant_id: &UserId,
        perm_key: &PermKey,
        granted: bool,
    ) -> Result<PermissionGrant> {
        let _study_guard = self.study_locks.share(study_id.clone()).await;
        let _guard = self
            .participant_locks
            .lock((study_id.clone(), participant_id.clone()))
            .await;

        let bound = self.bound_permissions(study_id).await?;
        if bound.is_empty() {
            // Distinguish an unknown study from an empty one.
            self.study(study_id).await?;
        }
        check_settable(&bound, perm_key)?;
        self.ensure_chain_open(study_id)?;

        let enrolled = self
            .store
            .get_enrollment(study_id, participant_id)
            .await?
            .is_some_and(|e| e.is_active());
        if !enrolled {
            return Err(ConsentError::NotEnrolled);
        }

        let existing = self
            .store
            .list_grants(study_id, participant_id)
            .await?
            .into_iter()
            .find(|g| &g.perm_key == perm_key);
        let previous = existing.as_ref().map(|g| g.granted);
        if let Some(current) = existing.filter(|g| g.granted == granted) {
            debug!(study = %study_id, key = %perm_key, "grant unchanged");
            return Ok(current);
        }

        let now = now_millis();
        let grant = PermissionGrant {
            study_id: study_id.clone(),
            user_id: participant_id.clone(),
            perm_key: perm_key.clone(),
            granted,
            updated_at: now,
        };

        self.commit(
            RowWrite::Grant(grant.clone()),
            AuditBuilder::new(study_id.clone(), AuditAction::PermissionChanged)
                .actor(ActorRole::Participant, participant_id.clone())
                .details(json!({
                    "permKey": perm_key.as_str(),
                    "granted": granted,
                    "previous": previous,
                }))
                .timestamp(now),
        )
        .await?;

        Ok(grant)
    }

    /// The participant's effective decisions: required permissions, explicit
    /// grants, and optional permissions allowed by default with no row.
    pub async fn effective_decisions(
        &self,
        study_id: &StudyId,
        participant_id: &UserId,
    ) -> Result<DecisionSet> {
        self.read("effective_decisions", move || {
            self.store.effective_decisions(study_id, participant_id)
        })
        .await
    }

    /// Explicit grant rows of one participant.
    pub async fn grants(
        &self,
        study_id: &StudyId,
        participant_id: &UserId,
    ) -> Result<Vec<PermissionGrant>> {
        self.read("list_grants", move || {
            self.store.list_grants(study_id, participant_id)
        })
        .await
    }
}
