use consent_core::{
    ActorRole, AuditAction, AuditBuilder, BoundPermission, PermKey, Study, StudyId,
    StudyPermissionBinding, StudyTransition, UserId,
};
use consent_store::{InsertResult, RowWrite, Store};
use serde_json::json;
use tracing::info;

use super::{now_millis, ConsentLedger};
use crate::error::{ConsentError, Result};

/// Per-study overrides applied when binding a template.
///
/// `None` keeps the template's default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingOptions {
    pub required: Option<bool>,
    pub sensitive: Option<bool>,
    pub default_allow: Option<bool>,
    pub display_order: i32,
}

impl BindingOptions {
    pub fn required(mut self, required: bool) -> Self {
        self.required = Some(required);
        self
    }

    pub fn sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = Some(sensitive);
        self
    }

    pub fn default_allow(mut self, allow: bool) -> Self {
        self.default_allow = Some(allow);
        self
    }

    pub fn display_order(mut self, order: i32) -> Self {
        self.display_order = order;
        self
    }
}

impl<S: Store> ConsentLedger<S> {
    // ─────────────────────────────────────────────────────────────────────────
    // Studies & Bindings
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a study.
    pub async fn register_study(&self, study: Study) -> Result<Study> {
        match self.store.insert_study(&study).await? {
            InsertResult::Inserted => {
                info!(study = %study.id, owner = %study.owner_id, "registered study");
                Ok(study)
            }
            _ => Err(ConsentError::StudyExists(study.id)),
        }
    }

    /// Bind a catalog template to a study, or replace its overrides.
    ///
    /// Owner-only, and only while the study is neither archived nor dropped.
    pub async fn bind_permission(
        &self,
        researcher: &UserId,
        study_id: &StudyId,
        slug: &PermKey,
        options: BindingOptions,
    ) -> Result<BoundPermission> {
        let _guard = self.study_locks.lock(study_id.clone()).await;

        let study = self.owned_study(study_id, researcher).await?;
        if !study.bindings_mutable() {
            return Err(ConsentError::StudyClosed(study_id.clone()));
        }
        self.ensure_chain_open(study_id)?;

        let template = self
            .store
            .get_template(slug)
            .await?
            .ok_or_else(|| ConsentError::PermissionNotFound(slug.clone()))?;

        let mut binding = StudyPermissionBinding::new(study_id.clone(), template.id)
            .display_order(options.display_order);
        binding.required = options.required;
        binding.sensitive = options.sensitive;
        binding.default_allow = options.default_allow;

        let bound = BoundPermission::new(binding.clone(), template);

        self.commit(
            RowWrite::Binding(binding),
            AuditBuilder::new(study_id.clone(), AuditAction::PermissionBound)
                .actor(ActorRole::Researcher, researcher.clone())
                .details(json!({
                    "permKey": bound.key().as_str(),
                    "required": bound.is_required(),
                    "sensitive": bound.is_sensitive(),
                    "defaultAllow": bound.default_allow(),
                    "displayOrder": bound.display_order(),
                }))
                .timestamp(now_millis()),
        )
        .await?;

        Ok(bound)
    }

    /// Permissions bound to a study, in display order.
    pub async fn bound_permissions(&self, study_id: &StudyId) -> Result<Vec<BoundPermission>> {
        self.read("list_bound_permissions", move || {
            self.store.list_bound_permissions(study_id)
        })
        .await
    }

    /// Archive a study. Archived studies accept no new enrollments or
    /// binding edits.
    pub async fn archive_study(&self, researcher: &UserId, study_id: &StudyId) -> Result<Study> {
        self.transition_study(researcher, study_id, StudyTransition::Archive)
            .await
    }

    /// Return an archived study to ACTIVE.
    pub async fn unarchive_study(&self, researcher: &UserId, study_id: &StudyId) -> Result<Study> {
        self.transition_study(researcher, study_id, StudyTransition::Unarchive)
            .await
    }

    /// Drop a study. Dropping is final.
    pub async fn drop_study(&self, researcher: &UserId, study_id: &StudyId) -> Result<Study> {
        self.transition_study(researcher, study_id, StudyTransition::Drop)
            .await
    }

    async fn transition_study(
        &self,
        researcher: &UserId,
        study_id: &StudyId,
        transition: StudyTransition,
    ) -> Result<Study> {
        let _guard = self.study_locks.lock(study_id.clone()).await;

        let study = self.owned_study(study_id, researcher).await?;
        let next = study.next_status(transition).ok_or_else(|| {
            ConsentError::StudyTransitionRejected {
                study_id: study_id.clone(),
                status: study.status,
            }
        })?;
        self.ensure_chain_open(study_id)?;

        let action = match transition {
            StudyTransition::Archive => AuditAction::StudyArchived,
            StudyTransition::Unarchive => AuditAction::StudyUnarchived,
            StudyTransition::Drop => AuditAction::StudyDropped,
        };
        self.commit(
            RowWrite::StudyStatus {
                study_id: study_id.clone(),
                status: next,
            },
            AuditBuilder::new(study_id.clone(), action)
                .actor(ActorRole::Researcher, researcher.clone())
                .details(json!({ "from": study.status.as_str(), "to": next.as_str() }))
                .timestamp(now_millis()),
        )
        .await?;

        info!(study = %study_id, from = %study.status, to = %next, "study status changed");
        Ok(study.with_status(next))
    }
}
