use consent_core::{
    builtin_catalog, ActorRole, AuditAction, AuditBuilder, PermKey, PermissionSource,
    PermissionTemplate, StudyId, TemplateId, UserId,
};
use consent_store::{InsertResult, RowWrite, Store};
use serde_json::json;
use tracing::info;

use super::{now_millis, ConsentLedger};
use crate::error::{ConsentError, Result};

impl<S: Store> ConsentLedger<S> {
    // ─────────────────────────────────────────────────────────────────────────
    // Permission Catalog
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert the builtin templates that are not yet present.
    ///
    /// Idempotent; returns how many templates were new.
    pub async fn seed_catalog(&self) -> Result<usize> {
        let mut inserted = 0;
        for template in builtin_catalog() {
            if self.store.insert_template(&template).await? == InsertResult::Inserted {
                inserted += 1;
            }
        }
        info!(inserted, "seeded permission catalog");
        Ok(inserted)
    }

    /// Define a researcher template in the context of one of their studies.
    ///
    /// The template is stored as CUSTOM with an id derived from its slug.
    pub async fn define_permission(
        &self,
        researcher: &UserId,
        study_id: &StudyId,
        mut template: PermissionTemplate,
    ) -> Result<PermissionTemplate> {
        self.owned_study(study_id, researcher).await?;
        self.ensure_chain_open(study_id)?;

        template.source = PermissionSource::Custom;
        template.id = TemplateId::derive(&template.slug);

        let defined = self
            .commit(
                RowWrite::Template(template.clone()),
                AuditBuilder::new(study_id.clone(), AuditAction::PermissionDefined)
                    .actor(ActorRole::Researcher, researcher.clone())
                    .details(json!({
                        "permKey": template.slug.as_str(),
                        "title": template.title,
                        "piiLevel": template.pii_level.as_str(),
                    }))
                    .timestamp(now_millis()),
            )
            .await?;
        if defined.is_none() {
            return Err(ConsentError::PermissionExists(template.slug));
        }

        Ok(template)
    }

    /// Replace a CUSTOM template's description.
    ///
    /// Descriptions are not part of any snapshot, so past versions are
    /// unaffected. Builtin templates are read-only.
    pub async fn update_permission_description(
        &self,
        slug: &PermKey,
        description: &str,
    ) -> Result<PermissionTemplate> {
        let mut template = self
            .template(slug)
            .await?
            .ok_or_else(|| ConsentError::PermissionNotFound(slug.clone()))?;

        if template.source == PermissionSource::Builtin {
            return Err(ConsentError::NotAuthorized(format!(
                "builtin permission {} is read-only",
                slug
            )));
        }

        if !self.store.update_template_description(slug, description).await? {
            return Err(ConsentError::PermissionNotFound(slug.clone()));
        }
        info!(slug = %slug, "updated permission description");

        template.description = description.to_string();
        Ok(template)
    }

    /// Get a template by slug.
    pub async fn template(&self, slug: &PermKey) -> Result<Option<PermissionTemplate>> {
        self.read("get_template", move || self.store.get_template(slug))
            .await
    }

    /// All templates, ordered by slug.
    pub async fn catalog(&self) -> Result<Vec<PermissionTemplate>> {
        self.read("list_templates", move || self.store.list_templates())
            .await
    }
}
