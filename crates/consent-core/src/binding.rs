//! Per-study customization of catalog permissions.
//!
//! A binding attaches a catalog template to a study and may override the
//! template's defaults. Every override is optional; the effective value falls
//! back to the template.

use serde::{Deserialize, Serialize};

use crate::catalog::PermissionTemplate;
use crate::types::{PermKey, StudyId, TemplateId};

/// A `(study, template)` pair with optional overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyPermissionBinding {
    pub study_id: StudyId,
    pub template_id: TemplateId,
    pub required: Option<bool>,
    pub sensitive: Option<bool>,
    pub default_allow: Option<bool>,
    pub display_order: i32,
}

impl StudyPermissionBinding {
    /// Bind a template with no overrides.
    pub fn new(study_id: StudyId, template_id: TemplateId) -> Self {
        Self {
            study_id,
            template_id,
            required: None,
            sensitive: None,
            default_allow: None,
            display_order: 0,
        }
    }

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

/// A binding resolved against its template.
///
/// This is the view every grant and snapshot computation works from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundPermission {
    pub binding: StudyPermissionBinding,
    pub template: PermissionTemplate,
}

impl BoundPermission {
    pub fn new(binding: StudyPermissionBinding, template: PermissionTemplate) -> Self {
        Self { binding, template }
    }

    pub fn key(&self) -> &PermKey {
        &self.template.slug
    }

    /// Required permissions are implicitly granted and cannot be toggled.
    pub fn is_required(&self) -> bool {
        self.binding.required.unwrap_or(self.template.default_required)
    }

    pub fn default_allow(&self) -> bool {
        self.binding.default_allow.unwrap_or(self.template.default_allow)
    }

    pub fn is_sensitive(&self) -> bool {
        self.binding
            .sensitive
            .unwrap_or_else(|| self.template.pii_level.is_sensitive())
    }

    pub fn display_order(&self) -> i32 {
        self.binding.display_order
    }
}

/// Sort bound permissions for display: by display order, then key.
pub fn sort_for_display(bound: &mut [BoundPermission]) {
    bound.sort_by(|a, b| {
        a.display_order()
            .cmp(&b.display_order())
            .then_with(|| a.key().cmp(b.key()))
    });
}
