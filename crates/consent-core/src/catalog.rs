//! Permission catalog: canonical templates for shareable data categories.
//!
//! Templates are created once (builtin seeding or a researcher's custom
//! definition) and never deleted, because historical grants and consent
//! versions refer to them by slug.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{PermKey, TemplateId};

/// Sensitivity classification of a permission's underlying data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PiiLevel {
    None,
    Pseudonymous,
    Identifiable,
}

impl PiiLevel {
    /// Data at this level counts as sensitive by default.
    pub fn is_sensitive(self) -> bool {
        !matches!(self, PiiLevel::None)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PiiLevel::None => "NONE",
            PiiLevel::Pseudonymous => "PSEUDONYMOUS",
            PiiLevel::Identifiable => "IDENTIFIABLE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NONE" => Some(PiiLevel::None),
            "PSEUDONYMOUS" => Some(PiiLevel::Pseudonymous),
            "IDENTIFIABLE" => Some(PiiLevel::Identifiable),
            _ => None,
        }
    }
}

impl fmt::Display for PiiLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a template came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionSource {
    Builtin,
    Custom,
}

impl PermissionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionSource::Builtin => "BUILTIN",
            PermissionSource::Custom => "CUSTOM",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BUILTIN" => Some(PermissionSource::Builtin),
            "CUSTOM" => Some(PermissionSource::Custom),
            _ => None,
        }
    }
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionTemplate {
    /// Derived from the slug; see [`TemplateId::derive`].
    pub id: TemplateId,
    /// Unique, human-stable key.
    pub slug: PermKey,
    pub title: String,
    pub description: String,
    pub category: String,
    pub pii_level: PiiLevel,
    pub default_required: bool,
    pub default_allow: bool,
    pub source: PermissionSource,
}

impl PermissionTemplate {
    /// Start a custom template definition.
    pub fn custom(slug: impl Into<PermKey>, title: impl Into<String>) -> Self {
        Self::new(slug.into(), title.into(), PermissionSource::Custom)
    }

    /// Start a builtin template definition.
    pub fn builtin(slug: impl Into<PermKey>, title: impl Into<String>) -> Self {
        Self::new(slug.into(), title.into(), PermissionSource::Builtin)
    }

    fn new(slug: PermKey, title: String, source: PermissionSource) -> Self {
        Self {
            id: TemplateId::derive(&slug),
            slug,
            title,
            description: String::new(),
            category: "general".to_string(),
            pii_level: PiiLevel::None,
            default_required: false,
            default_allow: false,
            source,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn pii_level(mut self, level: PiiLevel) -> Self {
        self.pii_level = level;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.default_required = required;
        self
    }

    pub fn allow_by_default(mut self, allow: bool) -> Self {
        self.default_allow = allow;
        self
    }

    /// Whether the id still matches the slug it was derived from.
    pub fn is_consistent(&self) -> bool {
        self.id == TemplateId::derive(&self.slug)
    }
}

/// The templates every deployment starts with.
pub fn builtin_catalog() -> Vec<PermissionTemplate> {
    vec![
        PermissionTemplate::builtin("study-participation", "Study participation")
            .description("Record that you take part in this study and store your responses.")
            .category("core")
            .pii_level(PiiLevel::Pseudonymous)
            .required(true)
            .allow_by_default(true),
        PermissionTemplate::builtin("survey-responses", "Survey responses")
            .description("Answers you give to questionnaires during the study.")
            .category("self-report")
            .pii_level(PiiLevel::Pseudonymous)
            .allow_by_default(true),
        PermissionTemplate::builtin("demographics", "Demographics")
            .description("Age range, gender and region.")
            .category("self-report")
            .pii_level(PiiLevel::Pseudonymous),
        PermissionTemplate::builtin("contact-info", "Contact information")
            .description("Email address for follow-up questions.")
            .category("contact")
            .pii_level(PiiLevel::Identifiable),
        PermissionTemplate::builtin("health-records", "Health records")
            .description("Clinical records shared from a connected provider.")
            .category("clinical")
            .pii_level(PiiLevel::Identifiable),
        PermissionTemplate::builtin("device-telemetry", "Device telemetry")
            .description("Step counts and sensor readings from a paired device.")
            .category("sensor")
            .pii_level(PiiLevel::Pseudonymous),
        PermissionTemplate::builtin("aggregate-publication", "Aggregate publication")
            .description("Use of anonymised aggregate results in publications.")
            .category("publication")
            .allow_by_default(true),
        PermissionTemplate::builtin("future-contact", "Future studies")
            .description("Invitations to related studies.")
            .category("contact")
            .pii_level(PiiLevel::Identifiable),
    ]
}
