use std::collections::HashMap;

use consent_core::{
    pseudonym, ActorRole, AuditAction, Blake3Hash, EnrollmentId, EnrollmentStatus, PermKey,
    Sha256Hash, Study, StudyId, UserId, VersionId,
};
use consent_store::Store;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::ConsentLedger;
use crate::error::{ConsentError, Result};

/// Export switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Replace participant ids with stable per-study pseudonyms.
    pub pseudonymize: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRow {
    pub enrollment_id: EnrollmentId,
    pub participant_id: String,
    pub status: EnrollmentStatus,
    pub joined_at: Option<i64>,
    pub left_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRow {
    pub participant_id: String,
    pub permission_slug: PermKey,
    pub title: String,
    pub required: bool,
    pub sensitive: bool,
    pub granted: bool,
    pub granted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRow {
    pub consent_id: VersionId,
    pub enrollment_id: EnrollmentId,
    pub participant_id: Option<String>,
    pub version: u32,
    pub created_at: i64,
    pub receipt_hash: Sha256Hash,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub index: u64,
    pub action: AuditAction,
    pub actor_role: ActorRole,
    pub actor_id: Option<String>,
    pub created_at: i64,
    pub details: Value,
    pub entry_hash: Option<Blake3Hash>,
}

/// Read-only snapshot of everything recorded for a study.
#[derive(Debug, Clone, PartialEq)]
pub struct StudyExport {
    pub study: Study,
    pub participants: Vec<ParticipantRow>,
    pub permissions: Vec<PermissionRow>,
    pub ledger: Vec<LedgerRow>,
    pub events: Vec<EventRow>,
}

impl StudyExport {
    /// Each table as newline-delimited JSON, keyed by file stem.
    pub fn to_ndjson(&self) -> Result<Vec<(&'static str, String)>> {
        Ok(vec![
            ("participants", to_ndjson(&self.participants)?),
            ("permissions", to_ndjson(&self.permissions)?),
            ("consent_ledger", to_ndjson(&self.ledger)?),
            ("events", to_ndjson(&self.events)?),
        ])
    }
}

/// One JSON object per line, each line terminated by `\n`.
pub fn to_ndjson<T: Serialize>(rows: &[T]) -> Result<String> {
    let mut out = String::new();
    for row in rows {
        let line = serde_json::to_string(row).map_err(|e| ConsentError::Encoding(e.to_string()))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

impl<S: Store> ConsentLedger<S> {
    // ─────────────────────────────────────────────────────────────────────────
    // Export
    // ─────────────────────────────────────────────────────────────────────────

    /// Export a study's participants, grants, consent versions and audit
    /// events. Owner-only; writes nothing.
    pub async fn export_study(
        &self,
        researcher: &UserId,
        study_id: &StudyId,
        options: ExportOptions,
    ) -> Result<StudyExport> {
        let study = self.owned_study(study_id, researcher).await?;

        let enrollments = self.enrollments(study_id).await?;
        let bound = self.bound_permissions(study_id).await?;
        let grants = self
            .read("list_study_grants", move || self.store.list_study_grants(study_id))
            .await?;
        let versions = self
            .read("list_study_versions", move || {
                self.store.list_study_versions(study_id)
            })
            .await?;
        let entries = self.audit_log(study_id).await?;

        let label = |user: &UserId| -> String {
            if options.pseudonymize {
                pseudonym(study_id, user)
            } else {
                user.to_string()
            }
        };

        let participants: Vec<ParticipantRow> = enrollments
            .iter()
            .map(|e| ParticipantRow {
                enrollment_id: e.id,
                participant_id: label(&e.participant_id),
                status: e.status,
                joined_at: e.joined_at,
                left_at: e.left_at,
            })
            .collect();

        let by_key: HashMap<&PermKey, _> = bound.iter().map(|p| (p.key(), p)).collect();
        let permissions: Vec<PermissionRow> = grants
            .iter()
            .map(|g| {
                let link = by_key.get(&g.perm_key);
                PermissionRow {
                    participant_id: label(&g.user_id),
                    permission_slug: g.perm_key.clone(),
                    title: link
                        .map(|p| p.template.title.clone())
                        .unwrap_or_else(|| g.perm_key.to_string()),
                    required: link.is_some_and(|p| p.is_required()),
                    sensitive: link.is_some_and(|p| p.is_sensitive()),
                    granted: g.granted,
                    granted_at: g.updated_at,
                }
            })
            .collect();

        let owners: HashMap<EnrollmentId, &UserId> = enrollments
            .iter()
            .map(|e| (e.id, &e.participant_id))
            .collect();
        let ledger: Vec<LedgerRow> = versions
            .iter()
            .map(|v| LedgerRow {
                consent_id: v.id,
                enrollment_id: v.enrollment_id,
                participant_id: owners.get(&v.enrollment_id).map(|u| label(u)),
                version: v.version,
                created_at: v.created_at,
                receipt_hash: v.receipt_hash,
            })
            .collect();

        let events: Vec<EventRow> = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| EventRow {
                index: index as u64,
                action: entry.action,
                actor_role: entry.actor_role,
                actor_id: entry.actor.user_id().map(|u| {
                    if entry.actor_role == ActorRole::Participant {
                        label(u)
                    } else {
                        u.to_string()
                    }
                }),
                created_at: entry.created_at,
                details: entry.details.clone(),
                entry_hash: entry.entry_hash(),
            })
            .collect();

        info!(
            study = %study_id,
            participants = participants.len(),
            versions = ledger.len(),
            events = events.len(),
            "exported study"
        );

        Ok(StudyExport {
            study,
            participants,
            permissions,
            ledger,
            events,
        })
    }
}
