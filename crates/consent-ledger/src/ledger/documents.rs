use consent_core::{
    diff, ConsentVersion, DocId, DocumentPayload, Enrollment, EnrollmentId, ReceiptAction,
    SignedDocument, StudyId, UserId, VersionId, VersionSelector,
};
use consent_store::Store;
use tracing::{debug, info, warn};

use super::{now_millis, ConsentLedger};
use crate::error::{ConsentError, Result};

/// What to sign. The ledger fills in the referenced content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentRequest {
    /// One version's granted permissions; the newest when `version` is `None`.
    Snapshot {
        study_id: StudyId,
        participant_id: UserId,
        version: Option<VersionSelector>,
    },
    /// Every saved version, newest first.
    History {
        study_id: StudyId,
        participant_id: UserId,
    },
    /// A comparison between two versions.
    Diff {
        study_id: StudyId,
        participant_id: UserId,
        from: VersionSelector,
        to: VersionSelector,
    },
    /// Proof of the participant's last enrollment change.
    Receipt {
        study_id: StudyId,
        participant_id: UserId,
        action: ReceiptAction,
    },
}

impl DocumentRequest {
    fn subject(&self) -> (&StudyId, &UserId) {
        match self {
            DocumentRequest::Snapshot {
                study_id,
                participant_id,
                ..
            }
            | DocumentRequest::History {
                study_id,
                participant_id,
            }
            | DocumentRequest::Diff {
                study_id,
                participant_id,
                ..
            }
            | DocumentRequest::Receipt {
                study_id,
                participant_id,
                ..
            } => (study_id, participant_id),
        }
    }
}

/// Outcome of checking a presented document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The id was minted for this payload and the payload still matches the
    /// ledger.
    Verified,
    /// The id was minted for this payload, but the ledger has moved on.
    Stale { reason: String },
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified)
    }

    fn stale(reason: &str) -> Self {
        Verification::Stale {
            reason: reason.to_string(),
        }
    }
}

impl<S: Store> ConsentLedger<S> {
    // ─────────────────────────────────────────────────────────────────────────
    // Signed Documents
    // ─────────────────────────────────────────────────────────────────────────

    /// Build and sign a document.
    ///
    /// The participant must have an enrollment row. When a snapshot, history
    /// or receipt needs a version and none exists yet, an ENROLLED
    /// participant's current decisions are saved first.
    pub async fn sign_document(&self, request: DocumentRequest) -> Result<SignedDocument> {
        let (study_id, participant_id) = request.subject();
        let enrollment = self
            .enrollment(study_id, participant_id)
            .await?
            .ok_or(ConsentError::NotEnrolled)?;

        let payload = match &request {
            DocumentRequest::Snapshot { version, .. } => {
                let version = match version {
                    Some(selector) => self.get_version(&enrollment.id, *selector).await?,
                    None => self
                        .latest_or_implicit(&enrollment)
                        .await?
                        .ok_or(ConsentError::VersionNotFound)?,
                };
                DocumentPayload::Snapshot {
                    study_id: study_id.clone(),
                    participant_id: participant_id.clone(),
                    version_id: version.id,
                    granted: version.decisions.to_vec(),
                }
            }
            DocumentRequest::History { .. } => {
                self.latest_or_implicit(&enrollment).await?;
                DocumentPayload::History {
                    study_id: study_id.clone(),
                    participant_id: participant_id.clone(),
                    versions: self.version_ids(&enrollment.id).await?,
                }
            }
            DocumentRequest::Diff { from, to, .. } => {
                let from = self.get_version(&enrollment.id, *from).await?;
                let to = self.get_version(&enrollment.id, *to).await?;
                let d = diff(&from, &to)?;
                DocumentPayload::Diff {
                    study_id: study_id.clone(),
                    participant_id: participant_id.clone(),
                    from: from.id,
                    to: to.id,
                    added: d.added,
                    removed: d.removed,
                }
            }
            DocumentRequest::Receipt { action, .. } => {
                let version_id = self.latest_or_implicit(&enrollment).await?.map(|v| v.id);
                DocumentPayload::Receipt {
                    study_id: study_id.clone(),
                    participant_id: participant_id.clone(),
                    action: *action,
                    version_id,
                    timestamp: receipt_timestamp(&enrollment, *action).unwrap_or_else(now_millis),
                }
            }
        };

        let signed = self.signer.sign(payload)?;
        info!(
            study = %study_id,
            kind = signed.payload.kind().as_str(),
            doc_id = %signed.doc_id,
            "signed document"
        );
        Ok(signed)
    }

    /// Check a presented document against its id and the current ledger.
    ///
    /// Fails with `MalformedDocId` if the id is not 24 hex characters and
    /// with `SignatureMismatch` if it was not minted for this payload. A
    /// genuine document whose content no longer matches the ledger is
    /// reported as [`Verification::Stale`].
    pub async fn verify_document(
        &self,
        doc_id: &str,
        payload: &DocumentPayload,
    ) -> Result<Verification> {
        let doc_id = DocId::parse(doc_id)?;
        if !self.signer.verify(&doc_id, payload)? {
            warn!(doc_id = %doc_id, kind = payload.kind().as_str(), "document signature mismatch");
            return Err(ConsentError::SignatureMismatch);
        }

        let verification = self.rederive(payload).await?;
        debug!(doc_id = %doc_id, ?verification, "document verified");
        Ok(verification)
    }

    async fn rederive(&self, payload: &DocumentPayload) -> Result<Verification> {
        let enrollment_id = EnrollmentId::derive(payload.study_id(), payload.participant_id());

        let verification = match payload {
            DocumentPayload::Snapshot {
                version_id,
                granted,
                ..
            } => match self.find_version(&enrollment_id, *version_id).await? {
                None => Verification::stale("version no longer exists"),
                Some(v) if v.decisions.to_vec() != *granted => {
                    Verification::stale("granted permissions differ from the saved version")
                }
                Some(_) => Verification::Verified,
            },
            DocumentPayload::History { versions, .. } => {
                if self.version_ids(&enrollment_id).await? != *versions {
                    Verification::stale("newer versions have been saved")
                } else {
                    Verification::Verified
                }
            }
            DocumentPayload::Diff {
                from,
                to,
                added,
                removed,
                ..
            } => {
                let from = self.find_version(&enrollment_id, *from).await?;
                let to = self.find_version(&enrollment_id, *to).await?;
                match (from, to) {
                    (Some(from), Some(to)) => {
                        let d = diff(&from, &to)?;
                        if d.added == *added && d.removed == *removed {
                            Verification::Verified
                        } else {
                            Verification::stale("compared versions no longer match")
                        }
                    }
                    _ => Verification::stale("compared versions no longer exist"),
                }
            }
            DocumentPayload::Receipt {
                action,
                version_id,
                timestamp,
                ..
            } => {
                let enrollment = self
                    .enrollment(payload.study_id(), payload.participant_id())
                    .await?;
                let version_exists = match version_id {
                    Some(id) => self.find_version(&enrollment_id, *id).await?.is_some(),
                    None => true,
                };
                match enrollment {
                    Some(e)
                        if version_exists
                            && receipt_timestamp(&e, *action) == Some(*timestamp) =>
                    {
                        Verification::Verified
                    }
                    _ => Verification::stale("enrollment has changed since this receipt"),
                }
            }
        };

        Ok(verification)
    }

    /// Newest version, saving one first if none exists and the participant
    /// is ENROLLED.
    async fn latest_or_implicit(
        &self,
        enrollment: &Enrollment,
    ) -> Result<Option<ConsentVersion>> {
        if let Some(latest) = self.latest_version(&enrollment.id).await? {
            return Ok(Some(latest));
        }
        if !enrollment.is_active() {
            return Ok(None);
        }
        info!(enrollment = %enrollment.id.to_hex(), "saving implicit snapshot for document");
        Ok(Some(self.save_version(&enrollment.id, None).await?))
    }

    async fn find_version(
        &self,
        enrollment_id: &EnrollmentId,
        id: VersionId,
    ) -> Result<Option<ConsentVersion>> {
        match self.get_version(enrollment_id, id).await {
            Ok(v) => Ok(Some(v)),
            Err(ConsentError::VersionNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn version_ids(&self, enrollment_id: &EnrollmentId) -> Result<Vec<VersionId>> {
        Ok(self
            .list_versions(enrollment_id)
            .await?
            .into_iter()
            .map(|v| v.id)
            .collect())
    }
}

/// When the enrollment change a receipt proves took place.
fn receipt_timestamp(enrollment: &Enrollment, action: ReceiptAction) -> Option<i64> {
    match action {
        ReceiptAction::Enrolled => enrollment.joined_at,
        ReceiptAction::Withdrawn => enrollment.left_at,
    }
}
