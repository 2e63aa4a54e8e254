//! Signed, shareable consent documents.
//!
//! A document is a small logical payload (snapshot, history, diff or
//! receipt) plus a document id: the first 24 hex characters of
//! HMAC-SHA256 over the payload's canonical JSON. Anyone holding the payload
//! and the id can ask the ledger to re-check it; only the holder of the
//! signing secret can mint ids.

use hmac::Mac;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::canonical::canonical_json;
use crate::crypto::{HmacSha256, SigningSecret};
use crate::error::CoreError;
use crate::types::{PermKey, StudyId, UserId, VersionId};

/// Number of signature bytes kept in a document id.
pub const DOC_ID_BYTES: usize = 12;

/// Why a receipt was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptAction {
    Enrolled,
    Withdrawn,
}

impl ReceiptAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "enrolled" => Some(ReceiptAction::Enrolled),
            "withdrawn" => Some(ReceiptAction::Withdrawn),
            _ => None,
        }
    }
}

/// Discriminator of a [`DocumentPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Snapshot,
    History,
    Diff,
    Receipt,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Snapshot => "snapshot",
            DocumentKind::History => "history",
            DocumentKind::Diff => "diff",
            DocumentKind::Receipt => "receipt",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The logical content a document id is computed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DocumentPayload {
    /// One saved version's granted permissions.
    #[serde(rename_all = "camelCase")]
    Snapshot {
        study_id: StudyId,
        participant_id: UserId,
        version_id: VersionId,
        granted: Vec<PermKey>,
    },
    /// Every saved version, newest first.
    #[serde(rename_all = "camelCase")]
    History {
        study_id: StudyId,
        participant_id: UserId,
        versions: Vec<VersionId>,
    },
    /// A comparison between two versions.
    #[serde(rename_all = "camelCase")]
    Diff {
        study_id: StudyId,
        participant_id: UserId,
        from: VersionId,
        to: VersionId,
        added: Vec<PermKey>,
        removed: Vec<PermKey>,
    },
    /// Proof of an enrollment change.
    #[serde(rename_all = "camelCase")]
    Receipt {
        study_id: StudyId,
        participant_id: UserId,
        action: ReceiptAction,
        version_id: Option<VersionId>,
        timestamp: i64,
    },
}

impl DocumentPayload {
    pub fn kind(&self) -> DocumentKind {
        match self {
            DocumentPayload::Snapshot { .. } => DocumentKind::Snapshot,
            DocumentPayload::History { .. } => DocumentKind::History,
            DocumentPayload::Diff { .. } => DocumentKind::Diff,
            DocumentPayload::Receipt { .. } => DocumentKind::Receipt,
        }
    }

    pub fn study_id(&self) -> &StudyId {
        match self {
            DocumentPayload::Snapshot { study_id, .. }
            | DocumentPayload::History { study_id, .. }
            | DocumentPayload::Diff { study_id, .. }
            | DocumentPayload::Receipt { study_id, .. } => study_id,
        }
    }

    pub fn participant_id(&self) -> &UserId {
        match self {
            DocumentPayload::Snapshot { participant_id, .. }
            | DocumentPayload::History { participant_id, .. }
            | DocumentPayload::Diff { participant_id, .. }
            | DocumentPayload::Receipt { participant_id, .. } => participant_id,
        }
    }

    /// Canonical JSON bytes the signature covers.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CoreError> {
        canonical_json(self)
    }
}

/// A 24-character lowercase hex document identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocId([u8; DOC_ID_BYTES]);

impl DocId {
    pub fn as_bytes(&self) -> &[u8; DOC_ID_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a document id. Upper-case hex is accepted.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CoreError::MalformedDocId(s.to_string()))?;
        let arr: [u8; DOC_ID_BYTES] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::MalformedDocId(s.to_string()))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({})", self.to_hex())
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for DocId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DocId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A signed payload ready to hand to a renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedDocument {
    pub payload: DocumentPayload,
    pub doc_id: DocId,
    pub verify_url: String,
}

/// Build `{base}/verify/{docId}`, tolerating a trailing slash on `base`.
pub fn verify_url(base: &str, doc_id: &DocId) -> String {
    format!("{}/verify/{}", base.trim_end_matches('/'), doc_id)
}

/// Mints and checks document ids.
#[derive(Debug, Clone)]
pub struct DocumentSigner {
    secret: SigningSecret,
    verify_base_url: String,
}

impl DocumentSigner {
    pub fn new(secret: SigningSecret, verify_base_url: impl Into<String>) -> Self {
        Self {
            secret,
            verify_base_url: verify_base_url.into(),
        }
    }

    fn mac_over(&self, payload: &DocumentPayload) -> Result<HmacSha256, CoreError> {
        let mut mac = self.secret.mac();
        mac.update(&payload.signing_bytes()?);
        Ok(mac)
    }

    /// Compute the document id for a payload.
    pub fn doc_id(&self, payload: &DocumentPayload) -> Result<DocId, CoreError> {
        let tag = self.mac_over(payload)?.finalize().into_bytes();
        let mut arr = [0u8; DOC_ID_BYTES];
        arr.copy_from_slice(&tag[..DOC_ID_BYTES]);
        Ok(DocId(arr))
    }

    /// Sign a payload.
    pub fn sign(&self, payload: DocumentPayload) -> Result<SignedDocument, CoreError> {
        let doc_id = self.doc_id(&payload)?;
        Ok(SignedDocument {
            verify_url: verify_url(&self.verify_base_url, &doc_id),
            payload,
            doc_id,
        })
    }

    /// Check that `doc_id` was minted for exactly this payload.
    ///
    /// The comparison runs in constant time.
    pub fn verify(&self, doc_id: &DocId, payload: &DocumentPayload) -> Result<bool, CoreError> {
        Ok(self
            .mac_over(payload)?
            .verify_truncated_left(doc_id.as_bytes())
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> DocumentSigner {
        DocumentSigner::new(SigningSecret::from("test-secret"), "https://consent.example/")
    }

    fn snapshot() -> DocumentPayload {
        DocumentPayload::Snapshot {
            study_id: "study-1".into(),
            participant_id: "alice".into(),
            version_id: VersionId::from_bytes([7; 32]),
            granted: vec!["a".into(), "r".into()],
        }
    }

    #[test]
    fn test_payload_wire_shape() {
        let value = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(value["kind"], "snapshot");
        assert_eq!(value["studyId"], "study-1");
        assert_eq!(value["participantId"], "alice");
        assert_eq!(value["versionId"], "07".repeat(32));

        let receipt = DocumentPayload::Receipt {
            study_id: "s".into(),
            participant_id: "u".into(),
            action: ReceiptAction::Withdrawn,
            version_id: None,
            timestamp: 5,
        };
        let value = serde_json::to_value(&receipt).unwrap();
        assert_eq!(value["action"], "withdrawn");
        assert!(value["versionId"].is_null());
        let back: DocumentPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, receipt);
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = signer();
        let doc = signer.sign(snapshot()).unwrap();
        assert_eq!(doc.doc_id.to_hex().len(), 24);
        assert_eq!(doc.verify_url, format!("https://consent.example/verify/{}", doc.doc_id));
        assert!(signer.verify(&doc.doc_id, &doc.payload).unwrap());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let signer = signer();
        assert_eq!(signer.doc_id(&snapshot()).unwrap(), signer.doc_id(&snapshot()).unwrap());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let signer = signer();
        let doc = signer.sign(snapshot()).unwrap();
        let tampered = DocumentPayload::Snapshot {
            study_id: "study-1".into(),
            participant_id: "alice".into(),
            version_id: VersionId::from_bytes([7; 32]),
            granted: vec!["a".into(), "b".into(), "r".into()],
        };
        assert!(!signer.verify(&doc.doc_id, &tampered).unwrap());
    }

    #[test]
    fn test_other_secret_fails() {
        let doc = signer().sign(snapshot()).unwrap();
        let other = DocumentSigner::new(SigningSecret::from("other"), "https://x");
        assert!(!other.verify(&doc.doc_id, &doc.payload).unwrap());
    }

    #[test]
    fn test_doc_id_parsing() {
        let id = DocId::parse("00112233445566778899AABB").unwrap();
        assert_eq!(id.to_hex(), "00112233445566778899aabb");
        assert!(matches!(DocId::parse("xyz"), Err(CoreError::MalformedDocId(_))));
        assert!(matches!(DocId::parse("0011"), Err(CoreError::MalformedDocId(_))));
    }

    #[test]
    fn test_receipt_action_parse() {
        assert_eq!(ReceiptAction::parse("ENROLLED"), Some(ReceiptAction::Enrolled));
        assert_eq!(ReceiptAction::parse("paused"), None);
    }
}
