//! Golden test vectors for deterministic verification.
//!
//! Receipt hashes, document ids and pseudonyms are exchanged with systems
//! outside this workspace, so their exact bytes are pinned here. The
//! expected values were computed independently with a stock SHA-256 /
//! HMAC-SHA256 implementation over the canonical JSON shown in each vector.

use consent_core::{
    pseudonym, receipt_hash, DecisionSet, DocumentPayload, DocumentSigner, PermKey,
    ReceiptAction, SigningSecret, StudyId, UserId, VersionId,
};

/// Secret used by every document vector.
pub const VECTOR_SECRET: &str = "golden-secret";

/// A golden receipt-hash vector.
#[derive(Debug, Clone)]
pub struct ReceiptVector {
    pub name: &'static str,
    pub decisions: &'static [&'static str],
    /// Expected SHA-256 of `{"permissions":[...]}` (hex).
    pub expected_hash: &'static str,
}

/// A golden document-id vector.
#[derive(Debug, Clone)]
pub struct DocumentVector {
    pub name: &'static str,
    pub payload: DocumentPayload,
    /// Canonical JSON the id is computed over.
    pub canonical: &'static str,
    /// Expected 24-character document id.
    pub expected_doc_id: &'static str,
}

/// A golden pseudonym vector.
#[derive(Debug, Clone)]
pub struct PseudonymVector {
    pub study_id: &'static str,
    pub participant_id: &'static str,
    pub expected: &'static str,
}

pub fn receipt_vectors() -> Vec<ReceiptVector> {
    vec![
        ReceiptVector {
            name: "empty decision set",
            decisions: &[],
            expected_hash: "a4475f102675fe599e2e1184f669b9246b7ebe113c351d514e635018a1f53cf8",
        },
        ReceiptVector {
            name: "required only",
            decisions: &["study-participation"],
            expected_hash: "8c40d79743dbe2e801d3c64927aff3ddcb13d3075cbeb11e77e54ac3b45610b0",
        },
        ReceiptVector {
            name: "unsorted input",
            decisions: &["survey-responses", "study-participation", "device-telemetry"],
            expected_hash: "ebc9af6fcc96e7bc53a7ec906e761451499cdbbddf867baa239636dd2b7c198c",
        },
    ]
}

pub fn document_vectors() -> Vec<DocumentVector> {
    let study_id = StudyId::new("sleep-2026");
    let participant_id = UserId::new("alice");
    let v1 = VersionId::from_bytes([0x11; 32]);
    let v2 = VersionId::from_bytes([0x22; 32]);

    vec![
        DocumentVector {
            name: "snapshot",
            payload: DocumentPayload::Snapshot {
                study_id: study_id.clone(),
                participant_id: participant_id.clone(),
                version_id: v1,
                granted: vec!["study-participation".into(), "survey-responses".into()],
            },
            canonical: r#"{"granted":["study-participation","survey-responses"],"kind":"snapshot","participantId":"alice","studyId":"sleep-2026","versionId":"1111111111111111111111111111111111111111111111111111111111111111"}"#,
            expected_doc_id: "e4b971b6cb20ae2ebe4e06d7",
        },
        DocumentVector {
            name: "history",
            payload: DocumentPayload::History {
                study_id: study_id.clone(),
                participant_id: participant_id.clone(),
                versions: vec![v2, v1],
            },
            canonical: r#"{"kind":"history","participantId":"alice","studyId":"sleep-2026","versions":["2222222222222222222222222222222222222222222222222222222222222222","1111111111111111111111111111111111111111111111111111111111111111"]}"#,
            expected_doc_id: "939a1e04e94ea5118bf37e4a",
        },
        DocumentVector {
            name: "diff",
            payload: DocumentPayload::Diff {
                study_id: study_id.clone(),
                participant_id: participant_id.clone(),
                from: v1,
                to: v2,
                added: vec!["device-telemetry".into()],
                removed: vec!["survey-responses".into()],
            },
            canonical: r#"{"added":["device-telemetry"],"from":"1111111111111111111111111111111111111111111111111111111111111111","kind":"diff","participantId":"alice","removed":["survey-responses"],"studyId":"sleep-2026","to":"2222222222222222222222222222222222222222222222222222222222222222"}"#,
            expected_doc_id: "50ca31fd714d494613ddfdeb",
        },
        DocumentVector {
            name: "withdrawal receipt without a version",
            payload: DocumentPayload::Receipt {
                study_id,
                participant_id,
                action: ReceiptAction::Withdrawn,
                version_id: None,
                timestamp: 1_767_225_600_000, // 2026-01-01T00:00:00Z
            },
            canonical: r#"{"action":"withdrawn","kind":"receipt","participantId":"alice","studyId":"sleep-2026","timestamp":1767225600000,"versionId":null}"#,
            expected_doc_id: "7b575e06b8635373a53df566",
        },
    ]
}

pub fn pseudonym_vectors() -> Vec<PseudonymVector> {
    vec![
        PseudonymVector {
            study_id: "sleep-2026",
            participant_id: "alice",
            expected: "ps_025eaa85c0",
        },
        PseudonymVector {
            study_id: "sleep-2026",
            participant_id: "bob",
            expected: "ps_60dcec28bc",
        },
    ]
}

/// Signer keyed with [`VECTOR_SECRET`].
pub fn vector_signer() -> DocumentSigner {
    DocumentSigner::new(SigningSecret::from(VECTOR_SECRET), "https://consent.test")
}

/// Check every vector, returning `(name, ok)` pairs.
pub fn verify_all_vectors() -> Vec<(&'static str, bool)> {
    let mut results = Vec::new();

    for v in receipt_vectors() {
        let decisions: DecisionSet = v.decisions.iter().map(|s| PermKey::new(*s)).collect();
        results.push((v.name, receipt_hash(&decisions).to_hex() == v.expected_hash));
    }

    let signer = vector_signer();
    for v in document_vectors() {
        let ok = matches!(
            signer.doc_id(&v.payload),
            Ok(id) if id.to_hex() == v.expected_doc_id
        );
        results.push((v.name, ok));
    }

    for v in pseudonym_vectors() {
        let actual = pseudonym(&StudyId::new(v.study_id), &UserId::new(v.participant_id));
        results.push((v.participant_id, actual == v.expected));
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_vectors() {
        for v in receipt_vectors() {
            let decisions: DecisionSet = v.decisions.iter().map(|s| PermKey::new(*s)).collect();
            assert_eq!(receipt_hash(&decisions).to_hex(), v.expected_hash, "{}", v.name);
        }
    }

    #[test]
    fn test_document_canonical_bytes() {
        for v in document_vectors() {
            let bytes = v.payload.signing_bytes().unwrap();
            assert_eq!(String::from_utf8(bytes).unwrap(), v.canonical, "{}", v.name);
        }
    }

    #[test]
    fn test_document_ids() {
        let signer = vector_signer();
        for v in document_vectors() {
            let id = signer.doc_id(&v.payload).unwrap();
            assert_eq!(id.to_hex(), v.expected_doc_id, "{}", v.name);
            assert!(signer.verify(&id, &v.payload).unwrap());
        }
    }

    #[test]
    fn test_pseudonym_vectors() {
        for v in pseudonym_vectors() {
            let actual = pseudonym(&StudyId::new(v.study_id), &UserId::new(v.participant_id));
            assert_eq!(actual, v.expected);
        }
    }

    #[test]
    fn test_all_vectors_pass() {
        let results = verify_all_vectors();
        assert!(results.iter().all(|(_, ok)| *ok), "{:?}", results);
    }
}
