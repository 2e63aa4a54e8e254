//! Proptest generators for property-based testing.

use proptest::prelude::*;

use consent_core::{
    ActorRole, AuditAction, AuditBuilder, AuditEntry, Blake3Hash, ConsentVersion, DecisionSet,
    EnrollmentId, PermKey, StudyId, UserId,
};
use serde_json::json;

/// Generate a permission key.
pub fn perm_key() -> impl Strategy<Value = PermKey> {
    "[a-z][a-z0-9-]{0,15}".prop_map(PermKey::new)
}

/// Generate a user id.
pub fn user_id() -> impl Strategy<Value = UserId> {
    "[a-z][a-z0-9_]{0,11}".prop_map(UserId::new)
}

/// Generate a decision set of at most `max` keys drawn from a small pool, so
/// independently generated sets overlap.
pub fn decision_set(max: usize) -> impl Strategy<Value = DecisionSet> {
    prop::collection::btree_set(0u8..24, 0..=max).prop_map(|ids| {
        ids.into_iter()
            .map(|i| PermKey::new(format!("perm-{:02}", i)))
            .collect()
    })
}

/// Generate a random EnrollmentId.
pub fn enrollment_id() -> impl Strategy<Value = EnrollmentId> {
    any::<[u8; 32]>().prop_map(EnrollmentId::from_bytes)
}

/// Generate a random Blake3Hash.
pub fn blake3_hash() -> impl Strategy<Value = Blake3Hash> {
    any::<[u8; 32]>().prop_map(Blake3Hash)
}

/// Generate a reasonable timestamp.
pub fn timestamp() -> impl Strategy<Value = i64> {
    0i64..=1_900_000_000_000i64
}

/// Generate an audit action.
pub fn audit_action() -> impl Strategy<Value = AuditAction> {
    prop::sample::select(AuditAction::ALL.to_vec())
}

/// Two versions of the same enrollment.
pub fn version_pair() -> impl Strategy<Value = (ConsentVersion, ConsentVersion)> {
    (enrollment_id(), decision_set(12), decision_set(12), timestamp()).prop_map(
        |(enrollment, a, b, ts)| {
            (
                ConsentVersion::new(enrollment, 1, a, ts),
                ConsentVersion::new(enrollment, 2, b, ts + 1),
            )
        },
    )
}

/// Parameters for one audit entry.
#[derive(Debug, Clone)]
pub struct AuditParams {
    pub actor: Option<UserId>,
    pub action: AuditAction,
    pub timestamp: i64,
    pub detail: u32,
}

impl Arbitrary for AuditParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            prop::option::of(user_id()),
            audit_action(),
            timestamp(),
            any::<u32>(),
        )
            .prop_map(|(actor, action, timestamp, detail)| AuditParams {
                actor,
                action,
                timestamp,
                detail,
            })
            .boxed()
    }
}

/// Link a sequence of entries into one study's chain.
pub fn chain_from_params(study_id: &StudyId, params: &[AuditParams]) -> Vec<AuditEntry> {
    let mut entries: Vec<AuditEntry> = Vec::with_capacity(params.len());
    let mut tail = None;

    for p in params {
        let mut builder = AuditBuilder::new(study_id.clone(), p.action)
            .details(json!({ "n": p.detail }))
            .timestamp(p.timestamp);
        if let Some(actor) = &p.actor {
            builder = builder.actor(ActorRole::Participant, actor.clone());
        }
        let entry = builder.link(tail);
        tail = entry.entry_hash();
        entries.push(entry);
    }

    entries
}
