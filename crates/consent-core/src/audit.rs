//! Tamper-evident audit chain.
//!
//! Every consent-affecting action is recorded as an [`AuditEntry`]. Entries of
//! one study form a hash chain:
//!
//! ```text
//! entry_hash = BLAKE3("consent-audit-v0:" || prev_hash_or_zero || canonical(body))
//! ```
//!
//! where `body` covers the action, actor, role, study, timestamp, details and
//! the previous hash. System-originated entries may be recorded detached: they
//! carry no hashes and are skipped by [`verify_chain`], but still occupy an
//! index in the log.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::canonical::canonical_value_bytes;
use crate::crypto::Blake3Hash;
use crate::error::ChainError;
use crate::types::{StudyId, UserId};

/// Domain prefix for entry hashes.
const ENTRY_DOMAIN: &[u8] = b"consent-audit-v0:";

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Enroll,
    Unenroll,
    Invite,
    EnrollmentCompleted,
    PermissionChanged,
    PermissionBound,
    PermissionDefined,
    VersionSaved,
    StudyArchived,
    StudyUnarchived,
    StudyDropped,
    RetentionPurge,
    RoleGranted,
}

impl AuditAction {
    pub const ALL: [AuditAction; 13] = [
        AuditAction::Enroll,
        AuditAction::Unenroll,
        AuditAction::Invite,
        AuditAction::EnrollmentCompleted,
        AuditAction::PermissionChanged,
        AuditAction::PermissionBound,
        AuditAction::PermissionDefined,
        AuditAction::VersionSaved,
        AuditAction::StudyArchived,
        AuditAction::StudyUnarchived,
        AuditAction::StudyDropped,
        AuditAction::RetentionPurge,
        AuditAction::RoleGranted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Enroll => "ENROLL",
            AuditAction::Unenroll => "UNENROLL",
            AuditAction::Invite => "INVITE",
            AuditAction::EnrollmentCompleted => "ENROLLMENT_COMPLETED",
            AuditAction::PermissionChanged => "PERMISSION_CHANGED",
            AuditAction::PermissionBound => "PERMISSION_BOUND",
            AuditAction::PermissionDefined => "PERMISSION_DEFINED",
            AuditAction::VersionSaved => "VERSION_SAVED",
            AuditAction::StudyArchived => "STUDY_ARCHIVED",
            AuditAction::StudyUnarchived => "STUDY_UNARCHIVED",
            AuditAction::StudyDropped => "STUDY_DROPPED",
            AuditAction::RetentionPurge => "RETENTION_PURGE",
            AuditAction::RoleGranted => "ROLE_GRANTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == value)
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The capacity in which the actor acted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Participant,
    Researcher,
    Admin,
    System,
}

impl ActorRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorRole::Participant => "participant",
            ActorRole::Researcher => "researcher",
            ActorRole::Admin => "admin",
            ActorRole::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "participant" => Some(ActorRole::Participant),
            "researcher" => Some(ActorRole::Researcher),
            "admin" => Some(ActorRole::Admin),
            "system" => Some(ActorRole::System),
            _ => None,
        }
    }
}

/// Who acted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Actor {
    User(UserId),
    System,
}

impl Actor {
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Actor::User(id) => Some(id),
            Actor::System => None,
        }
    }

    pub fn from_user_id(id: Option<UserId>) -> Self {
        id.map_or(Actor::System, Actor::User)
    }
}

/// Position of an entry relative to the hash chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ChainLink {
    /// Hash-linked to the previous linked entry (or the genesis sentinel).
    Linked {
        prev_hash: Option<Blake3Hash>,
        entry_hash: Blake3Hash,
    },
    /// Recorded out-of-band, without hashes.
    Detached,
}

impl ChainLink {
    pub fn entry_hash(&self) -> Option<Blake3Hash> {
        match self {
            ChainLink::Linked { entry_hash, .. } => Some(*entry_hash),
            ChainLink::Detached => None,
        }
    }

    pub fn prev_hash(&self) -> Option<Blake3Hash> {
        match self {
            ChainLink::Linked { prev_hash, .. } => *prev_hash,
            ChainLink::Detached => None,
        }
    }

    pub fn is_linked(&self) -> bool {
        matches!(self, ChainLink::Linked { .. })
    }
}

/// A recorded audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub study_id: StudyId,
    pub actor_role: ActorRole,
    pub actor: Actor,
    pub action: AuditAction,
    pub details: Value,
    pub created_at: i64,
    pub link: ChainLink,
}

impl AuditEntry {
    /// Recompute the hash this entry should carry given `prev_hash`.
    pub fn compute_hash(&self, prev_hash: Option<&Blake3Hash>) -> Blake3Hash {
        compute_entry_hash(
            &self.study_id,
            self.actor_role,
            &self.actor,
            self.action,
            &self.details,
            self.created_at,
            prev_hash,
        )
    }

    pub fn entry_hash(&self) -> Option<Blake3Hash> {
        self.link.entry_hash()
    }

    pub fn prev_hash(&self) -> Option<Blake3Hash> {
        self.link.prev_hash()
    }
}

/// Hash an entry body chained onto `prev_hash`.
pub fn compute_entry_hash(
    study_id: &StudyId,
    actor_role: ActorRole,
    actor: &Actor,
    action: AuditAction,
    details: &Value,
    created_at: i64,
    prev_hash: Option<&Blake3Hash>,
) -> Blake3Hash {
    let body = json!({
        "action": action.as_str(),
        "actor": actor.user_id().map(UserId::as_str),
        "actorRole": actor_role.as_str(),
        "createdAt": created_at,
        "details": details,
        "prevHash": prev_hash.map(Blake3Hash::to_hex),
        "studyId": study_id.as_str(),
    });

    let mut hasher = blake3::Hasher::new();
    hasher.update(ENTRY_DOMAIN);
    hasher.update(prev_hash.unwrap_or(&Blake3Hash::ZERO).as_bytes());
    hasher.update(&canonical_value_bytes(&body));
    Blake3Hash::from_bytes(*hasher.finalize().as_bytes())
}

/// Builder for audit entries.
#[derive(Debug, Clone)]
pub struct AuditBuilder {
    study_id: StudyId,
    action: AuditAction,
    actor_role: ActorRole,
    actor: Actor,
    details: Value,
    created_at: i64,
}

impl AuditBuilder {
    /// Start an entry for `action` in `study_id`, attributed to the system.
    pub fn new(study_id: StudyId, action: AuditAction) -> Self {
        Self {
            study_id,
            action,
            actor_role: ActorRole::System,
            actor: Actor::System,
            details: Value::Object(Default::default()),
            created_at: 0,
        }
    }

    /// Attribute the entry to a user acting in `role`.
    pub fn actor(mut self, role: ActorRole, user: UserId) -> Self {
        self.actor_role = role;
        self.actor = Actor::User(user);
        self
    }

    /// Set the role without naming a user.
    pub fn role(mut self, role: ActorRole) -> Self {
        self.actor_role = role;
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn timestamp(mut self, ts: i64) -> Self {
        self.created_at = ts;
        self
    }

    pub fn study_id(&self) -> &StudyId {
        &self.study_id
    }

    pub fn action(&self) -> AuditAction {
        self.action
    }

    /// Link the entry onto the chain tail.
    pub fn link(self, prev_hash: Option<Blake3Hash>) -> AuditEntry {
        let entry_hash = compute_entry_hash(
            &self.study_id,
            self.actor_role,
            &self.actor,
            self.action,
            &self.details,
            self.created_at,
            prev_hash.as_ref(),
        );
        self.finish(ChainLink::Linked {
            prev_hash,
            entry_hash,
        })
    }

    /// Record the entry out-of-band.
    pub fn detach(self) -> AuditEntry {
        self.finish(ChainLink::Detached)
    }

    fn finish(self, link: ChainLink) -> AuditEntry {
        AuditEntry {
            study_id: self.study_id,
            actor_role: self.actor_role,
            actor: self.actor,
            action: self.action,
            details: self.details,
            created_at: self.created_at,
            link,
        }
    }
}

/// Hash of the last linked entry, if any.
pub fn chain_tail(entries: &[AuditEntry]) -> Option<Blake3Hash> {
    entries.iter().rev().find_map(AuditEntry::entry_hash)
}

/// Verify a chain in order.
///
/// Returns the number of linked entries checked. Fails at the index of the
/// first entry whose `prev_hash` does not point at the preceding linked entry,
/// or whose stored hash differs from the recomputed one.
pub fn verify_chain(entries: &[AuditEntry]) -> Result<usize, ChainError> {
    let mut tail: Option<Blake3Hash> = None;
    let mut checked = 0;

    for (index, entry) in entries.iter().enumerate() {
        let (prev_hash, entry_hash) = match entry.link {
            ChainLink::Linked {
                prev_hash,
                entry_hash,
            } => (prev_hash, entry_hash),
            ChainLink::Detached => continue,
        };

        if prev_hash != tail {
            return Err(ChainError::Broken {
                at: index,
                expected: tail,
                actual: prev_hash,
            });
        }

        let recomputed = entry.compute_hash(prev_hash.as_ref());
        if recomputed != entry_hash {
            return Err(ChainError::Broken {
                at: index,
                expected: Some(recomputed),
                actual: Some(entry_hash),
            });
        }

        tail = Some(entry_hash);
        checked += 1;
    }

    Ok(checked)
}
