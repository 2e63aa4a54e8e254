//! Study records and their lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{StudyId, UserId};

/// Lifecycle state of a study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StudyStatus {
    Draft,
    Recruiting,
    Active,
    Completed,
    Archived,
    Dropped,
}

impl StudyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StudyStatus::Draft => "DRAFT",
            StudyStatus::Recruiting => "RECRUITING",
            StudyStatus::Active => "ACTIVE",
            StudyStatus::Completed => "COMPLETED",
            StudyStatus::Archived => "ARCHIVED",
            StudyStatus::Dropped => "DROPPED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DRAFT" => Some(StudyStatus::Draft),
            "RECRUITING" => Some(StudyStatus::Recruiting),
            "ACTIVE" => Some(StudyStatus::Active),
            "COMPLETED" => Some(StudyStatus::Completed),
            "ARCHIVED" => Some(StudyStatus::Archived),
            "DROPPED" => Some(StudyStatus::Dropped),
            _ => None,
        }
    }

    /// Archived and dropped studies are closed to new enrollments and
    /// binding edits.
    pub fn is_closed(self) -> bool {
        matches!(self, StudyStatus::Archived | StudyStatus::Dropped)
    }
}

impl fmt::Display for StudyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner-initiated lifecycle changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyTransition {
    Archive,
    Unarchive,
    Drop,
}

/// A study registered with the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Study {
    pub id: StudyId,
    pub owner_id: UserId,
    pub title: String,
    pub status: StudyStatus,
}

impl Study {
    pub fn new(id: impl Into<StudyId>, owner_id: impl Into<UserId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            title: title.into(),
            status: StudyStatus::Draft,
        }
    }

    pub fn with_status(mut self, status: StudyStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_owned_by(&self, user: &UserId) -> bool {
        &self.owner_id == user
    }

    /// Bindings may only be edited while the study is open.
    pub fn bindings_mutable(&self) -> bool {
        !self.status.is_closed()
    }

    /// Compute the status after `transition`.
    ///
    /// Returns `None` when the transition does not apply: archiving a closed
    /// study, unarchiving a study that is not archived, or dropping a study
    /// that is already dropped. Unarchived studies return to ACTIVE.
    pub fn next_status(&self, transition: StudyTransition) -> Option<StudyStatus> {
        match (transition, self.status) {
            (StudyTransition::Archive, s) if !s.is_closed() => Some(StudyStatus::Archived),
            (StudyTransition::Unarchive, StudyStatus::Archived) => Some(StudyStatus::Active),
            (StudyTransition::Drop, s) if s != StudyStatus::Dropped => Some(StudyStatus::Dropped),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_cycle() {
        let study = Study::new("s1", "owner", "Sleep").with_status(StudyStatus::Recruiting);
        assert!(study.bindings_mutable());
        assert_eq!(study.next_status(StudyTransition::Archive), Some(StudyStatus::Archived));
        assert_eq!(study.next_status(StudyTransition::Unarchive), None);

        let archived = study.with_status(StudyStatus::Archived);
        assert!(!archived.bindings_mutable());
        assert_eq!(archived.next_status(StudyTransition::Archive), None);
        assert_eq!(archived.next_status(StudyTransition::Unarchive), Some(StudyStatus::Active));
    }

    #[test]
    fn test_drop_is_terminal() {
        let dropped = Study::new("s1", "owner", "Sleep").with_status(StudyStatus::Dropped);
        assert_eq!(dropped.next_status(StudyTransition::Drop), None);
        assert_eq!(dropped.next_status(StudyTransition::Archive), None);
        assert_eq!(dropped.next_status(StudyTransition::Unarchive), None);
    }

    #[test]
    fn test_ownership() {
        let study = Study::new("s1", "owner", "Sleep");
        assert!(study.is_owned_by(&"owner".into()));
        assert!(!study.is_owned_by(&"someone".into()));
    }
}
