//! Enrollment state machine.
//!
//! ```text
//!   (absent) ──enroll──▶ ENROLLED ──unenroll──▶ WITHDRAWN
//!      │                  │   ▲                    │
//!    invite            complete└──────enroll───────┘
//!      ▼                  ▼
//!   INVITED ─enroll─▶  COMPLETED (terminal)
//! ```
//!
//! A missing row is the virtual UNENROLLED state. The transitions here are
//! pure: they take the current row (if any) and return the row to persist.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;
use crate::types::{EnrollmentId, StudyId, UserId};

/// Persisted enrollment status. UNENROLLED is represented by absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    Invited,
    Enrolled,
    Withdrawn,
    Completed,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::Invited => "INVITED",
            EnrollmentStatus::Enrolled => "ENROLLED",
            EnrollmentStatus::Withdrawn => "WITHDRAWN",
            EnrollmentStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INVITED" => Some(EnrollmentStatus::Invited),
            "ENROLLED" => Some(EnrollmentStatus::Enrolled),
            "WITHDRAWN" => Some(EnrollmentStatus::Withdrawn),
            "COMPLETED" => Some(EnrollmentStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label for a possibly-absent enrollment.
pub fn status_label(enrollment: Option<&Enrollment>) -> &'static str {
    enrollment.map_or("UNENROLLED", |e| e.status.as_str())
}

/// A participant's relationship to a study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub study_id: StudyId,
    pub participant_id: UserId,
    pub status: EnrollmentStatus,
    /// Last time the participant (re-)enrolled; unset for invitations.
    pub joined_at: Option<i64>,
    /// Set exactly while WITHDRAWN.
    pub left_at: Option<i64>,
}

impl Enrollment {
    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Enrolled
    }

    fn fresh(study_id: &StudyId, participant_id: &UserId, status: EnrollmentStatus) -> Self {
        Self {
            id: EnrollmentId::derive(study_id, participant_id),
            study_id: study_id.clone(),
            participant_id: participant_id.clone(),
            status,
            joined_at: None,
            left_at: None,
        }
    }
}

/// Result of an enroll request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollOutcome {
    /// The row changed; persist it.
    Enrolled(Enrollment),
    /// The participant was already enrolled; nothing to do.
    AlreadyEnrolled(Enrollment),
}

impl EnrollOutcome {
    pub fn enrollment(&self) -> &Enrollment {
        match self {
            EnrollOutcome::Enrolled(e) | EnrollOutcome::AlreadyEnrolled(e) => e,
        }
    }

    pub fn into_enrollment(self) -> Enrollment {
        match self {
            EnrollOutcome::Enrolled(e) | EnrollOutcome::AlreadyEnrolled(e) => e,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, EnrollOutcome::Enrolled(_))
    }
}

/// Enroll over an absent, INVITED or WITHDRAWN row.
pub fn enroll(
    current: Option<&Enrollment>,
    study_id: &StudyId,
    participant_id: &UserId,
    now: i64,
) -> Result<EnrollOutcome, CoreError> {
    let mut next = match current {
        None => Enrollment::fresh(study_id, participant_id, EnrollmentStatus::Enrolled),
        Some(e) => match e.status {
            EnrollmentStatus::Enrolled => return Ok(EnrollOutcome::AlreadyEnrolled(e.clone())),
            EnrollmentStatus::Completed => {
                return Err(CoreError::InvalidTransition {
                    from: EnrollmentStatus::Completed,
                    to: EnrollmentStatus::Enrolled,
                })
            }
            EnrollmentStatus::Invited | EnrollmentStatus::Withdrawn => e.clone(),
        },
    };

    next.status = EnrollmentStatus::Enrolled;
    next.joined_at = Some(now);
    next.left_at = None;
    Ok(EnrollOutcome::Enrolled(next))
}

/// Withdraw an ENROLLED participant.
pub fn unenroll(current: Option<&Enrollment>, now: i64) -> Result<Enrollment, CoreError> {
    match current {
        Some(e) if e.is_active() => {
            let mut next = e.clone();
            next.status = EnrollmentStatus::Withdrawn;
            next.left_at = Some(now);
            Ok(next)
        }
        _ => Err(CoreError::NotEnrolled),
    }
}

/// Mark an ENROLLED participant as having finished the study.
pub fn complete(current: Option<&Enrollment>) -> Result<Enrollment, CoreError> {
    match current {
        Some(e) if e.is_active() => {
            let mut next = e.clone();
            next.status = EnrollmentStatus::Completed;
            Ok(next)
        }
        _ => Err(CoreError::NotEnrolled),
    }
}

/// Create an INVITED row. Returns `None` if any row already exists.
pub fn invite(
    current: Option<&Enrollment>,
    study_id: &StudyId,
    participant_id: &UserId,
) -> Option<Enrollment> {
    match current {
        Some(_) => None,
        None => Some(Enrollment::fresh(study_id, participant_id, EnrollmentStatus::Invited)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (StudyId, UserId) {
        ("study".into(), "alice".into())
    }

    #[test]
    fn test_enroll_from_absent() {
        let (s, u) = ids();
        let outcome = enroll(None, &s, &u, 100).unwrap();
        assert!(outcome.changed());
        let e = outcome.into_enrollment();
        assert_eq!(e.status, EnrollmentStatus::Enrolled);
        assert_eq!(e.joined_at, Some(100));
        assert_eq!(e.left_at, None);
        assert_eq!(e.id, EnrollmentId::derive(&s, &u));
    }

    #[test]
    fn test_double_enroll_is_noop() {
        let (s, u) = ids();
        let first = enroll(None, &s, &u, 100).unwrap().into_enrollment();
        let second = enroll(Some(&first), &s, &u, 200).unwrap();
        assert!(!second.changed());
        assert_eq!(second.enrollment().joined_at, Some(100));
    }

    #[test]
    fn test_withdraw_and_reenroll_same_row() {
        let (s, u) = ids();
        let enrolled = enroll(None, &s, &u, 100).unwrap().into_enrollment();
        let withdrawn = unenroll(Some(&enrolled), 150).unwrap();
        assert_eq!(withdrawn.status, EnrollmentStatus::Withdrawn);
        assert_eq!(withdrawn.left_at, Some(150));

        let back = enroll(Some(&withdrawn), &s, &u, 200).unwrap().into_enrollment();
        assert_eq!(back.id, enrolled.id);
        assert_eq!(back.left_at, None);
        assert_eq!(back.joined_at, Some(200));
    }

    #[test]
    fn test_unenroll_requires_enrolled() {
        assert!(matches!(unenroll(None, 1), Err(CoreError::NotEnrolled)));
        let (s, u) = ids();
        let invited = invite(None, &s, &u).unwrap();
        assert!(matches!(unenroll(Some(&invited), 1), Err(CoreError::NotEnrolled)));
    }

    #[test]
    fn test_completed_is_terminal() {
        let (s, u) = ids();
        let enrolled = enroll(None, &s, &u, 100).unwrap().into_enrollment();
        let done = complete(Some(&enrolled)).unwrap();
        assert!(matches!(
            enroll(Some(&done), &s, &u, 300),
            Err(CoreError::InvalidTransition { .. })
        ));
        assert!(matches!(unenroll(Some(&done), 300), Err(CoreError::NotEnrolled)));
        assert!(matches!(complete(Some(&done)), Err(CoreError::NotEnrolled)));
    }

    #[test]
    fn test_invite_only_when_absent() {
        let (s, u) = ids();
        let invited = invite(None, &s, &u).unwrap();
        assert_eq!(invited.status, EnrollmentStatus::Invited);
        assert!(invite(Some(&invited), &s, &u).is_none());
        assert_eq!(status_label(None), "UNENROLLED");
        assert_eq!(status_label(Some(&invited)), "INVITED");
    }
}
