//! End-to-end lifecycle scenarios over the memory store.

use consent_ledger::core::{PermissionTemplate, PiiLevel, StudyStatus};
use consent_ledger::{
    AuditAction, ConsentError, ConsentEvent, EnrollOutcome, EnrollmentStatus, UserId,
    VersionSelector,
};
use consent_testkit::fixtures::{key, keys, ConsentFixture, OPTIONAL_A, OPTIONAL_B, REQUIRED};
use tokio::sync::broadcast::error::TryRecvError;

fn alice() -> UserId {
    UserId::new("alice")
}

async fn actions(fx: &ConsentFixture) -> Vec<AuditAction> {
    fx.ledger
        .audit_log(&fx.study_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.action)
        .collect()
}

#[tokio::test]
async fn test_required_and_optional_scenario() {
    let fx = ConsentFixture::new().await.unwrap();
    let enrollment = fx.enroll("alice").await.unwrap();

    fx.ledger
        .set_grant(&fx.study_id, &alice(), &key(OPTIONAL_A), true)
        .await
        .unwrap();
    fx.ledger
        .set_grant(&fx.study_id, &alice(), &key(OPTIONAL_B), false)
        .await
        .unwrap();
    let v1 = fx.ledger.save_version(&enrollment, None).await.unwrap();
    assert_eq!(v1.version, 1);
    assert_eq!(v1.decisions.to_vec(), keys(&[REQUIRED, OPTIONAL_A]));

    fx.ledger
        .set_grant(&fx.study_id, &alice(), &key(OPTIONAL_B), true)
        .await
        .unwrap();
    let v2 = fx.ledger.save_version(&enrollment, None).await.unwrap();
    assert_eq!(v2.version, 2);
    assert_eq!(v2.decisions.to_vec(), keys(&[REQUIRED, OPTIONAL_A, OPTIONAL_B]));

    let d = fx.ledger.diff(&v1, &v2).unwrap();
    assert_eq!(d.added, keys(&[OPTIONAL_B]));
    assert!(d.removed.is_empty());
    assert_eq!(d.unchanged, keys(&[REQUIRED, OPTIONAL_A]));

    // Later grant changes never touch saved versions.
    let stored = fx.ledger.get_version(&enrollment, 1u32).await.unwrap();
    assert_eq!(stored, v1);
    assert!(stored.is_intact());
}

#[tokio::test]
async fn test_required_permission_is_locked() {
    let fx = ConsentFixture::new().await.unwrap();
    fx.enroll("alice").await.unwrap();

    let err = fx
        .ledger
        .set_grant(&fx.study_id, &alice(), &key(REQUIRED), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::PermissionLocked(_)));
    assert!(err.user_message().contains("cannot be changed"));

    let decisions = fx
        .ledger
        .effective_decisions(&fx.study_id, &alice())
        .await
        .unwrap();
    assert!(decisions.contains(&key(REQUIRED)));
    assert!(fx
        .ledger
        .grants(&fx.study_id, &alice())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_grant_checks_run_in_order() {
    let fx = ConsentFixture::new().await.unwrap();

    // Not enrolled, but the key problems are reported first.
    let err = fx
        .ledger
        .set_grant(&fx.study_id, &alice(), &key("health-records"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::PermissionNotFound(_)));

    let err = fx
        .ledger
        .set_grant(&fx.study_id, &alice(), &key(REQUIRED), true)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::PermissionLocked(_)));

    let err = fx
        .ledger
        .set_grant(&fx.study_id, &alice(), &key(OPTIONAL_A), true)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::NotEnrolled));
}

#[tokio::test]
async fn test_unchanged_grant_is_idempotent() {
    let fx = ConsentFixture::new().await.unwrap();
    fx.enroll("alice").await.unwrap();

    let first = fx
        .ledger
        .set_grant(&fx.study_id, &alice(), &key(OPTIONAL_A), true)
        .await
        .unwrap();
    let before = actions(&fx).await.len();
    let second = fx
        .ledger
        .set_grant(&fx.study_id, &alice(), &key(OPTIONAL_A), true)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(actions(&fx).await.len(), before);
}

#[tokio::test]
async fn test_unenroll_without_enroll() {
    let fx = ConsentFixture::new().await.unwrap();
    let before = actions(&fx).await;

    let err = fx.ledger.unenroll(&fx.study_id, &alice()).await.unwrap_err();
    assert!(matches!(err, ConsentError::NotEnrolled));
    assert_eq!(actions(&fx).await, before);
    assert!(fx
        .ledger
        .enrollment(&fx.study_id, &alice())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_double_enroll_is_a_no_op() {
    let fx = ConsentFixture::new().await.unwrap();
    let mut rx = fx.ledger.subscribe();

    let first = fx.ledger.enroll(&fx.study_id, &alice()).await.unwrap();
    assert!(first.changed());
    while rx.try_recv().is_ok() {}

    let second = fx.ledger.enroll(&fx.study_id, &alice()).await.unwrap();
    assert!(matches!(second, EnrollOutcome::AlreadyEnrolled(_)));
    assert_eq!(second.enrollment(), first.enrollment());
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    assert_eq!(fx.ledger.enrollments(&fx.study_id).await.unwrap().len(), 1);
    let enrolls = actions(&fx)
        .await
        .into_iter()
        .filter(|a| *a == AuditAction::Enroll)
        .count();
    assert_eq!(enrolls, 1);
}

#[tokio::test]
async fn test_reenroll_after_withdrawal() {
    let fx = ConsentFixture::new().await.unwrap();
    let id = fx.enroll("alice").await.unwrap();
    fx.ledger
        .set_grant(&fx.study_id, &alice(), &key(OPTIONAL_A), true)
        .await
        .unwrap();

    let withdrawn = fx.ledger.unenroll(&fx.study_id, &alice()).await.unwrap();
    assert_eq!(withdrawn.status, EnrollmentStatus::Withdrawn);
    assert!(withdrawn.left_at.is_some());

    let err = fx.ledger.save_version(&id, None).await.unwrap_err();
    assert!(matches!(err, ConsentError::NotEnrolled));

    let back = fx
        .ledger
        .enroll(&fx.study_id, &alice())
        .await
        .unwrap()
        .into_enrollment();
    assert_eq!(back.id, id);
    assert_eq!(back.status, EnrollmentStatus::Enrolled);
    assert_eq!(back.left_at, None);

    // Grants survive the withdrawal.
    let decisions = fx
        .ledger
        .effective_decisions(&fx.study_id, &alice())
        .await
        .unwrap();
    assert!(decisions.contains(&key(OPTIONAL_A)));
}

#[tokio::test]
async fn test_status_changed_signal() {
    let fx = ConsentFixture::new().await.unwrap();
    let mut rx = fx.ledger.subscribe();

    fx.ledger.enroll(&fx.study_id, &alice()).await.unwrap();
    fx.ledger.unenroll(&fx.study_id, &alice()).await.unwrap();

    let mut changes = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ConsentEvent::StatusChanged { from, to, .. } = event {
            changes.push((from, to));
        }
    }
    assert_eq!(
        changes,
        vec![
            (None, EnrollmentStatus::Enrolled),
            (Some(EnrollmentStatus::Enrolled), EnrollmentStatus::Withdrawn),
        ]
    );
}

#[tokio::test]
async fn test_invite_then_enroll() {
    let fx = ConsentFixture::new().await.unwrap();

    let invited = fx
        .ledger
        .invite(&fx.researcher, &fx.study_id, &alice())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invited.status, EnrollmentStatus::Invited);
    assert!(fx
        .ledger
        .invite(&fx.researcher, &fx.study_id, &alice())
        .await
        .unwrap()
        .is_none());

    let outcome = fx.ledger.enroll(&fx.study_id, &alice()).await.unwrap();
    assert!(outcome.changed());
    assert_eq!(outcome.enrollment().id, invited.id);

    // A participant cannot invite on the owner's behalf.
    let err = fx
        .ledger
        .invite(&alice(), &fx.study_id, &UserId::new("bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::NotAuthorized(_)));
}

#[tokio::test]
async fn test_completed_is_terminal() {
    let fx = ConsentFixture::new().await.unwrap();
    fx.enroll("alice").await.unwrap();

    let done = fx
        .ledger
        .complete(&fx.researcher, &fx.study_id, &alice())
        .await
        .unwrap();
    assert_eq!(done.status, EnrollmentStatus::Completed);

    let err = fx.ledger.enroll(&fx.study_id, &alice()).await.unwrap_err();
    assert!(matches!(
        err,
        ConsentError::InvalidTransition {
            from: EnrollmentStatus::Completed,
            to: EnrollmentStatus::Enrolled
        }
    ));
    let err = fx.ledger.unenroll(&fx.study_id, &alice()).await.unwrap_err();
    assert!(matches!(err, ConsentError::NotEnrolled));
}

#[tokio::test]
async fn test_study_lifecycle() {
    let fx = ConsentFixture::new().await.unwrap();

    let err = fx
        .ledger
        .archive_study(&alice(), &fx.study_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::NotAuthorized(_)));

    let archived = fx
        .ledger
        .archive_study(&fx.researcher, &fx.study_id)
        .await
        .unwrap();
    assert_eq!(archived.status, StudyStatus::Archived);

    let err = fx.ledger.enroll(&fx.study_id, &alice()).await.unwrap_err();
    assert!(matches!(err, ConsentError::StudyClosed(_)));
    let err = fx
        .ledger
        .bind_permission(
            &fx.researcher,
            &fx.study_id,
            &key("demographics"),
            Default::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::StudyClosed(_)));

    let err = fx
        .ledger
        .archive_study(&fx.researcher, &fx.study_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::StudyTransitionRejected { .. }));

    let active = fx
        .ledger
        .unarchive_study(&fx.researcher, &fx.study_id)
        .await
        .unwrap();
    assert_eq!(active.status, StudyStatus::Active);
    fx.ledger.enroll(&fx.study_id, &alice()).await.unwrap();

    fx.ledger
        .drop_study(&fx.researcher, &fx.study_id)
        .await
        .unwrap();
    let err = fx
        .ledger
        .enroll(&fx.study_id, &UserId::new("bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::StudyClosed(_)));

    let trail: Vec<AuditAction> = actions(&fx)
        .await
        .into_iter()
        .filter(|a| {
            matches!(
                a,
                AuditAction::StudyArchived | AuditAction::StudyUnarchived | AuditAction::StudyDropped
            )
        })
        .collect();
    assert_eq!(
        trail,
        vec![
            AuditAction::StudyArchived,
            AuditAction::StudyUnarchived,
            AuditAction::StudyDropped
        ]
    );
}

#[tokio::test]
async fn test_explicit_selection() {
    let fx = ConsentFixture::new().await.unwrap();
    let id = fx.enroll("alice").await.unwrap();

    let selection = vec![key(OPTIONAL_B), key(OPTIONAL_B)];
    let v = fx
        .ledger
        .save_version(&id, Some(selection.as_slice()))
        .await
        .unwrap();
    assert_eq!(v.decisions.to_vec(), keys(&[OPTIONAL_B, REQUIRED]));

    let err = fx
        .ledger
        .save_version(&id, Some(&[key("contact-info")][..]))
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::PermissionNotFound(_)));
    assert_eq!(fx.ledger.list_versions(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_version_lookup() {
    let fx = ConsentFixture::new().await.unwrap();
    let alice_id = fx.enroll("alice").await.unwrap();
    let bob_id = fx.enroll("bob").await.unwrap();

    let v1 = fx.ledger.save_version(&alice_id, None).await.unwrap();
    let v2 = fx.ledger.save_version(&alice_id, None).await.unwrap();
    let bob_v1 = fx.ledger.save_version(&bob_id, None).await.unwrap();

    let listed = fx.ledger.list_versions(&alice_id).await.unwrap();
    assert_eq!(listed, vec![v2.clone(), v1.clone()]);

    let by_id = fx
        .ledger
        .get_version(&alice_id, VersionSelector::Id(v2.id))
        .await
        .unwrap();
    assert_eq!(by_id, v2);

    // Another enrollment's version is not reachable through this one.
    let err = fx
        .ledger
        .get_version(&alice_id, VersionSelector::Id(bob_v1.id))
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::VersionNotFound));
    let err = fx.ledger.get_version(&alice_id, 9u32).await.unwrap_err();
    assert!(matches!(err, ConsentError::VersionNotFound));

    let err = fx.ledger.diff(&v1, &bob_v1).unwrap_err();
    assert!(matches!(err, ConsentError::InvalidComparison));

    let d = fx.ledger.diff_versions(&alice_id, 1u32, 2u32).await.unwrap();
    assert!(d.is_empty());
}

#[tokio::test]
async fn test_custom_permissions() {
    let fx = ConsentFixture::new().await.unwrap();
    assert_eq!(fx.ledger.seed_catalog().await.unwrap(), 0);

    let diary = PermissionTemplate::custom("sleep-diary", "Sleep diary")
        .description("Nightly diary entries.")
        .pii_level(PiiLevel::Pseudonymous);
    let defined = fx
        .ledger
        .define_permission(&fx.researcher, &fx.study_id, diary.clone())
        .await
        .unwrap();
    assert!(defined.is_consistent());

    let err = fx
        .ledger
        .define_permission(&fx.researcher, &fx.study_id, diary)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::PermissionExists(_)));

    let bound = fx
        .ledger
        .bind_permission(
            &fx.researcher,
            &fx.study_id,
            &key("sleep-diary"),
            Default::default(),
        )
        .await
        .unwrap();
    assert!(bound.is_sensitive());
    assert!(!bound.is_required());

    let updated = fx
        .ledger
        .update_permission_description(&key("sleep-diary"), "Nightly diary, free text.")
        .await
        .unwrap();
    assert_eq!(updated.description, "Nightly diary, free text.");
    let stored = fx.ledger.template(&key("sleep-diary")).await.unwrap().unwrap();
    assert_eq!(stored.description, "Nightly diary, free text.");

    let err = fx
        .ledger
        .update_permission_description(&key(REQUIRED), "changed")
        .await
        .unwrap_err();
    assert!(matches!(err, ConsentError::NotAuthorized(_)));

    let trail = actions(&fx).await;
    assert!(trail.contains(&AuditAction::PermissionDefined));
    assert_eq!(fx.ledger.catalog().await.unwrap().len(), 9);
}
