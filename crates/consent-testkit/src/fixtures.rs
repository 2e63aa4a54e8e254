//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use consent_core::{EnrollmentId, PermKey, SigningSecret, Study, StudyId, UserId};
use consent_ledger::{BindingOptions, ConsentConfig, ConsentLedger, Result};
use consent_store::{MemoryStore, Store};

/// Secret used by [`test_config`].
pub const TEST_SECRET: &str = "consent-testkit-secret";
/// Verify link base used by [`test_config`].
pub const TEST_BASE_URL: &str = "https://consent.test";

/// The fixture study's required permission.
pub const REQUIRED: &str = "study-participation";
/// First optional permission (off by default).
pub const OPTIONAL_A: &str = "survey-responses";
/// Second optional permission (off by default).
pub const OPTIONAL_B: &str = "device-telemetry";

/// Deterministic configuration for tests.
pub fn test_config() -> ConsentConfig {
    ConsentConfig::default()
        .with_secret(SigningSecret::from(TEST_SECRET))
        .with_verify_base_url(TEST_BASE_URL)
}

/// Install an env-filtered subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A ledger with a seeded catalog and one study binding one required and
/// two optional permissions.
pub struct ConsentFixture<S: Store = MemoryStore> {
    pub ledger: ConsentLedger<S>,
    pub researcher: UserId,
    pub study_id: StudyId,
}

impl ConsentFixture<MemoryStore> {
    /// Fixture over a fresh memory store.
    pub async fn new() -> Result<Self> {
        Self::with_store(MemoryStore::new(), test_config()).await
    }
}

impl<S: Store> ConsentFixture<S> {
    /// Fixture over any store.
    pub async fn with_store(store: S, config: ConsentConfig) -> Result<Self> {
        let ledger = ConsentLedger::new(store, config);
        let researcher = UserId::new("dr-lee");
        let study_id = StudyId::new("sleep-2026");

        ledger.seed_catalog().await?;
        ledger
            .register_study(Study::new(study_id.clone(), researcher.clone(), "Sleep patterns"))
            .await?;

        let bindings = [
            (REQUIRED, BindingOptions::default().required(true)),
            (OPTIONAL_A, BindingOptions::default().default_allow(false)),
            (OPTIONAL_B, BindingOptions::default().default_allow(false)),
        ];
        for (order, (slug, options)) in bindings.into_iter().enumerate() {
            ledger
                .bind_permission(
                    &researcher,
                    &study_id,
                    &PermKey::new(slug),
                    options.display_order(order as i32),
                )
                .await?;
        }

        Ok(Self {
            ledger,
            researcher,
            study_id,
        })
    }

    /// Enrollment id of a participant in the fixture study.
    pub fn enrollment_id(&self, participant: &str) -> EnrollmentId {
        EnrollmentId::derive(&self.study_id, &UserId::new(participant))
    }

    /// Enroll a participant and return their enrollment id.
    pub async fn enroll(&self, participant: &str) -> Result<EnrollmentId> {
        let outcome = self
            .ledger
            .enroll(&self.study_id, &UserId::new(participant))
            .await?;
        Ok(outcome.enrollment().id)
    }
}

/// Shorthand for a permission key.
pub fn key(slug: &str) -> PermKey {
    PermKey::new(slug)
}

/// Shorthand for a sorted list of permission keys.
pub fn keys(slugs: &[&str]) -> Vec<PermKey> {
    let mut keys: Vec<PermKey> = slugs.iter().map(|s| PermKey::new(*s)).collect();
    keys.sort();
    keys
}
