//! The ledger: unified API over catalog, enrollments, grants, versions, the
//! audit chain and signed documents.
//!
//! Operations are grouped by concern into submodules, each adding an
//! `impl<S: Store> ConsentLedger<S>` block. Helpers shared between them
//! (reads with retry, study lookups, event publishing) live here.

mod audit;
mod catalog;
mod documents;
mod enrollment;
mod export;
mod grants;
mod study;
mod versions;

pub use documents::{DocumentRequest, Verification};
pub use export::{
    to_ndjson, EventRow, ExportOptions, LedgerRow, ParticipantRow, PermissionRow, StudyExport,
};
pub use study::BindingOptions;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use consent_core::{DocumentSigner, Study, StudyId, UserId};
use consent_store::Store;
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::ConsentConfig;
use crate::error::{ConsentError, Result};
use crate::events::ConsentEvent;
use crate::locks::KeyedLocks;

/// The main ledger struct.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct ConsentLedger<S: Store> {
    /// The storage backend.
    store: Arc<S>,
    /// Configuration.
    config: ConsentConfig,
    /// Mints and checks document ids.
    signer: DocumentSigner,
    /// Outbound signals.
    events: broadcast::Sender<ConsentEvent>,
    /// Serialises enrollment, grant and version writes per participant.
    participant_locks: KeyedLocks<(StudyId, UserId)>,
    /// Held exclusively by binding and lifecycle writes, shared by
    /// participant writes. Always taken before a participant lock.
    study_locks: KeyedLocks<StudyId>,
    /// Chains that failed verification, with the failing index.
    halted: Mutex<HashMap<StudyId, usize>>,
}

impl<S: Store> ConsentLedger<S> {
    /// Create a new ledger instance.
    pub fn new(store: S, config: ConsentConfig) -> Self {
        let signer = DocumentSigner::new(
            config.signing_secret.clone(),
            config.verify_base_url.clone(),
        );
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            store: Arc::new(store),
            config,
            signer,
            events,
            participant_locks: KeyedLocks::new(),
            study_locks: KeyedLocks::new(),
            halted: Mutex::new(HashMap::new()),
        }
    }

    /// Get the store reference.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ConsentConfig {
        &self.config
    }

    /// Subscribe to status-changed and audit-appended signals.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsentEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ConsentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run a read, retrying once after a pause if storage reports a
    /// transient failure.
    async fn read<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = consent_store::Result<T>>,
    {
        match f().await {
            Ok(value) => Ok(value),
            Err(e) if e.is_transient() => {
                warn!(op, error = %e, "transient read failure, retrying");
                tokio::time::sleep(self.config.read_retry_backoff).await;
                Ok(f().await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a study.
    pub async fn study(&self, study_id: &StudyId) -> Result<Study> {
        self.read("get_study", move || self.store.get_study(study_id))
            .await?
            .ok_or_else(|| ConsentError::StudyNotFound(study_id.clone()))
    }

    async fn owned_study(&self, study_id: &StudyId, researcher: &UserId) -> Result<Study> {
        let study = self.study(study_id).await?;
        if !study.is_owned_by(researcher) {
            return Err(ConsentError::NotAuthorized(format!(
                "{} does not own study {}",
                researcher, study_id
            )));
        }
        Ok(study)
    }
}

/// Get current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
