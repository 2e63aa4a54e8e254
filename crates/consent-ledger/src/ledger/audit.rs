use std::collections::HashMap;
use std::sync::MutexGuard;

use consent_core::{
    verify_chain, ActorRole, AuditAction, AuditBuilder, AuditEntry, StudyId, UserId,
};
use consent_store::{AppendResult, CommitResult, RowWrite, Store};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{now_millis, ConsentLedger};
use crate::error::{ConsentError, Result};
use crate::events::ConsentEvent;

impl<S: Store> ConsentLedger<S> {
    // ─────────────────────────────────────────────────────────────────────────
    // Audit Chain
    // ─────────────────────────────────────────────────────────────────────────

    /// Append an entry to a study's chain.
    ///
    /// `actor_id` is `None` for system-originated actions.
    pub async fn append_audit(
        &self,
        study_id: &StudyId,
        actor_role: ActorRole,
        actor_id: Option<UserId>,
        action: AuditAction,
        details: Value,
    ) -> Result<AuditEntry> {
        self.study(study_id).await?;

        let mut builder = AuditBuilder::new(study_id.clone(), action)
            .role(actor_role)
            .details(details)
            .timestamp(now_millis());
        if let Some(user) = actor_id {
            builder = builder.actor(actor_role, user);
        }

        self.record(builder).await
    }

    /// Record a system event out-of-band, without linking it into the chain.
    ///
    /// Used for high-volume or after-the-fact entries such as retention
    /// purges. Out-of-band entries are still listed by [`Self::audit_log`],
    /// keep their position in the log, and are accepted even while the chain
    /// is halted.
    pub async fn record_system_event(
        &self,
        study_id: &StudyId,
        action: AuditAction,
        details: Value,
    ) -> Result<AuditEntry> {
        self.study(study_id).await?;

        let entry = AuditBuilder::new(study_id.clone(), action)
            .details(details)
            .timestamp(now_millis())
            .detach();

        match self.store.append_audit(&entry).await? {
            AppendResult::Appended { index } => {
                info!(study = %study_id, action = action.as_str(), index, "recorded system event");
                self.publish(ConsentEvent::AuditAppended {
                    study_id: study_id.clone(),
                    action,
                    index,
                    entry_hash: None,
                });
                Ok(entry)
            }
            AppendResult::TailMoved { .. } => Err(ConsentError::ServiceUnavailable(
                "detached audit entry was rejected".to_string(),
            )),
        }
    }

    /// A study's log in append order.
    pub async fn audit_log(&self, study_id: &StudyId) -> Result<Vec<AuditEntry>> {
        self.read("list_audit", move || self.store.list_audit(study_id))
            .await
    }

    /// Recompute every link of a study's chain.
    ///
    /// Returns the number of linked entries checked. On the first mismatch
    /// the chain is halted: every later linked append fails with
    /// `ChainBroken` until [`Self::resume_chain`] is called.
    pub async fn verify_audit_chain(&self, study_id: &StudyId) -> Result<usize> {
        let entries = self.audit_log(study_id).await?;

        match verify_chain(&entries) {
            Ok(checked) => {
                debug!(study = %study_id, checked, "audit chain verified");
                Ok(checked)
            }
            Err(e) => {
                error!(
                    study = %study_id,
                    at = e.index(),
                    "audit chain verification failed, halting writes"
                );
                self.halted_chains().insert(study_id.clone(), e.index());
                Err(ConsentError::chain_broken(study_id, &e))
            }
        }
    }

    /// Whether writes to a study's chain are halted.
    pub fn is_chain_halted(&self, study_id: &StudyId) -> bool {
        self.halted_chains().contains_key(study_id)
    }

    /// Lift a halt after an operator has repaired the chain.
    ///
    /// Returns false if the chain was not halted.
    pub fn resume_chain(&self, study_id: &StudyId) -> bool {
        let resumed = self.halted_chains().remove(study_id).is_some();
        if resumed {
            warn!(study = %study_id, "audit chain writes resumed by operator");
        }
        resumed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal
    // ─────────────────────────────────────────────────────────────────────────

    fn halted_chains(&self) -> MutexGuard<'_, HashMap<StudyId, usize>> {
        self.halted.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fail fast if the study's chain is halted.
    pub(super) fn ensure_chain_open(&self, study_id: &StudyId) -> Result<()> {
        match self.halted_chains().get(study_id) {
            Some(&at) => Err(ConsentError::ChainBroken {
                study_id: study_id.clone(),
                at,
            }),
            None => Ok(()),
        }
    }

    /// Link an entry onto the current tail, re-linking and retrying while
    /// concurrent writers move the tail.
    pub(super) async fn record(&self, builder: AuditBuilder) -> Result<AuditEntry> {
        self.write_linked(None, builder).await?.ok_or_else(|| {
            ConsentError::ServiceUnavailable("audit entry was rejected".to_string())
        })
    }

    /// Write a row change and its audit entry as one unit.
    ///
    /// Returns `None` if the row's slot is taken, in which case nothing was
    /// written.
    pub(super) async fn commit(
        &self,
        write: RowWrite,
        builder: AuditBuilder,
    ) -> Result<Option<AuditEntry>> {
        self.write_linked(Some(&write), builder).await
    }

    async fn write_linked(
        &self,
        write: Option<&RowWrite>,
        builder: AuditBuilder,
    ) -> Result<Option<AuditEntry>> {
        let study_id = builder.study_id().clone();
        let action = builder.action();
        self.ensure_chain_open(&study_id)?;

        let mut tail = self.store.audit_tail(&study_id).await?;
        for attempt in 1..=self.config.audit_retries {
            let entry = builder.clone().link(tail);
            let result = match write {
                Some(write) => self.store.commit(write, &entry).await?,
                None => self.store.append_audit(&entry).await?.into(),
            };
            match result {
                CommitResult::Committed { index } => {
                    debug!(study = %study_id, action = action.as_str(), index, "audit entry appended");
                    self.publish(ConsentEvent::AuditAppended {
                        study_id,
                        action,
                        index,
                        entry_hash: entry.entry_hash(),
                    });
                    return Ok(Some(entry));
                }
                CommitResult::TailMoved { tail: current } => {
                    debug!(study = %study_id, attempt, "audit tail moved, re-linking");
                    tail = current;
                    tokio::task::yield_now().await;
                }
                CommitResult::SlotTaken => return Ok(None),
            }
        }

        warn!(
            study = %study_id,
            action = action.as_str(),
            attempts = self.config.audit_retries,
            "audit append gave up under contention"
        );
        Err(ConsentError::ServiceUnavailable(format!(
            "audit chain of study {} is too busy",
            study_id
        )))
    }
}
