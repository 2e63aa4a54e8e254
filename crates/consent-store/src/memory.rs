//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use consent_core::{
    sort_for_display, AuditEntry, Blake3Hash, BoundPermission, ConsentVersion, Enrollment,
    EnrollmentId, PermKey, PermissionGrant, PermissionTemplate, Study, StudyId,
    StudyPermissionBinding, TemplateId, UserId, VersionSelector,
};

use crate::error::{Result, StoreError};
use crate::traits::{AppendResult, CommitResult, InsertResult, RowWrite, Store};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Templates indexed by slug.
    templates: BTreeMap<PermKey, PermissionTemplate>,

    studies: HashMap<StudyId, Study>,

    /// Bindings: study -> template -> binding.
    bindings: HashMap<StudyId, BTreeMap<TemplateId, StudyPermissionBinding>>,

    enrollments: HashMap<EnrollmentId, Enrollment>,

    /// Grants indexed by (study, user, key).
    grants: BTreeMap<(StudyId, UserId, PermKey), PermissionGrant>,

    /// Versions: enrollment -> number -> version.
    versions: HashMap<EnrollmentId, BTreeMap<u32, ConsentVersion>>,

    /// Audit log per study, in append order.
    audit: HashMap<StudyId, Vec<AuditEntry>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl MemoryStoreInner {
    fn tail(&self, study_id: &StudyId) -> Option<Blake3Hash> {
        self.audit
            .get(study_id)
            .and_then(|log| consent_core::chain_tail(log))
    }

    /// Apply a row write. Returns false, without touching anything, if the
    /// row's slot is taken.
    fn apply(&mut self, write: &RowWrite) -> Result<bool> {
        match write {
            RowWrite::Template(template) => {
                if self.templates.contains_key(&template.slug) {
                    return Ok(false);
                }
                self.templates
                    .insert(template.slug.clone(), template.clone());
            }
            RowWrite::Binding(binding) => {
                self.bindings
                    .entry(binding.study_id.clone())
                    .or_default()
                    .insert(binding.template_id, binding.clone());
            }
            RowWrite::StudyStatus { study_id, status } => {
                let study = self
                    .studies
                    .get_mut(study_id)
                    .ok_or_else(|| StoreError::NotFound(format!("study {}", study_id)))?;
                study.status = *status;
            }
            RowWrite::Enrollment(enrollment) => {
                self.enrollments.insert(enrollment.id, enrollment.clone());
            }
            RowWrite::Grant(grant) => {
                let key = (
                    grant.study_id.clone(),
                    grant.user_id.clone(),
                    grant.perm_key.clone(),
                );
                self.grants.insert(key, grant.clone());
            }
            RowWrite::Version(version) => {
                let slots = self.versions.entry(version.enrollment_id).or_default();
                if slots.contains_key(&version.version) {
                    return Ok(false);
                }
                slots.insert(version.version, version.clone());
            }
        }
        Ok(true)
    }

    fn push_audit(&mut self, entry: &AuditEntry) -> u64 {
        let log = self.audit.entry(entry.study_id.clone()).or_default();
        log.push(entry.clone());
        (log.len() - 1) as u64
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_template(&self, template: &PermissionTemplate) -> Result<InsertResult> {
        let mut inner = self.write()?;
        if inner.templates.contains_key(&template.slug) {
            return Ok(InsertResult::AlreadyExists);
        }
        inner
            .templates
            .insert(template.slug.clone(), template.clone());
        Ok(InsertResult::Inserted)
    }

    async fn get_template(&self, slug: &PermKey) -> Result<Option<PermissionTemplate>> {
        Ok(self.read()?.templates.get(slug).cloned())
    }

    async fn list_templates(&self) -> Result<Vec<PermissionTemplate>> {
        Ok(self.read()?.templates.values().cloned().collect())
    }

    async fn update_template_description(
        &self,
        slug: &PermKey,
        description: &str,
    ) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.templates.get_mut(slug) {
            Some(template) => {
                template.description = description.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_study(&self, study: &Study) -> Result<InsertResult> {
        let mut inner = self.write()?;
        if inner.studies.contains_key(&study.id) {
            return Ok(InsertResult::AlreadyExists);
        }
        inner.studies.insert(study.id.clone(), study.clone());
        Ok(InsertResult::Inserted)
    }

    async fn get_study(&self, study_id: &StudyId) -> Result<Option<Study>> {
        Ok(self.read()?.studies.get(study_id).cloned())
    }

    async fn list_bound_permissions(&self, study_id: &StudyId) -> Result<Vec<BoundPermission>> {
        let inner = self.read()?;
        let Some(bindings) = inner.bindings.get(study_id) else {
            return Ok(Vec::new());
        };

        let mut bound = Vec::with_capacity(bindings.len());
        for binding in bindings.values() {
            let template = inner
                .templates
                .values()
                .find(|t| t.id == binding.template_id)
                .ok_or_else(|| {
                    StoreError::InvalidData(format!(
                        "binding references unknown template {}",
                        binding.template_id
                    ))
                })?;
            bound.push(BoundPermission::new(binding.clone(), template.clone()));
        }
        sort_for_display(&mut bound);
        Ok(bound)
    }

    async fn get_enrollment(
        &self,
        study_id: &StudyId,
        participant_id: &UserId,
    ) -> Result<Option<Enrollment>> {
        let id = EnrollmentId::derive(study_id, participant_id);
        Ok(self.read()?.enrollments.get(&id).cloned())
    }

    async fn get_enrollment_by_id(&self, id: &EnrollmentId) -> Result<Option<Enrollment>> {
        Ok(self.read()?.enrollments.get(id).cloned())
    }

    async fn list_enrollments(&self, study_id: &StudyId) -> Result<Vec<Enrollment>> {
        let inner = self.read()?;
        let mut enrollments: Vec<Enrollment> = inner
            .enrollments
            .values()
            .filter(|e| &e.study_id == study_id)
            .cloned()
            .collect();
        enrollments.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        Ok(enrollments)
    }

    async fn list_grants(
        &self,
        study_id: &StudyId,
        user_id: &UserId,
    ) -> Result<Vec<PermissionGrant>> {
        let inner = self.read()?;
        Ok(inner
            .grants
            .values()
            .filter(|g| &g.study_id == study_id && &g.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_study_grants(&self, study_id: &StudyId) -> Result<Vec<PermissionGrant>> {
        let inner = self.read()?;
        Ok(inner
            .grants
            .values()
            .filter(|g| &g.study_id == study_id)
            .cloned()
            .collect())
    }

    async fn latest_version_number(&self, enrollment_id: &EnrollmentId) -> Result<u32> {
        let inner = self.read()?;
        Ok(inner
            .versions
            .get(enrollment_id)
            .and_then(|v| v.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn list_versions(&self, enrollment_id: &EnrollmentId) -> Result<Vec<ConsentVersion>> {
        let inner = self.read()?;
        Ok(inner
            .versions
            .get(enrollment_id)
            .map(|v| v.values().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_version(
        &self,
        enrollment_id: &EnrollmentId,
        selector: VersionSelector,
    ) -> Result<Option<ConsentVersion>> {
        let inner = self.read()?;
        Ok(inner
            .versions
            .get(enrollment_id)
            .and_then(|v| v.values().find(|cv| selector.matches(cv)))
            .cloned())
    }

    async fn list_study_versions(&self, study_id: &StudyId) -> Result<Vec<ConsentVersion>> {
        let inner = self.read()?;
        let mut enrollment_ids: Vec<EnrollmentId> = inner
            .enrollments
            .values()
            .filter(|e| &e.study_id == study_id)
            .map(|e| e.id)
            .collect();
        enrollment_ids.sort();

        Ok(enrollment_ids
            .iter()
            .filter_map(|id| inner.versions.get(id))
            .flat_map(|v| v.values().cloned())
            .collect())
    }

    async fn audit_tail(&self, study_id: &StudyId) -> Result<Option<Blake3Hash>> {
        Ok(self.read()?.tail(study_id))
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<AppendResult> {
        let mut inner = self.write()?;

        if entry.link.is_linked() {
            let tail = inner.tail(&entry.study_id);
            if entry.prev_hash() != tail {
                return Ok(AppendResult::TailMoved { tail });
            }
        }

        Ok(AppendResult::Appended {
            index: inner.push_audit(entry),
        })
    }

    async fn list_audit(&self, study_id: &StudyId) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read()?
            .audit
            .get(study_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, write: &RowWrite, entry: &AuditEntry) -> Result<CommitResult> {
        let mut inner = self.write()?;

        if entry.link.is_linked() {
            let tail = inner.tail(&entry.study_id);
            if entry.prev_hash() != tail {
                return Ok(CommitResult::TailMoved { tail });
            }
        }

        if !inner.apply(write)? {
            return Ok(CommitResult::SlotTaken);
        }
        Ok(CommitResult::Committed {
            index: inner.push_audit(entry),
        })
    }
}
