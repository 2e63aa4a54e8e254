//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend for the consent ledger. It uses
//! rusqlite with bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

use consent_core::{
    canonical_string, Actor, ActorRole, AuditAction, AuditEntry, Blake3Hash, BoundPermission,
    ChainLink, ConsentVersion, DecisionSet, Enrollment, EnrollmentId, EnrollmentStatus, PermKey,
    PermissionGrant, PermissionSource, PermissionTemplate, PiiLevel, Sha256Hash, Study, StudyId,
    StudyPermissionBinding, StudyStatus, TemplateId, UserId, VersionId, VersionSelector,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{AppendResult, CommitResult, InsertResult, RowWrite, Store};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

fn column_index(row: &Row<'_>, name: &str) -> usize {
    row.as_ref().column_index(name).unwrap_or(0)
}

fn digest_column(row: &Row<'_>, name: &str) -> rusqlite::Result<[u8; 32]> {
    let bytes: Vec<u8> = row.get(name)?;
    bytes
        .try_into()
        .map_err(|_| rusqlite::Error::InvalidColumnType(column_index(row, name), name.into(), Type::Blob))
}

fn optional_digest_column(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<[u8; 32]>> {
    let bytes: Option<Vec<u8>> = row.get(name)?;
    bytes
        .map(|b| {
            b.try_into().map_err(|_| {
                rusqlite::Error::InvalidColumnType(column_index(row, name), name.into(), Type::Blob)
            })
        })
        .transpose()
}

fn enum_column<T>(row: &Row<'_>, name: &str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let text: String = row.get(name)?;
    parse(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column_index(row, name),
            Type::Text,
            format!("invalid {}: {}", name, text).into(),
        )
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

const TEMPLATE_COLUMNS: &str = "t.id, t.slug, t.title, t.description, t.category, t.pii_level,
     t.default_required, t.default_allow, t.source";

fn row_to_template(row: &Row<'_>) -> rusqlite::Result<PermissionTemplate> {
    Ok(PermissionTemplate {
        id: TemplateId::from_bytes(digest_column(row, "id")?),
        slug: PermKey::new(row.get::<_, String>("slug")?),
        title: row.get("title")?,
        description: row.get("description")?,
        category: row.get("category")?,
        pii_level: enum_column(row, "pii_level", PiiLevel::parse)?,
        default_required: row.get("default_required")?,
        default_allow: row.get("default_allow")?,
        source: enum_column(row, "source", PermissionSource::parse)?,
    })
}

fn row_to_bound(row: &Row<'_>) -> rusqlite::Result<BoundPermission> {
    let binding = StudyPermissionBinding {
        study_id: StudyId::new(row.get::<_, String>("study_id")?),
        template_id: TemplateId::from_bytes(digest_column(row, "template_id")?),
        required: row.get("binding_required")?,
        sensitive: row.get("binding_sensitive")?,
        default_allow: row.get("binding_default_allow")?,
        display_order: row.get("display_order")?,
    };
    Ok(BoundPermission::new(binding, row_to_template(row)?))
}

fn row_to_study(row: &Row<'_>) -> rusqlite::Result<Study> {
    Ok(Study {
        id: StudyId::new(row.get::<_, String>("id")?),
        owner_id: UserId::new(row.get::<_, String>("owner_id")?),
        title: row.get("title")?,
        status: enum_column(row, "status", StudyStatus::parse)?,
    })
}

fn row_to_enrollment(row: &Row<'_>) -> rusqlite::Result<Enrollment> {
    Ok(Enrollment {
        id: EnrollmentId::from_bytes(digest_column(row, "id")?),
        study_id: StudyId::new(row.get::<_, String>("study_id")?),
        participant_id: UserId::new(row.get::<_, String>("participant_id")?),
        status: enum_column(row, "status", EnrollmentStatus::parse)?,
        joined_at: row.get("joined_at")?,
        left_at: row.get("left_at")?,
    })
}

fn row_to_grant(row: &Row<'_>) -> rusqlite::Result<PermissionGrant> {
    Ok(PermissionGrant {
        study_id: StudyId::new(row.get::<_, String>("study_id")?),
        user_id: UserId::new(row.get::<_, String>("user_id")?),
        perm_key: PermKey::new(row.get::<_, String>("perm_key")?),
        granted: row.get("granted")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<ConsentVersion> {
    let decisions_cbor: Vec<u8> = row.get("decisions")?;
    let decisions: DecisionSet = ciborium::from_reader(&decisions_cbor[..]).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            column_index(row, "decisions"),
            Type::Blob,
            format!("invalid decisions: {}", e).into(),
        )
    })?;

    Ok(ConsentVersion {
        id: VersionId::from_bytes(digest_column(row, "id")?),
        enrollment_id: EnrollmentId::from_bytes(digest_column(row, "enrollment_id")?),
        version: row.get("version")?,
        created_at: row.get("created_at")?,
        decisions,
        receipt_hash: Sha256Hash(digest_column(row, "receipt_hash")?),
    })
}

fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let details_text: String = row.get("details")?;
    let details = serde_json::from_str(&details_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            column_index(row, "details"),
            Type::Text,
            Box::new(e),
        )
    })?;

    let linked: bool = row.get("linked")?;
    let link = if linked {
        ChainLink::Linked {
            prev_hash: optional_digest_column(row, "prev_hash")?.map(Blake3Hash::from_bytes),
            entry_hash: Blake3Hash::from_bytes(digest_column(row, "entry_hash")?),
        }
    } else {
        ChainLink::Detached
    };

    Ok(AuditEntry {
        study_id: StudyId::new(row.get::<_, String>("study_id")?),
        actor_role: enum_column(row, "actor_role", ActorRole::parse)?,
        actor: Actor::from_user_id(row.get::<_, Option<String>>("actor_id")?.map(UserId::new)),
        action: enum_column(row, "action", AuditAction::parse)?,
        details,
        created_at: row.get("created_at")?,
        link,
    })
}

fn encode_decisions(decisions: &DecisionSet) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(decisions, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn find_version_at(
    conn: &Connection,
    enrollment_id: &EnrollmentId,
    number: u32,
) -> Result<Option<ConsentVersion>> {
    conn.query_row(
        "SELECT id, enrollment_id, version, created_at, decisions, receipt_hash
         FROM consent_versions WHERE enrollment_id = ?1 AND version = ?2",
        params![enrollment_id.as_bytes().as_slice(), number],
        row_to_version,
    )
    .optional()
    .map_err(StoreError::from)
}

fn read_audit_tail(conn: &Connection, study_id: &StudyId) -> Result<Option<Blake3Hash>> {
    let tail: Option<Vec<u8>> = conn
        .query_row(
            "SELECT entry_hash FROM audit_entries
             WHERE study_id = ?1 AND linked = 1
             ORDER BY seq DESC LIMIT 1",
            params![study_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    tail.map(|bytes| {
        <[u8; 32]>::try_from(bytes.as_slice())
            .map(Blake3Hash::from_bytes)
            .map_err(|_| StoreError::InvalidData("audit entry hash is not 32 bytes".into()))
    })
    .transpose()
}

fn insert_template_row(conn: &Connection, template: &PermissionTemplate) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO permission_templates (
            id, slug, title, description, category, pii_level,
            default_required, default_allow, source
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            template.id.as_bytes().as_slice(),
            template.slug.as_str(),
            template.title,
            template.description,
            template.category,
            template.pii_level.as_str(),
            template.default_required,
            template.default_allow,
            template.source.as_str(),
        ],
    )?;
    Ok(inserted > 0)
}

/// Insert a version into a free slot. Returns false if the number is taken.
fn insert_version_row(conn: &Connection, version: &ConsentVersion) -> Result<bool> {
    if find_version_at(conn, &version.enrollment_id, version.version)?.is_some() {
        return Ok(false);
    }

    let decisions = encode_decisions(&version.decisions)?;
    let inserted = conn.execute(
        "INSERT INTO consent_versions (
            id, enrollment_id, version, created_at, decisions, receipt_hash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            version.id.as_bytes().as_slice(),
            version.enrollment_id.as_bytes().as_slice(),
            version.version,
            version.created_at,
            decisions,
            version.receipt_hash.as_bytes().as_slice(),
        ],
    );

    match inserted {
        Ok(_) => Ok(true),
        Err(e) if is_constraint_violation(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Apply a row write inside the caller's transaction. Returns false if the
/// row's slot is taken.
fn apply_write(conn: &Connection, write: &RowWrite) -> Result<bool> {
    match write {
        RowWrite::Template(template) => return insert_template_row(conn, template),
        RowWrite::Version(version) => return insert_version_row(conn, version),
        RowWrite::Binding(binding) => {
            conn.execute(
                "INSERT INTO study_permissions (
                    study_id, template_id, required, sensitive, default_allow, display_order
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT (study_id, template_id) DO UPDATE SET
                    required = excluded.required,
                    sensitive = excluded.sensitive,
                    default_allow = excluded.default_allow,
                    display_order = excluded.display_order",
                params![
                    binding.study_id.as_str(),
                    binding.template_id.as_bytes().as_slice(),
                    binding.required,
                    binding.sensitive,
                    binding.default_allow,
                    binding.display_order,
                ],
            )?;
        }
        RowWrite::StudyStatus { study_id, status } => {
            let updated = conn.execute(
                "UPDATE studies SET status = ?2 WHERE id = ?1",
                params![study_id.as_str(), status.as_str()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("study {}", study_id)));
            }
        }
        RowWrite::Enrollment(enrollment) => {
            conn.execute(
                "INSERT INTO enrollments (id, study_id, participant_id, status, joined_at, left_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (id) DO UPDATE SET
                    status = excluded.status,
                    joined_at = excluded.joined_at,
                    left_at = excluded.left_at",
                params![
                    enrollment.id.as_bytes().as_slice(),
                    enrollment.study_id.as_str(),
                    enrollment.participant_id.as_str(),
                    enrollment.status.as_str(),
                    enrollment.joined_at,
                    enrollment.left_at,
                ],
            )?;
        }
        RowWrite::Grant(grant) => {
            conn.execute(
                "INSERT INTO permission_grants (study_id, user_id, perm_key, granted, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (study_id, user_id, perm_key) DO UPDATE SET
                    granted = excluded.granted,
                    updated_at = excluded.updated_at",
                params![
                    grant.study_id.as_str(),
                    grant.user_id.as_str(),
                    grant.perm_key.as_str(),
                    grant.granted,
                    grant.updated_at,
                ],
            )?;
        }
    }
    Ok(true)
}

/// Insert an entry and return its index in the study's log.
///
/// A linked entry whose `prev_hash` is already extended violates
/// `UNIQUE(study_id, prev_hash)`.
fn insert_audit(conn: &Connection, entry: &AuditEntry) -> rusqlite::Result<u64> {
    let index: u64 = conn.query_row(
        "SELECT COUNT(*) FROM audit_entries WHERE study_id = ?1",
        params![entry.study_id.as_str()],
        |row| row.get(0),
    )?;

    let prev_hash = entry.prev_hash();
    let entry_hash = entry.entry_hash();
    conn.execute(
        "INSERT INTO audit_entries (
            study_id, actor_role, actor_id, action, details, created_at,
            linked, prev_hash, entry_hash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.study_id.as_str(),
            entry.actor_role.as_str(),
            entry.actor.user_id().map(UserId::as_str),
            entry.action.as_str(),
            canonical_string(&entry.details),
            entry.created_at,
            entry.link.is_linked(),
            prev_hash.as_ref().map(|h| h.as_bytes().as_slice()),
            entry_hash.as_ref().map(|h| h.as_bytes().as_slice()),
        ],
    )?;
    Ok(index)
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_template(&self, template: &PermissionTemplate) -> Result<InsertResult> {
        let template = template.clone();
        self.call(move |conn| {
            Ok(if insert_template_row(conn, &template)? {
                InsertResult::Inserted
            } else {
                InsertResult::AlreadyExists
            })
        })
        .await
    }

    async fn get_template(&self, slug: &PermKey) -> Result<Option<PermissionTemplate>> {
        let slug = slug.clone();
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM permission_templates t WHERE t.slug = ?1",
                    TEMPLATE_COLUMNS
                ),
                params![slug.as_str()],
                row_to_template,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_templates(&self) -> Result<Vec<PermissionTemplate>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM permission_templates t ORDER BY t.slug",
                TEMPLATE_COLUMNS
            ))?;
            let templates = stmt
                .query_map([], row_to_template)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(templates)
        })
        .await
    }

    async fn update_template_description(
        &self,
        slug: &PermKey,
        description: &str,
    ) -> Result<bool> {
        let slug = slug.clone();
        let description = description.to_string();
        self.call(move |conn| {
            let updated = conn.execute(
                "UPDATE permission_templates SET description = ?2 WHERE slug = ?1",
                params![slug.as_str(), description],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn insert_study(&self, study: &Study) -> Result<InsertResult> {
        let study = study.clone();
        self.call(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO studies (id, owner_id, title, status)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    study.id.as_str(),
                    study.owner_id.as_str(),
                    study.title,
                    study.status.as_str(),
                ],
            )?;
            Ok(if inserted == 0 {
                InsertResult::AlreadyExists
            } else {
                InsertResult::Inserted
            })
        })
        .await
    }

    async fn get_study(&self, study_id: &StudyId) -> Result<Option<Study>> {
        let study_id = study_id.clone();
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, owner_id, title, status FROM studies WHERE id = ?1",
                params![study_id.as_str()],
                row_to_study,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_bound_permissions(&self, study_id: &StudyId) -> Result<Vec<BoundPermission>> {
        let study_id = study_id.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT sp.study_id, sp.template_id,
                        sp.required AS binding_required,
                        sp.sensitive AS binding_sensitive,
                        sp.default_allow AS binding_default_allow,
                        sp.display_order, {}
                 FROM study_permissions sp
                 JOIN permission_templates t ON t.id = sp.template_id
                 WHERE sp.study_id = ?1
                 ORDER BY sp.display_order, t.slug",
                TEMPLATE_COLUMNS
            ))?;
            let bound = stmt
                .query_map(params![study_id.as_str()], row_to_bound)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(bound)
        })
        .await
    }

    async fn get_enrollment(
        &self,
        study_id: &StudyId,
        participant_id: &UserId,
    ) -> Result<Option<Enrollment>> {
        self.get_enrollment_by_id(&EnrollmentId::derive(study_id, participant_id))
            .await
    }

    async fn get_enrollment_by_id(&self, id: &EnrollmentId) -> Result<Option<Enrollment>> {
        let id = *id;
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, study_id, participant_id, status, joined_at, left_at
                 FROM enrollments WHERE id = ?1",
                params![id.as_bytes().as_slice()],
                row_to_enrollment,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_enrollments(&self, study_id: &StudyId) -> Result<Vec<Enrollment>> {
        let study_id = study_id.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, study_id, participant_id, status, joined_at, left_at
                 FROM enrollments WHERE study_id = ?1 ORDER BY participant_id",
            )?;
            let enrollments = stmt
                .query_map(params![study_id.as_str()], row_to_enrollment)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(enrollments)
        })
        .await
    }

    async fn list_grants(
        &self,
        study_id: &StudyId,
        user_id: &UserId,
    ) -> Result<Vec<PermissionGrant>> {
        let study_id = study_id.clone();
        let user_id = user_id.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT study_id, user_id, perm_key, granted, updated_at
                 FROM permission_grants
                 WHERE study_id = ?1 AND user_id = ?2
                 ORDER BY perm_key",
            )?;
            let grants = stmt
                .query_map(params![study_id.as_str(), user_id.as_str()], row_to_grant)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(grants)
        })
        .await
    }

    async fn list_study_grants(&self, study_id: &StudyId) -> Result<Vec<PermissionGrant>> {
        let study_id = study_id.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT study_id, user_id, perm_key, granted, updated_at
                 FROM permission_grants
                 WHERE study_id = ?1
                 ORDER BY user_id, perm_key",
            )?;
            let grants = stmt
                .query_map(params![study_id.as_str()], row_to_grant)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(grants)
        })
        .await
    }

    async fn latest_version_number(&self, enrollment_id: &EnrollmentId) -> Result<u32> {
        let enrollment_id = *enrollment_id;
        self.call(move |conn| {
            let latest: u32 = conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM consent_versions WHERE enrollment_id = ?1",
                params![enrollment_id.as_bytes().as_slice()],
                |row| row.get(0),
            )?;
            Ok(latest)
        })
        .await
    }

    async fn list_versions(&self, enrollment_id: &EnrollmentId) -> Result<Vec<ConsentVersion>> {
        let enrollment_id = *enrollment_id;
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, enrollment_id, version, created_at, decisions, receipt_hash
                 FROM consent_versions WHERE enrollment_id = ?1
                 ORDER BY version DESC",
            )?;
            let versions = stmt
                .query_map(params![enrollment_id.as_bytes().as_slice()], row_to_version)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(versions)
        })
        .await
    }

    async fn get_version(
        &self,
        enrollment_id: &EnrollmentId,
        selector: VersionSelector,
    ) -> Result<Option<ConsentVersion>> {
        let enrollment_id = *enrollment_id;
        self.call(move |conn| match selector {
            VersionSelector::Number(n) => find_version_at(conn, &enrollment_id, n),
            VersionSelector::Id(id) => conn
                .query_row(
                    "SELECT id, enrollment_id, version, created_at, decisions, receipt_hash
                     FROM consent_versions WHERE id = ?1 AND enrollment_id = ?2",
                    params![
                        id.as_bytes().as_slice(),
                        enrollment_id.as_bytes().as_slice()
                    ],
                    row_to_version,
                )
                .optional()
                .map_err(StoreError::from),
        })
        .await
    }

    async fn list_study_versions(&self, study_id: &StudyId) -> Result<Vec<ConsentVersion>> {
        let study_id = study_id.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT v.id, v.enrollment_id, v.version, v.created_at, v.decisions, v.receipt_hash
                 FROM consent_versions v
                 JOIN enrollments e ON e.id = v.enrollment_id
                 WHERE e.study_id = ?1
                 ORDER BY v.enrollment_id, v.version",
            )?;
            let versions = stmt
                .query_map(params![study_id.as_str()], row_to_version)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(versions)
        })
        .await
    }

    async fn audit_tail(&self, study_id: &StudyId) -> Result<Option<Blake3Hash>> {
        let study_id = study_id.clone();
        self.call(move |conn| read_audit_tail(conn, &study_id)).await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<AppendResult> {
        let entry = entry.clone();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if entry.link.is_linked() {
                let tail = read_audit_tail(&tx, &entry.study_id)?;
                if entry.prev_hash() != tail {
                    return Ok(AppendResult::TailMoved { tail });
                }
            }

            match insert_audit(&tx, &entry) {
                Ok(index) => {
                    tx.commit()?;
                    Ok(AppendResult::Appended { index })
                }
                Err(e) if is_constraint_violation(&e) => {
                    drop(tx);
                    let tail = read_audit_tail(conn, &entry.study_id)?;
                    Ok(AppendResult::TailMoved { tail })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn list_audit(&self, study_id: &StudyId) -> Result<Vec<AuditEntry>> {
        let study_id = study_id.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT study_id, actor_role, actor_id, action, details, created_at,
                        linked, prev_hash, entry_hash
                 FROM audit_entries WHERE study_id = ?1
                 ORDER BY seq",
            )?;
            let entries = stmt
                .query_map(params![study_id.as_str()], row_to_audit)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn commit(&self, write: &RowWrite, entry: &AuditEntry) -> Result<CommitResult> {
        let write = write.clone();
        let entry = entry.clone();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if entry.link.is_linked() {
                let tail = read_audit_tail(&tx, &entry.study_id)?;
                if entry.prev_hash() != tail {
                    return Ok(CommitResult::TailMoved { tail });
                }
            }

            // Dropping `tx` on any early return rolls the row back.
            if !apply_write(&tx, &write)? {
                return Ok(CommitResult::SlotTaken);
            }

            match insert_audit(&tx, &entry) {
                Ok(index) => {
                    tx.commit()?;
                    Ok(CommitResult::Committed { index })
                }
                Err(e) if is_constraint_violation(&e) => {
                    drop(tx);
                    let tail = read_audit_tail(conn, &entry.study_id)?;
                    Ok(CommitResult::TailMoved { tail })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consent_core::{
        builtin_catalog, chain_tail, verify_chain, AuditBuilder, PermissionTemplate,
    };
    use serde_json::json;

    fn decisions(keys: &[&str]) -> DecisionSet {
        keys.iter().map(|k| PermKey::from(*k)).collect()
    }

    async fn commit_linked(
        store: &SqliteStore,
        study: &StudyId,
        action: AuditAction,
        write: RowWrite,
    ) -> CommitResult {
        let tail = store.audit_tail(study).await.unwrap();
        let entry = AuditBuilder::new(study.clone(), action).timestamp(1).link(tail);
        store.commit(&write, &entry).await.unwrap()
    }

    #[tokio::test]
    async fn test_template_roundtrip_and_idempotent_insert() {
        let store = SqliteStore::open_memory().unwrap();
        let template = PermissionTemplate::custom("gps", "Location")
            .description("Coarse location")
            .pii_level(PiiLevel::Identifiable)
            .required(true);

        assert_eq!(store.insert_template(&template).await.unwrap(), InsertResult::Inserted);
        assert_eq!(
            store.insert_template(&template).await.unwrap(),
            InsertResult::AlreadyExists
        );

        let loaded = store.get_template(&"gps".into()).await.unwrap().unwrap();
        assert_eq!(loaded, template);

        assert!(store
            .update_template_description(&"gps".into(), "Precise location")
            .await
            .unwrap());
        assert!(!store
            .update_template_description(&"nope".into(), "x")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_bound_permissions_join() {
        let store = SqliteStore::open_memory().unwrap();
        for template in builtin_catalog() {
            store.insert_template(&template).await.unwrap();
        }
        let demographics = store.get_template(&"demographics".into()).await.unwrap().unwrap();
        let contact = store.get_template(&"contact-info".into()).await.unwrap().unwrap();

        let study: StudyId = "s".into();
        commit_linked(
            &store,
            &study,
            AuditAction::PermissionBound,
            RowWrite::Binding(StudyPermissionBinding::new(study.clone(), contact.id).display_order(2)),
        )
        .await;
        commit_linked(
            &store,
            &study,
            AuditAction::PermissionBound,
            RowWrite::Binding(
                StudyPermissionBinding::new(study.clone(), demographics.id)
                    .required(true)
                    .display_order(1),
            ),
        )
        .await;

        let bound = store.list_bound_permissions(&study).await.unwrap();
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0].key().as_str(), "demographics");
        assert!(bound[0].is_required());
        assert_eq!(bound[1].binding.required, None);
        assert!(bound[1].is_sensitive());
    }

    #[tokio::test]
    async fn test_enrollment_upsert_keeps_one_row() {
        let store = SqliteStore::open_memory().unwrap();
        let study: StudyId = "s".into();
        let user: UserId = "u".into();
        let enrolled = consent_core::enrollment::enroll(None, &study, &user, 10)
            .unwrap()
            .into_enrollment();
        commit_linked(&store, &study, AuditAction::Enroll, RowWrite::Enrollment(enrolled.clone())).await;

        let withdrawn = consent_core::enrollment::unenroll(Some(&enrolled), 20).unwrap();
        commit_linked(
            &store,
            &study,
            AuditAction::Unenroll,
            RowWrite::Enrollment(withdrawn.clone()),
        )
        .await;

        let rows = store.list_enrollments(&study).await.unwrap();
        assert_eq!(rows, vec![withdrawn.clone()]);
        assert_eq!(store.get_enrollment(&study, &user).await.unwrap(), Some(withdrawn));
    }

    #[tokio::test]
    async fn test_version_slot_and_listing() {
        let store = SqliteStore::open_memory().unwrap();
        let study: StudyId = "s".into();
        let enrollment = EnrollmentId::derive(&study, &"u".into());
        let save = |v: &ConsentVersion| RowWrite::Version(v.clone());

        let v1 = ConsentVersion::new(enrollment, 1, decisions(&["a", "r"]), 100);
        assert_eq!(
            commit_linked(&store, &study, AuditAction::VersionSaved, save(&v1)).await,
            CommitResult::Committed { index: 0 }
        );

        let rival = ConsentVersion::new(enrollment, 1, decisions(&["r"]), 101);
        assert_eq!(
            commit_linked(&store, &study, AuditAction::VersionSaved, save(&rival)).await,
            CommitResult::SlotTaken
        );
        assert_eq!(store.list_audit(&study).await.unwrap().len(), 1);

        let v2 = ConsentVersion::new(enrollment, 2, decisions(&["b", "r"]), 200);
        commit_linked(&store, &study, AuditAction::VersionSaved, save(&v2)).await;

        let listed = store.list_versions(&enrollment).await.unwrap();
        assert_eq!(listed, vec![v2.clone(), v1.clone()]);
        assert_eq!(store.latest_version_number(&enrollment).await.unwrap(), 2);
        assert_eq!(
            store
                .get_version(&enrollment, VersionSelector::Id(v2.id))
                .await
                .unwrap(),
            Some(v2)
        );

        let other = EnrollmentId::derive(&"s".into(), &"v".into());
        assert_eq!(
            store
                .get_version(&other, VersionSelector::Id(v1.id))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_stale_commit_rolls_back_row() {
        let store = SqliteStore::open_memory().unwrap();
        let study: StudyId = "s".into();
        let grant = PermissionGrant {
            study_id: study.clone(),
            user_id: "u".into(),
            perm_key: "a".into(),
            granted: true,
            updated_at: 5,
        };

        let first = AuditBuilder::new(study.clone(), AuditAction::Enroll)
            .timestamp(1)
            .link(None);
        store.append_audit(&first).await.unwrap();

        let stale = AuditBuilder::new(study.clone(), AuditAction::PermissionChanged)
            .timestamp(2)
            .link(None);
        assert_eq!(
            store.commit(&RowWrite::Grant(grant.clone()), &stale).await.unwrap(),
            CommitResult::TailMoved {
                tail: first.entry_hash()
            }
        );
        assert!(store.list_grants(&study, &"u".into()).await.unwrap().is_empty());
        assert_eq!(store.list_audit(&study).await.unwrap(), vec![first.clone()]);

        let relinked = AuditBuilder::new(study.clone(), AuditAction::PermissionChanged)
            .timestamp(2)
            .link(first.entry_hash());
        assert_eq!(
            store.commit(&RowWrite::Grant(grant.clone()), &relinked).await.unwrap(),
            CommitResult::Committed { index: 1 }
        );
        assert_eq!(store.list_grants(&study, &"u".into()).await.unwrap(), vec![grant]);
    }

    #[tokio::test]
    async fn test_audit_chain_roundtrip() {
        let store = SqliteStore::open_memory().unwrap();
        let study: StudyId = "s".into();

        let first = AuditBuilder::new(study.clone(), AuditAction::Enroll)
            .actor(ActorRole::Participant, "u".into())
            .details(json!({"status": "ENROLLED", "nested": {"b": 1, "a": [1, 2]}}))
            .timestamp(10)
            .link(None);
        store.append_audit(&first).await.unwrap();

        store
            .append_audit(
                &AuditBuilder::new(study.clone(), AuditAction::RetentionPurge)
                    .details(json!({"files": 2}))
                    .timestamp(11)
                    .detach(),
            )
            .await
            .unwrap();

        let tail = store.audit_tail(&study).await.unwrap();
        assert_eq!(tail, first.entry_hash());

        let second = AuditBuilder::new(study.clone(), AuditAction::Unenroll)
            .actor(ActorRole::Participant, "u".into())
            .timestamp(12)
            .link(tail);
        assert_eq!(
            store.append_audit(&second).await.unwrap(),
            AppendResult::Appended { index: 2 }
        );

        let stale = AuditBuilder::new(study.clone(), AuditAction::Enroll).link(tail);
        assert_eq!(
            store.append_audit(&stale).await.unwrap(),
            AppendResult::TailMoved {
                tail: second.entry_hash()
            }
        );

        let log = store.list_audit(&study).await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0], first);
        assert_eq!(verify_chain(&log), Ok(2));
        assert_eq!(chain_tail(&log), second.entry_hash());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consent.db");

        let study = Study::new("s", "owner", "Sleep study");
        let recruiting = RowWrite::StudyStatus {
            study_id: study.id.clone(),
            status: StudyStatus::Recruiting,
        };
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_study(&study).await.unwrap();
            commit_linked(&store, &study.id, AuditAction::StudyUnarchived, recruiting).await;
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get_study(&study.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, StudyStatus::Recruiting);
        assert_eq!(store.list_audit(&study.id).await.unwrap().len(), 1);

        let missing: StudyId = "missing".into();
        let archive = RowWrite::StudyStatus {
            study_id: missing.clone(),
            status: StudyStatus::Archived,
        };
        let entry = AuditBuilder::new(missing.clone(), AuditAction::StudyArchived).link(None);
        assert!(matches!(
            store.commit(&archive, &entry).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.list_audit(&missing).await.unwrap().is_empty());
    }
}
