//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            tracing::info!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Permission catalog; rows are never deleted
        CREATE TABLE permission_templates (
            id BLOB PRIMARY KEY,                  -- 32 bytes, derived from slug
            slug TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            category TEXT NOT NULL,
            pii_level TEXT NOT NULL,              -- NONE | PSEUDONYMOUS | IDENTIFIABLE
            default_required INTEGER NOT NULL,
            default_allow INTEGER NOT NULL,
            source TEXT NOT NULL                  -- BUILTIN | CUSTOM
        );

        CREATE TABLE studies (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            title TEXT NOT NULL,
            status TEXT NOT NULL
        );

        -- Per-study overrides; NULL means "use the template default"
        CREATE TABLE study_permissions (
            study_id TEXT NOT NULL,
            template_id BLOB NOT NULL REFERENCES permission_templates(id),
            required INTEGER,
            sensitive INTEGER,
            default_allow INTEGER,
            display_order INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (study_id, template_id)
        );

        CREATE TABLE enrollments (
            id BLOB PRIMARY KEY,                  -- 32 bytes, derived from (study, participant)
            study_id TEXT NOT NULL,
            participant_id TEXT NOT NULL,
            status TEXT NOT NULL,
            joined_at INTEGER,
            left_at INTEGER,
            UNIQUE (study_id, participant_id)
        );

        -- Live, mutable decisions on optional permissions
        CREATE TABLE permission_grants (
            study_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            perm_key TEXT NOT NULL,
            granted INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (study_id, user_id, perm_key)
        );

        -- Immutable snapshots
        CREATE TABLE consent_versions (
            id BLOB PRIMARY KEY,                  -- 32 bytes, derived from (enrollment, version)
            enrollment_id BLOB NOT NULL REFERENCES enrollments(id),
            version INTEGER NOT NULL CHECK (version > 0),
            created_at INTEGER NOT NULL,
            decisions BLOB NOT NULL,              -- CBOR array of permission keys
            receipt_hash BLOB NOT NULL,           -- 32 bytes, SHA-256
            UNIQUE (enrollment_id, version)
        );

        -- Hash-chained audit log, one chain per study
        CREATE TABLE audit_entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            study_id TEXT NOT NULL,
            actor_role TEXT NOT NULL,
            actor_id TEXT,                        -- NULL for system
            action TEXT NOT NULL,
            details TEXT NOT NULL,                -- canonical JSON
            created_at INTEGER NOT NULL,
            linked INTEGER NOT NULL,              -- 0 = detached
            prev_hash BLOB,                       -- NULL for the first linked entry
            entry_hash BLOB,                      -- NULL when detached
            UNIQUE (study_id, entry_hash),
            UNIQUE (study_id, prev_hash)
        );

        CREATE TRIGGER consent_versions_no_update BEFORE UPDATE ON consent_versions
        BEGIN
            SELECT RAISE(ABORT, 'consent_versions is append-only');
        END;

        CREATE TRIGGER consent_versions_no_delete BEFORE DELETE ON consent_versions
        BEGIN
            SELECT RAISE(ABORT, 'consent_versions is append-only');
        END;

        CREATE TRIGGER audit_entries_no_update BEFORE UPDATE ON audit_entries
        BEGIN
            SELECT RAISE(ABORT, 'audit_entries is append-only');
        END;

        CREATE TRIGGER audit_entries_no_delete BEFORE DELETE ON audit_entries
        BEGIN
            SELECT RAISE(ABORT, 'audit_entries is append-only');
        END;

        CREATE INDEX idx_enrollments_study ON enrollments(study_id);
        CREATE INDEX idx_grants_study ON permission_grants(study_id);
        CREATE INDEX idx_versions_enrollment ON consent_versions(enrollment_id, version);
        CREATE INDEX idx_audit_study_seq ON audit_entries(study_id, seq);
        "#,
    )?;

    Ok(())
}

/// Get current time in milliseconds.
fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
