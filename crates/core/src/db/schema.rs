//! Database schema definitions and migration runner.
//!
//! Migrations are plain SQL strings applied in order. The SQLite
//! `user_version` pragma records which migrations have already run.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::StoreError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "revision store",
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id          TEXT PRIMARY KEY,
            kind        TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS branches (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            repository_id   TEXT    NOT NULL REFERENCES repositories (id),
            path            TEXT    NOT NULL,
            parent_id       INTEGER REFERENCES branches (id),
            base_timestamp  INTEGER NOT NULL,
            superseded      INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_branches_path ON branches (repository_id, path, superseded);

        CREATE TABLE IF NOT EXISTS revisions (
            object_id   TEXT    NOT NULL,
            branch_id   INTEGER NOT NULL REFERENCES branches (id),
            version     INTEGER NOT NULL,
            timestamp   INTEGER NOT NULL,
            kind        TEXT    NOT NULL,
            detached    INTEGER NOT NULL DEFAULT 0,
            payload     TEXT,
            commit_id   TEXT    NOT NULL,
            PRIMARY KEY (object_id, branch_id, version)
        );

        CREATE INDEX IF NOT EXISTS idx_revisions_branch_time ON revisions (branch_id, timestamp);

        CREATE TABLE IF NOT EXISTS commits (
            id              TEXT    PRIMARY KEY,
            repository_id   TEXT    NOT NULL REFERENCES repositories (id),
            branch_id       INTEGER NOT NULL REFERENCES branches (id),
            branch_path     TEXT    NOT NULL,
            timestamp       INTEGER NOT NULL,
            user_id         TEXT    NOT NULL,
            comment         TEXT    NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_commits_branch_time ON commits (branch_id, timestamp);

        CREATE TABLE IF NOT EXISTS clock (
            id              INTEGER PRIMARY KEY CHECK (id = 1),
            last_timestamp  INTEGER NOT NULL
        );

        INSERT OR IGNORE INTO clock (id, last_timestamp) VALUES (1, 0);
        "#,
    ),
    (
        2,
        "audit log and conflict records",
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT    NOT NULL,
            user_id     TEXT    NOT NULL,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action);
        CREATE INDEX IF NOT EXISTS idx_audit_log_success ON audit_log (success);

        CREATE TABLE IF NOT EXISTS conflicts (
            id              TEXT PRIMARY KEY,
            repository_id   TEXT NOT NULL,
            branch_path     TEXT NOT NULL,
            component_id    TEXT NOT NULL,
            kind            TEXT NOT NULL,
            message         TEXT NOT NULL,
            detected_at     TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conflicts_repository ON conflicts (repository_id);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| StoreError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32, StoreError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), StoreError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
