//! Typed query helpers for every table in the revision database.
//!
//! Helpers that must run inside a caller-owned SQLite transaction are free
//! functions over a `&Connection`; the rest are methods on [`Database`].

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::Database;
use crate::conflict::Conflict;
use crate::errors::StoreError;
use crate::models::{self, Branch, BranchPath, CommitInfo, Timestamp, NO_COMMIT};

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `repositories` table.
#[derive(Debug, Clone)]
pub struct RepositoryEntry {
    pub id: String,
    pub kind: String,
    pub created_at: String,
}

/// The newest revision of one object on one branch instance.
#[derive(Debug, Clone)]
pub struct RevisionRow {
    pub object_id: String,
    pub kind: String,
    pub version: i64,
    pub timestamp: Timestamp,
    pub detached: bool,
    pub payload: Option<String>,
}

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub user_id: String,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

/// A row from the `conflicts` table.
#[derive(Debug, Clone)]
pub struct ConflictEntry {
    pub id: String,
    pub repository_id: String,
    pub branch_path: String,
    pub component_id: String,
    pub kind: String,
    pub message: String,
    pub detected_at: String,
}

fn branch_from_row(row: &Row<'_>) -> rusqlite::Result<Branch> {
    let path: String = row.get(2)?;
    let path = BranchPath::parse(&path)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(Branch {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        path,
        parent_id: row.get(3)?,
        base_timestamp: row.get(4)?,
    })
}

const BRANCH_COLUMNS: &str = "id, repository_id, path, parent_id, base_timestamp";

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside a transaction)
// ---------------------------------------------------------------------------

/// Issue the next logical timestamp: `max(now, last + 1)` in milliseconds.
pub fn next_timestamp(conn: &Connection) -> Result<Timestamp, StoreError> {
    let last: Timestamp =
        conn.query_row("SELECT last_timestamp FROM clock WHERE id = 1", [], |row| {
            row.get(0)
        })?;
    let next = Utc::now().timestamp_millis().max(last + 1);
    conn.execute(
        "UPDATE clock SET last_timestamp = ?1 WHERE id = 1",
        params![next],
    )?;
    Ok(next)
}

/// Last timestamp the clock issued.
pub fn current_timestamp(conn: &Connection) -> Result<Timestamp, StoreError> {
    let last = conn.query_row("SELECT last_timestamp FROM clock WHERE id = 1", [], |row| {
        row.get(0)
    })?;
    Ok(last)
}

pub fn repository_kind(conn: &Connection, repository_id: &str) -> Result<Option<String>, StoreError> {
    let kind = conn
        .query_row(
            "SELECT kind FROM repositories WHERE id = ?1",
            params![repository_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(kind)
}

/// Insert a new branch instance and return it.
pub fn insert_branch(
    conn: &Connection,
    repository_id: &str,
    path: &BranchPath,
    parent_id: Option<i64>,
    base_timestamp: Timestamp,
) -> Result<Branch, StoreError> {
    conn.execute(
        "INSERT INTO branches (repository_id, path, parent_id, base_timestamp, superseded, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![
            repository_id,
            path.as_str(),
            parent_id,
            base_timestamp,
            Utc::now().to_rfc3339()
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, repository_id, branch = %path, base_timestamp, "inserted branch");
    Ok(Branch {
        id,
        repository_id: repository_id.to_string(),
        path: path.clone(),
        parent_id,
        base_timestamp,
    })
}

/// Mark every live instance of a path as superseded. Returns the count.
pub fn supersede_branches(
    conn: &Connection,
    repository_id: &str,
    path: &BranchPath,
) -> Result<usize, StoreError> {
    let count = conn.execute(
        "UPDATE branches SET superseded = 1
         WHERE repository_id = ?1 AND path = ?2 AND superseded = 0",
        params![repository_id, path.as_str()],
    )?;
    Ok(count)
}

/// The live instance of a branch path.
pub fn live_branch(
    conn: &Connection,
    repository_id: &str,
    path: &BranchPath,
) -> Result<Option<Branch>, StoreError> {
    let sql = format!(
        "SELECT {BRANCH_COLUMNS} FROM branches
         WHERE repository_id = ?1 AND path = ?2 AND superseded = 0
         ORDER BY id DESC LIMIT 1"
    );
    let branch = conn
        .query_row(&sql, params![repository_id, path.as_str()], branch_from_row)
        .optional()?;
    Ok(branch)
}

/// The instance of a branch path that was live at `timestamp`.
///
/// Points before the first instance resolve to the first instance, whose
/// reads then fall through to its parent.
pub fn branch_at(
    conn: &Connection,
    repository_id: &str,
    path: &BranchPath,
    timestamp: Timestamp,
) -> Result<Option<Branch>, StoreError> {
    let sql = format!(
        "SELECT {BRANCH_COLUMNS} FROM branches
         WHERE repository_id = ?1 AND path = ?2 AND base_timestamp <= ?3
         ORDER BY base_timestamp DESC, id DESC LIMIT 1"
    );
    let found = conn
        .query_row(
            &sql,
            params![repository_id, path.as_str(), timestamp],
            branch_from_row,
        )
        .optional()?;
    if found.is_some() {
        return Ok(found);
    }

    let sql = format!(
        "SELECT {BRANCH_COLUMNS} FROM branches
         WHERE repository_id = ?1 AND path = ?2
         ORDER BY base_timestamp ASC, id ASC LIMIT 1"
    );
    let first = conn
        .query_row(&sql, params![repository_id, path.as_str()], branch_from_row)
        .optional()?;
    Ok(first)
}

pub fn branch_by_id(conn: &Connection, id: i64) -> Result<Option<Branch>, StoreError> {
    let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?1");
    let branch = conn.query_row(&sql, params![id], branch_from_row).optional()?;
    Ok(branch)
}

/// Newest commit time on a branch instance, or [`NO_COMMIT`].
pub fn last_commit_time(conn: &Connection, branch_id: i64) -> Result<Timestamp, StoreError> {
    let max: Option<Timestamp> = conn.query_row(
        "SELECT MAX(timestamp) FROM commits WHERE branch_id = ?1",
        params![branch_id],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(NO_COMMIT))
}

/// Newest revision of every object on a branch instance up to `timestamp`.
pub fn latest_revisions(
    conn: &Connection,
    branch_id: i64,
    timestamp: Timestamp,
) -> Result<Vec<RevisionRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT r.object_id, r.kind, r.version, r.timestamp, r.detached, r.payload
         FROM revisions r
         WHERE r.branch_id = ?1 AND r.timestamp <= ?2
           AND r.version = (
               SELECT MAX(r2.version) FROM revisions r2
               WHERE r2.object_id = r.object_id AND r2.branch_id = r.branch_id
                 AND r2.timestamp <= ?2
           )
         ORDER BY r.object_id",
    )?;
    let rows = stmt
        .query_map(params![branch_id, timestamp], |row| {
            Ok(RevisionRow {
                object_id: row.get(0)?,
                kind: row.get(1)?,
                version: row.get(2)?,
                timestamp: row.get(3)?,
                detached: row.get(4)?,
                payload: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Append a revision; the version is one past the object's newest version
/// on that branch instance.
#[allow(clippy::too_many_arguments)]
pub fn insert_revision(
    conn: &Connection,
    object_id: &str,
    branch_id: i64,
    timestamp: Timestamp,
    kind: &str,
    detached: bool,
    payload: Option<&str>,
    commit_id: &str,
) -> Result<i64, StoreError> {
    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM revisions
         WHERE object_id = ?1 AND branch_id = ?2",
        params![object_id, branch_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO revisions (object_id, branch_id, version, timestamp, kind, detached, payload, commit_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![object_id, branch_id, version, timestamp, kind, detached, payload, commit_id],
    )?;
    Ok(version)
}

pub fn insert_commit(
    conn: &Connection,
    commit: &CommitInfo,
    branch_id: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO commits (id, repository_id, branch_id, branch_path, timestamp, user_id, comment)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            commit.id,
            commit.repository_id,
            branch_id,
            commit.branch.as_str(),
            commit.timestamp,
            commit.user_id,
            commit.comment
        ],
    )?;
    debug!(
        id = %commit.id,
        repository_id = %commit.repository_id,
        branch = %commit.branch,
        timestamp = commit.timestamp,
        "inserted commit"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- repositories -------------------------------------------------------

    /// Register a repository; an existing registration keeps its kind.
    pub fn insert_repository(&self, id: &str, kind: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO repositories (id, kind, created_at) VALUES (?1, ?2, ?3)",
            params![id, kind, Utc::now().to_rfc3339()],
        )?;
        debug!(id, kind, inserted, "registered repository");
        Ok(inserted > 0)
    }

    pub fn get_repository(&self, id: &str) -> Result<Option<RepositoryEntry>, StoreError> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                "SELECT id, kind, created_at FROM repositories WHERE id = ?1",
                params![id],
                |row| {
                    Ok(RepositoryEntry {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    pub fn list_repositories(&self) -> Result<Vec<RepositoryEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, kind, created_at FROM repositories ORDER BY id")?;
        let entries = stmt
            .query_map([], |row| {
                Ok(RepositoryEntry {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- branches -----------------------------------------------------------

    /// Every instance of every branch in a repository, oldest first.
    pub fn list_branches(&self, repository_id: &str) -> Result<Vec<Branch>, StoreError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {BRANCH_COLUMNS} FROM branches WHERE repository_id = ?1 ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let branches = stmt
            .query_map(params![repository_id], branch_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(branches)
    }

    // -- commits ------------------------------------------------------------

    /// Commits on every instance of a branch path, oldest first.
    pub fn list_commits(
        &self,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<Vec<CommitInfo>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, repository_id, branch_path, timestamp, user_id, comment
             FROM commits WHERE repository_id = ?1 AND branch_path = ?2
             ORDER BY timestamp",
        )?;
        let commits = stmt
            .query_map(params![repository_id, path.as_str()], |row| {
                Ok(CommitInfo {
                    id: row.get(0)?,
                    repository_id: row.get(1)?,
                    branch: path.clone(),
                    timestamp: row.get(3)?,
                    user_id: row.get(4)?,
                    comment: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(commits)
    }

    pub fn count_commits(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM commits", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_revisions(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM revisions", [], |row| row.get(0))?;
        Ok(count)
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit entry from a model struct.
    pub fn insert_audit_entry(&self, entry: &models::AuditEntry) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, user_id, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.action,
                entry.user_id,
                entry.details,
                entry.success,
                entry.timestamp.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action = %entry.action, success = entry.success, "inserted audit_log entry");
        Ok(id)
    }

    /// List recent audit-log entries, newest first.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, user_id, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    user_id: row.get(2)?,
                    details: row.get(3)?,
                    success: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn count_audit_log(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }

    // -- conflicts ----------------------------------------------------------

    /// Record a detected conflict against the branch it was found on.
    pub fn insert_conflict(&self, conflict: &Conflict, branch_path: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO conflicts
                (id, repository_id, branch_path, component_id, kind, message, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conflict.id,
                conflict.repository_id,
                branch_path,
                conflict.component_id,
                conflict.kind.as_str(),
                conflict.message,
                Utc::now().to_rfc3339()
            ],
        )?;
        debug!(id = %conflict.id, kind = conflict.kind.as_str(), "inserted conflict");
        Ok(())
    }

    /// Conflicts recorded for a repository, oldest first.
    pub fn list_conflicts(&self, repository_id: &str) -> Result<Vec<ConflictEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, repository_id, branch_path, component_id, kind, message, detected_at
             FROM conflicts WHERE repository_id = ?1 ORDER BY detected_at, rowid",
        )?;
        let entries = stmt
            .query_map(params![repository_id], |row| {
                Ok(ConflictEntry {
                    id: row.get(0)?,
                    repository_id: row.get(1)?,
                    branch_path: row.get(2)?,
                    component_id: row.get(3)?,
                    kind: row.get(4)?,
                    message: row.get(5)?,
                    detected_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictKind;
    use crate::models::AuditEntry;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let db = setup_db();
        let conn = db.conn();
        let a = next_timestamp(&conn).unwrap();
        let b = next_timestamp(&conn).unwrap();
        assert!(b > a);
        assert_eq!(current_timestamp(&conn).unwrap(), b);
    }

    #[test]
    fn test_repository_registration() {
        let db = setup_db();
        assert!(db.insert_repository("snomedStore", "snomed").unwrap());
        assert!(!db.insert_repository("snomedStore", "other").unwrap());
        let repo = db.get_repository("snomedStore").unwrap().unwrap();
        assert_eq!(repo.kind, "snomed");
        assert_eq!(db.list_repositories().unwrap().len(), 1);
        assert!(db.get_repository("missing").unwrap().is_none());
    }

    #[test]
    fn test_branch_instances() {
        let db = setup_db();
        db.insert_repository("r", "k").unwrap();
        let conn = db.conn();
        let main = insert_branch(&conn, "r", &BranchPath::main(), None, 0).unwrap();
        let task = BranchPath::parse("MAIN/task").unwrap();
        let first = insert_branch(&conn, "r", &task, Some(main.id), 100).unwrap();

        assert_eq!(supersede_branches(&conn, "r", &task).unwrap(), 1);
        let second = insert_branch(&conn, "r", &task, Some(main.id), 200).unwrap();

        assert_eq!(live_branch(&conn, "r", &task).unwrap().unwrap().id, second.id);
        assert_eq!(branch_at(&conn, "r", &task, 150).unwrap().unwrap().id, first.id);
        assert_eq!(branch_at(&conn, "r", &task, 250).unwrap().unwrap().id, second.id);
        assert_eq!(branch_at(&conn, "r", &task, 50).unwrap().unwrap().id, first.id);
        assert_eq!(branch_by_id(&conn, main.id).unwrap().unwrap().path, BranchPath::main());
    }

    #[test]
    fn test_revisions_and_commits() {
        let db = setup_db();
        db.insert_repository("r", "k").unwrap();
        let conn = db.conn();
        let main = insert_branch(&conn, "r", &BranchPath::main(), None, 0).unwrap();
        assert_eq!(last_commit_time(&conn, main.id).unwrap(), NO_COMMIT);

        assert_eq!(insert_revision(&conn, "c1", main.id, 10, "concept", false, Some("{}"), "x").unwrap(), 1);
        assert_eq!(insert_revision(&conn, "c1", main.id, 20, "concept", true, None, "y").unwrap(), 2);

        let at_15 = latest_revisions(&conn, main.id, 15).unwrap();
        assert_eq!(at_15.len(), 1);
        assert!(!at_15[0].detached);
        let at_25 = latest_revisions(&conn, main.id, 25).unwrap();
        assert!(at_25[0].detached);

        let commit = CommitInfo {
            id: "x".into(),
            repository_id: "r".into(),
            branch: BranchPath::main(),
            timestamp: 20,
            user_id: "alice".into(),
            comment: "seed".into(),
        };
        insert_commit(&conn, &commit, main.id).unwrap();
        assert_eq!(last_commit_time(&conn, main.id).unwrap(), 20);
    }

    #[test]
    fn test_audit_log() {
        let db = setup_db();
        db.insert_audit_entry(&AuditEntry::success("promote", "alice", "MAIN/task"))
            .unwrap();
        db.insert_audit_entry(&AuditEntry::failure("synchronize", "bob", "conflict"))
            .unwrap();
        let entries = db.list_audit_log(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "synchronize");
        assert!(!entries[0].success);
        assert_eq!(db.count_audit_log().unwrap(), 2);
    }

    #[test]
    fn test_conflict_records() {
        let db = setup_db();
        let conflict = Conflict::new("r", "c1", ConflictKind::AddedInBoth, "duplicate");
        db.insert_conflict(&conflict, "MAIN/task").unwrap();
        let entries = db.list_conflicts("r").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, "ADDED_IN_BOTH");
        assert_eq!(entries[0].branch_path, "MAIN/task");
        assert!(db.list_conflicts("other").unwrap().is_empty());
    }
}
