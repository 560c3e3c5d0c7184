//! SQLite handle shared by the revision store and the audit trail.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::errors::StoreError;

/// Path value selecting a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database at `path`, or an in-memory one for [`MEMORY_PATH`].
    /// File databases run in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path == Path::new(MEMORY_PATH) {
            return Self::in_memory();
        }
        info!(path = %path.display(), "opening revision database");
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bring the schema up to date.
    pub fn initialize(&self) -> Result<(), StoreError> {
        schema::run_migrations(&self.conn())?;
        debug!("revision schema ready");
        Ok(())
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("revision database mutex poisoned");
            poisoned.into_inner()
        })
    }

    /// Run `f` in an immediate transaction, committing only when it succeeds.
    /// A competing writer surfaces as `SQLITE_BUSY` before anything is written.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

/// Whether another connection holds the write lock.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}
