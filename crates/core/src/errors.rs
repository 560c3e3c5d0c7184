//! Error types for the termbranch core library.
//!
//! Each subsystem has its own error type derived with `thiserror`. The
//! operation-level [`BranchError`] is what every prepare / synchronize /
//! promote / revert call returns to its caller.

use thiserror::Error;

use crate::conflict::{Conflict, ConflictReport};

// ---------------------------------------------------------------------------
// Branch operation errors
// ---------------------------------------------------------------------------

/// Errors surfaced by branch-mutating operations and branch queries.
#[derive(Debug, Error)]
pub enum BranchError {
    /// Immediate lock acquisition failed; nothing was mutated.
    #[error("lock contention: {0}")]
    LockContention(#[source] LockError),

    /// The referenced branch does not exist in the repository.
    #[error("branch '{path}' not found in repository '{repository_id}'")]
    BranchNotFound {
        repository_id: String,
        path: String,
    },

    /// The parent of the referenced branch does not exist.
    #[error("parent branch '{path}' not found in repository '{repository_id}'")]
    ParentNotFound {
        repository_id: String,
        path: String,
    },

    /// No repository is registered under the given identifier.
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// The branch is not a strict fast-forward of its parent.
    #[error(
        "modifications have been made on the '{parent}' branch in repository '{repository_id}', \
         '{path}' cannot be promoted. Please synchronize changes and try again."
    )]
    NotSynchronized {
        repository_id: String,
        path: String,
        parent: String,
    },

    /// One or more structural or domain conflicts were detected.
    #[error("{0}")]
    MergeConflict(ConflictReport),

    /// A conflict processor refused a post-merge cleanup.
    #[error("domain conflict: {}", .0.message)]
    DomainConflict(Conflict),

    /// The underlying repository is write-locked by another client.
    #[error("repository '{0}' is locked by another client, try again later")]
    RepositoryLocked(String),

    /// The commit step failed for a reason other than conflicts.
    #[error("commit failed: {0}")]
    CommitFailure(#[source] StoreError),

    /// A branch path string could not be parsed.
    #[error("invalid branch path '{path}': {detail}")]
    InvalidBranchPath {
        path: String,
        detail: String,
    },

    /// Any other revision store failure.
    #[error(transparent)]
    Store(StoreError),
}

impl BranchError {
    /// Whether the caller can reasonably retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockContention(_) | Self::RepositoryLocked(_) | Self::NotSynchronized { .. }
        )
    }

    /// The conflicts carried by this error, if any.
    pub fn conflicts(&self) -> &[Conflict] {
        match self {
            Self::MergeConflict(report) => &report.conflicts,
            Self::DomainConflict(conflict) => std::slice::from_ref(conflict),
            _ => &[],
        }
    }
}

impl From<StoreError> for BranchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BranchNotFound {
                repository_id,
                path,
            } => Self::BranchNotFound {
                repository_id,
                path,
            },
            StoreError::ParentNotFound {
                repository_id,
                path,
            } => Self::ParentNotFound {
                repository_id,
                path,
            },
            StoreError::RepositoryNotFound(id) => Self::RepositoryNotFound(id),
            StoreError::RepositoryLocked(id) => Self::RepositoryLocked(id),
            other => Self::Store(other),
        }
    }
}

impl From<LockError> for BranchError {
    fn from(err: LockError) -> Self {
        Self::LockContention(err)
    }
}

// ---------------------------------------------------------------------------
// Revision store errors
// ---------------------------------------------------------------------------

/// Errors from the revision store and its SQLite persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// An object payload could not be encoded or decoded.
    #[error("object payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed {
        version: u32,
        detail: String,
    },

    /// The requested repository is not registered.
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// The requested branch does not exist.
    #[error("branch '{path}' not found in repository '{repository_id}'")]
    BranchNotFound {
        repository_id: String,
        path: String,
    },

    /// The parent of a branch to be created does not exist.
    #[error("parent branch '{path}' not found in repository '{repository_id}'")]
    ParentNotFound {
        repository_id: String,
        path: String,
    },

    /// A delta referenced an object that is not visible at the branch point.
    #[error("object '{object_id}' not found on branch '{branch}'")]
    ObjectNotFound {
        object_id: String,
        branch: String,
    },

    /// The branch advanced after the transaction was opened.
    #[error(
        "branch '{branch}' in repository '{repository_id}' advanced since the transaction was \
         opened (expected last commit {expected}, found {actual})"
    )]
    StaleHead {
        repository_id: String,
        branch: String,
        expected: i64,
        actual: i64,
    },

    /// The repository is write-locked by another client.
    #[error("repository '{0}' is locked by another client")]
    RepositoryLocked(String),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Lock errors
// ---------------------------------------------------------------------------

/// Errors from the lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    /// A requested target is already held.
    #[error("{target} is locked by '{holder}' ({description})")]
    Contention {
        target: String,
        holder: String,
        description: String,
    },

    /// The lock table could not be consulted (a previous holder panicked).
    #[error("lock acquisition interrupted")]
    Interrupted,

    /// Attempted to release a target that the context does not hold.
    #[error("{target} is not held by '{user_id}'")]
    NotHeld {
        target: String,
        user_id: String,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    Io(#[from] std::io::Error),
}
