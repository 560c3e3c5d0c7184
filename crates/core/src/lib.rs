//! termbranch core library.
//!
//! Task-branch lifecycle for versioned object repositories: branches are
//! prepared from their parent, synchronized with parent changes, promoted
//! back as fast-forwards, and reverted to earlier states. Conflicts between
//! branch changesets are detected structurally and by pluggable per-kind
//! processors; every operation runs under non-blocking branch locks.

pub mod action;
pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod models;
pub mod object;
pub mod service;
pub mod store;

// Re-exports for convenience.
pub use action::{ActionKind, ActionReport, EmptyOperation};
pub use config::AppConfig;
pub use conflict::{ConflictProcessor, ConflictProcessorBroker};
pub use db::Database;
pub use errors::BranchError;
pub use lock::{InMemoryLockManager, LockManager};
pub use manager::BranchManager;
pub use models::{BranchPath, BranchPathMap, BranchPoint};
pub use service::BranchService;
pub use store::{RevisionStore, SqliteRevisionStore};
