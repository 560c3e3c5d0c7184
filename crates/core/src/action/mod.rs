//! Branch action framework.
//!
//! A [`BranchAction`] is run over a [`BranchPathMap`] by the
//! [`BranchActionRunner`], which:
//!
//! 1. filters the applicable `(repository, branch)` entries;
//! 2. locks every applicable branch and its parent in one non-blocking batch;
//! 3. calls [`BranchAction::apply`] for each entry, in map order;
//! 4. calls [`BranchAction::post_run`] (usually the commit);
//! 5. releases every lock it acquired, on every exit path;
//! 6. hands the outcome to the registered [`PostRunHook`]s.

pub mod commit;
pub mod hooks;
pub mod prepare;
pub mod promote;
pub mod synchronize;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::BranchError;
use crate::lock::{LockContext, LockManager, LockTarget};
use crate::manager::BranchManager;
use crate::models::{BranchPath, BranchPathMap, CommitInfo};

pub use commit::{CommitBuilder, TransactionAggregator};
pub use hooks::{AuditTrail, PostRunHook};
pub use prepare::PrepareAction;
pub use promote::PromoteAction;
pub use synchronize::SynchronizeAction;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// The branch-mutating operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Prepare,
    Synchronize,
    Promote,
    Revert,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Synchronize => write!(f, "synchronize"),
            Self::Promote => write!(f, "promote"),
            Self::Revert => write!(f, "revert"),
        }
    }
}

/// Benign "nothing to do" outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyOperation {
    NothingToPromote,
    NothingToSynchronize,
    NothingToRevert,
}

impl fmt::Display for EmptyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NothingToPromote => write!(f, "Nothing to promote."),
            Self::NothingToSynchronize => write!(f, "Nothing to synchronize."),
            Self::NothingToRevert => write!(f, "Nothing to revert."),
        }
    }
}

/// Outcome of a successful branch operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionReport {
    pub action: ActionKind,
    /// Repositories whose branch was changed.
    pub processed: Vec<String>,
    pub commits: Vec<CommitInfo>,
    /// Set when the operation turned out to be a no-op.
    pub empty: Option<EmptyOperation>,
}

impl ActionReport {
    pub fn new(action: ActionKind) -> Self {
        Self {
            action,
            processed: Vec::new(),
            commits: Vec::new(),
            empty: None,
        }
    }

    pub fn empty(action: ActionKind, reason: EmptyOperation) -> Self {
        Self {
            empty: Some(reason),
            ..Self::new(action)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.empty.is_some()
    }

    /// One-line summary for logs and the audit trail.
    pub fn summary(&self) -> String {
        match self.empty {
            Some(reason) => reason.to_string(),
            None => format!(
                "{} repositories: [{}], commits: {}",
                self.action,
                self.processed.join(", "),
                self.commits.len()
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Action contract
// ---------------------------------------------------------------------------

/// One branch-mutating operation, run by [`BranchActionRunner`].
pub trait BranchAction {
    fn kind(&self) -> ActionKind;

    /// Description recorded with the locks, e.g. "Promoting changes".
    fn description(&self) -> &str;

    /// Whether an entry takes part in the operation. `MAIN` never does.
    /// An error aborts the run before anything is locked.
    fn is_applicable(
        &self,
        _manager: &BranchManager,
        _repository_id: &str,
        path: &BranchPath,
    ) -> Result<bool, BranchError> {
        Ok(!path.is_main())
    }

    /// Per-repository step, called with the locks held.
    fn apply(
        &mut self,
        manager: &BranchManager,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<(), BranchError>;

    /// Final step after every entry was applied, still under the locks.
    fn post_run(&mut self, manager: &BranchManager, user_id: &str)
        -> Result<ActionReport, BranchError>;
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Runs [`BranchAction`]s with lock orchestration and post-run hooks.
pub struct BranchActionRunner {
    manager: Arc<BranchManager>,
    locks: Arc<dyn LockManager>,
    hooks: Vec<Arc<dyn PostRunHook>>,
}

impl BranchActionRunner {
    pub fn new(manager: Arc<BranchManager>, locks: Arc<dyn LockManager>) -> Self {
        Self {
            manager,
            locks,
            hooks: Vec::new(),
        }
    }

    pub fn add_hook(&mut self, hook: Arc<dyn PostRunHook>) {
        self.hooks.push(hook);
    }

    pub fn manager(&self) -> &Arc<BranchManager> {
        &self.manager
    }

    /// Run an action over a branch path map. Every failure is returned as
    /// the single error of the run; locks are released before returning.
    pub fn run(
        &self,
        action: &mut dyn BranchAction,
        map: &BranchPathMap,
        user_id: &str,
    ) -> Result<ActionReport, BranchError> {
        let outcome = self.run_locked(action, map, user_id);

        match &outcome {
            Ok(report) => info!(
                action = %action.kind(),
                user_id,
                summary = %report.summary(),
                "branch action completed"
            ),
            Err(err) => warn!(action = %action.kind(), user_id, error = %err, "branch action failed"),
        }
        for hook in &self.hooks {
            hook.after_run(action.kind(), user_id, map, &outcome);
        }
        outcome
    }

    fn run_locked(
        &self,
        action: &mut dyn BranchAction,
        map: &BranchPathMap,
        user_id: &str,
    ) -> Result<ActionReport, BranchError> {
        let mut applicable = Vec::new();
        for (repository_id, path) in map.locked_entries() {
            if action.is_applicable(&self.manager, repository_id, path)? {
                applicable.push((repository_id, path));
            } else {
                debug!(action = %action.kind(), repository_id, branch = %path, "skipping entry");
            }
        }

        let mut targets = Vec::with_capacity(applicable.len() * 2);
        for (repository_id, path) in &applicable {
            targets.push(LockTarget::new(*repository_id, (*path).clone()));
            if let Some(parent) = path.parent() {
                targets.push(LockTarget::new(*repository_id, parent));
            }
        }

        let context = LockContext::new(user_id, action.description());
        let _release = if targets.is_empty() {
            None
        } else {
            self.locks.try_lock(&context, &targets)?;
            Some(LockRelease {
                locks: self.locks.as_ref(),
                context: &context,
                targets: &targets,
            })
        };

        for (repository_id, path) in &applicable {
            action.apply(&self.manager, repository_id, path)?;
        }
        action.post_run(&self.manager, user_id)
    }
}

/// Drop guard releasing the locks of one run, on success, error and panic.
struct LockRelease<'a> {
    locks: &'a dyn LockManager,
    context: &'a LockContext,
    targets: &'a [LockTarget],
}

impl Drop for LockRelease<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.locks.unlock(self.context, self.targets) {
            warn!(error = %err, user_id = %self.context.user_id, "failed to release branch locks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictProcessorBroker;
    use crate::lock::InMemoryLockManager;
    use crate::store::{RevisionStore, SqliteRevisionStore};

    struct Failing;

    impl BranchAction for Failing {
        fn kind(&self) -> ActionKind {
            ActionKind::Prepare
        }

        fn description(&self) -> &str {
            "Failing on purpose"
        }

        fn apply(
            &mut self,
            _manager: &BranchManager,
            repository_id: &str,
            _path: &BranchPath,
        ) -> Result<(), BranchError> {
            Err(BranchError::RepositoryNotFound(repository_id.to_string()))
        }

        fn post_run(
            &mut self,
            _manager: &BranchManager,
            _user_id: &str,
        ) -> Result<ActionReport, BranchError> {
            Ok(ActionReport::new(ActionKind::Prepare))
        }
    }

    fn runner(locks: Arc<InMemoryLockManager>) -> BranchActionRunner {
        let store = SqliteRevisionStore::in_memory().unwrap();
        store.register_repository("r", "snomed").unwrap();
        let manager = BranchManager::new(Arc::new(store), Arc::new(ConflictProcessorBroker::new()));
        BranchActionRunner::new(Arc::new(manager), locks)
    }

    #[test]
    fn test_locks_released_after_failure() {
        let locks = Arc::new(InMemoryLockManager::new());
        let runner = runner(locks.clone());
        let mut map = BranchPathMap::new();
        map.insert("r", BranchPath::parse("MAIN/task").unwrap());

        let err = runner.run(&mut Failing, &map, "alice").unwrap_err();
        assert!(matches!(err, BranchError::RepositoryNotFound(_)));
        assert!(locks.held_targets().is_empty());
    }

    #[test]
    fn test_contention_fails_before_apply() {
        let locks = Arc::new(InMemoryLockManager::new());
        let runner = runner(locks.clone());
        let holder = LockContext::new("bob", "Promoting changes");
        locks
            .try_lock(&holder, &[LockTarget::new("r", BranchPath::main())])
            .unwrap();

        let mut map = BranchPathMap::new();
        map.insert("r", BranchPath::parse("MAIN/task").unwrap());
        let err = runner.run(&mut Failing, &map, "alice").unwrap_err();
        assert!(matches!(err, BranchError::LockContention(_)));
        assert_eq!(locks.held_targets(), vec![LockTarget::new("r", BranchPath::main())]);
    }

    #[test]
    fn test_main_entries_are_never_locked() {
        let locks = Arc::new(InMemoryLockManager::new());
        let runner = runner(locks.clone());
        let mut map = BranchPathMap::new();
        map.insert("r", BranchPath::main());
        map.insert_unset("other");

        let report = runner.run(&mut Failing, &map, "alice").unwrap();
        assert_eq!(report.action, ActionKind::Prepare);
        assert!(locks.held_targets().is_empty());
    }

    #[test]
    fn test_report_summary() {
        let report = ActionReport::empty(ActionKind::Promote, EmptyOperation::NothingToPromote);
        assert!(report.is_empty());
        assert_eq!(report.summary(), "Nothing to promote.");

        let mut report = ActionReport::new(ActionKind::Synchronize);
        report.processed.push("snomedStore".into());
        assert_eq!(report.summary(), "synchronize repositories: [snomedStore], commits: 0");
    }
}
