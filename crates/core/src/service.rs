//! Request/reply operation surface.
//!
//! [`BranchService`] is what callers hold: it owns the branch manager, the
//! action runner with its lock manager, and the post-run hooks, and exposes
//! one method per branch operation or query.

use std::sync::Arc;

use tracing::{info, warn};

use crate::action::{
    ActionKind, ActionReport, AuditTrail, BranchActionRunner, CommitBuilder, EmptyOperation,
    PostRunHook, PrepareAction, PromoteAction, SynchronizeAction,
};
use crate::config::AppConfig;
use crate::db::Database;
use crate::errors::{BranchError, StoreError};
use crate::lock::LockManager;
use crate::manager::BranchManager;
use crate::models::{BranchPath, BranchPathMap, BranchPoint, CommitInfo, Timestamp};
use crate::store::{RevisionStore, SqliteRevisionStore};

pub struct BranchService {
    runner: BranchActionRunner,
    hooks: Vec<Arc<dyn PostRunHook>>,
}

impl BranchService {
    pub fn new(manager: Arc<BranchManager>, locks: Arc<dyn LockManager>) -> Self {
        Self {
            runner: BranchActionRunner::new(manager, locks),
            hooks: Vec::new(),
        }
    }

    /// Open the configured database, register the configured repositories
    /// and wire the audit trail.
    pub fn from_config(config: &AppConfig, locks: Arc<dyn LockManager>) -> Result<Self, StoreError> {
        let db = Arc::new(Database::open(&config.database.path)?);
        db.initialize()?;

        let store = SqliteRevisionStore::new(db.clone());
        for repository in &config.repositories {
            store.register_repository(&repository.id, &repository.kind)?;
        }

        let manager = BranchManager::new(Arc::new(store), Arc::new(config.build_broker()))
            .with_branching(config.branching.clone());
        let audit = AuditTrail::new(db, config.branching.persist_conflicts);

        info!(
            repositories = config.repositories.len(),
            processors = config.processors.len(),
            "branch service ready"
        );
        Ok(Self::new(Arc::new(manager), locks).with_hook(Arc::new(audit)))
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostRunHook>) -> Self {
        self.runner.add_hook(hook.clone());
        self.hooks.push(hook);
        self
    }

    pub fn manager(&self) -> &Arc<BranchManager> {
        self.runner.manager()
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Create the task branches of the map.
    pub fn prepare(&self, map: &BranchPathMap, user_id: &str) -> Result<ActionReport, BranchError> {
        self.runner.run(&mut PrepareAction::new(), map, user_id)
    }

    /// Pull parent changes into the task branches of the map.
    pub fn synchronize(
        &self,
        map: &BranchPathMap,
        user_id: &str,
        comment: Option<&str>,
    ) -> Result<ActionReport, BranchError> {
        let commit = CommitBuilder::new(user_id).comment(comment);
        self.runner
            .run(&mut SynchronizeAction::new(commit), map, user_id)
    }

    /// Fast-forward the parents of the map's task branches.
    pub fn promote(
        &self,
        map: &BranchPathMap,
        user_id: &str,
        comment: Option<&str>,
    ) -> Result<ActionReport, BranchError> {
        let commit = CommitBuilder::new(user_id).comment(comment);
        self.runner.run(&mut PromoteAction::new(commit), map, user_id)
    }

    /// Restore a branch to its state at a branch point.
    pub fn revert(&self, point: &BranchPoint, user_id: &str) -> Result<ActionReport, BranchError> {
        let outcome = self
            .manager()
            .revert(point, user_id)
            .map(|commit| revert_report(&point.repository_id, commit));
        self.finish_revert(&point.repository_id, &point.path, user_id, outcome)
    }

    /// Undo every commit of a task branch.
    pub fn revert_all_changes_on_branch(
        &self,
        repository_id: &str,
        path: &BranchPath,
        user_id: &str,
        comment: Option<&str>,
    ) -> Result<ActionReport, BranchError> {
        let outcome = self
            .manager()
            .revert_all_changes_on_branch(repository_id, path, user_id, comment)
            .map(|commit| revert_report(repository_id, commit));
        self.finish_revert(repository_id, path, user_id, outcome)
    }

    fn finish_revert(
        &self,
        repository_id: &str,
        path: &BranchPath,
        user_id: &str,
        outcome: Result<ActionReport, BranchError>,
    ) -> Result<ActionReport, BranchError> {
        match &outcome {
            Ok(report) => info!(
                action = %ActionKind::Revert,
                repository_id,
                branch = %path,
                user_id,
                summary = %report.summary(),
                "branch action completed"
            ),
            Err(err) => warn!(
                action = %ActionKind::Revert,
                repository_id,
                branch = %path,
                user_id,
                error = %err,
                "branch action failed"
            ),
        }

        let mut map = BranchPathMap::new();
        map.insert(repository_id, path.clone());
        for hook in &self.hooks {
            hook.after_run(ActionKind::Revert, user_id, &map, &outcome);
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Whether every branch of the map has seen all of its parent's changes.
    pub fn is_synchronized(&self, map: &BranchPathMap) -> Result<bool, BranchError> {
        self.manager().is_synchronized_all(map)
    }

    pub fn last_commit_time(
        &self,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<Timestamp, BranchError> {
        self.manager().last_commit_time(repository_id, path)
    }
}

fn revert_report(repository_id: &str, commit: Option<CommitInfo>) -> ActionReport {
    match commit {
        Some(commit) => {
            let mut report = ActionReport::new(ActionKind::Revert);
            report.processed.push(repository_id.to_string());
            report.commits.push(commit);
            report
        }
        None => ActionReport::empty(ActionKind::Revert, EmptyOperation::NothingToRevert),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockManager;
    use crate::object::{FeatureValue, ObjectState};

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.database.path = ":memory:".into();
        config.repositories.push(crate::config::RepositoryConfig {
            id: "snomedStore".into(),
            kind: "snomed".into(),
        });
        config
    }

    fn service() -> BranchService {
        BranchService::from_config(&config(), Arc::new(InMemoryLockManager::new())).unwrap()
    }

    fn task_map() -> BranchPathMap {
        let mut map = BranchPathMap::new();
        map.insert("snomedStore", BranchPath::parse("MAIN/task-1").unwrap());
        map
    }

    #[test]
    fn test_prepare_then_promote() {
        let service = service();
        let map = task_map();
        service.prepare(&map, "alice").unwrap();

        let store = service.manager().store().clone();
        let task = store
            .get_branch("snomedStore", &BranchPath::parse("MAIN/task-1").unwrap())
            .unwrap()
            .unwrap();
        store
            .write_objects(
                &task,
                vec![ObjectState::new("c1", "concept").with("active", FeatureValue::Bool(true))],
                &[],
                "alice",
                "edit",
            )
            .unwrap();

        let report = service.promote(&map, "alice", None).unwrap();
        assert_eq!(report.commits.len(), 1);
        assert_eq!(report.commits[0].comment, "Promoted changes");
        assert_eq!(report.commits[0].branch, BranchPath::main());

        assert!(!service.is_synchronized(&map).unwrap());
        let synced = service.synchronize(&map, "alice", None).unwrap();
        assert_eq!(synced.processed, vec!["snomedStore".to_string()]);
        assert!(synced.commits.is_empty());

        let again = service.promote(&map, "alice", None).unwrap();
        assert_eq!(again.empty, Some(EmptyOperation::NothingToPromote));
    }

    #[test]
    fn test_revert_without_changes_is_empty() {
        let service = service();
        let map = task_map();
        service.prepare(&map, "alice").unwrap();

        let report = service
            .revert_all_changes_on_branch(
                "snomedStore",
                &BranchPath::parse("MAIN/task-1").unwrap(),
                "alice",
                None,
            )
            .unwrap();
        assert_eq!(report.empty, Some(EmptyOperation::NothingToRevert));
    }

    #[test]
    fn test_unknown_branch_is_reported() {
        let service = service();
        let err = service
            .last_commit_time("snomedStore", &BranchPath::parse("MAIN/missing").unwrap())
            .unwrap_err();
        assert!(matches!(err, BranchError::BranchNotFound { .. }));
        assert!(service.is_synchronized(&task_map()).unwrap());
    }
}
