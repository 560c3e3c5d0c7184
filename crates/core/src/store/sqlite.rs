//! SQLite-backed revision store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ActiveTransactions, ObjectView, RevisionStore, SnapshotView, Transaction};
use crate::db::{self, queries, Database};
use crate::errors::StoreError;
use crate::models::{Branch, BranchPath, BranchPoint, CommitInfo, Timestamp};
use crate::object::{ObjectId, ObjectState};

/// Revision store persisting branches, revisions and commits in SQLite.
///
/// Point-in-time reads walk the branch lineage: the branch instance up to
/// the requested time, then each ancestor up to the time its child forked.
pub struct SqliteRevisionStore {
    db: Arc<Database>,
    active: ActiveTransactions,
}

impl SqliteRevisionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            active: ActiveTransactions::default(),
        }
    }

    /// An initialised in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::in_memory()?;
        db.initialize()?;
        Ok(Self::new(Arc::new(db)))
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn require_repository(conn: &Connection, repository_id: &str) -> Result<(), StoreError> {
        match queries::repository_kind(conn, repository_id)? {
            Some(_) => Ok(()),
            None => Err(StoreError::RepositoryNotFound(repository_id.to_string())),
        }
    }

    /// Materialise every object visible at a branch point.
    fn snapshot(&self, point: &BranchPoint) -> Result<BTreeMap<ObjectId, ObjectState>, StoreError> {
        let conn = self.db.conn();
        Self::require_repository(&conn, &point.repository_id)?;

        let branch = queries::branch_at(&conn, &point.repository_id, &point.path, point.timestamp)?
            .ok_or_else(|| StoreError::BranchNotFound {
                repository_id: point.repository_id.clone(),
                path: point.path.to_string(),
            })?;

        let mut objects = BTreeMap::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut cursor = Some((branch, point.timestamp));

        while let Some((branch, limit)) = cursor {
            for row in queries::latest_revisions(&conn, branch.id, limit)? {
                if !seen.insert(row.object_id.clone()) {
                    continue;
                }
                if row.detached {
                    continue;
                }
                if let Some(payload) = row.payload {
                    let state: ObjectState = serde_json::from_str(&payload)?;
                    objects.insert(ObjectId::from(row.object_id), state);
                }
            }

            cursor = match branch.parent_id {
                Some(parent_id) => {
                    let parent = queries::branch_by_id(&conn, parent_id)?.ok_or_else(|| {
                        StoreError::ParentNotFound {
                            repository_id: branch.repository_id.clone(),
                            path: branch
                                .path
                                .parent()
                                .map(|p| p.to_string())
                                .unwrap_or_default(),
                        }
                    })?;
                    Some((parent, limit.min(branch.base_timestamp)))
                }
                None => None,
            };
        }

        debug!(point = %point, objects = objects.len(), "materialised branch point");
        Ok(objects)
    }

    fn stale_head(branch: &Branch, expected: Timestamp, actual: Timestamp, superseded: bool) -> StoreError {
        warn!(
            repository_id = %branch.repository_id,
            branch = %branch.path,
            expected,
            actual,
            superseded,
            "branch advanced since transaction was opened"
        );
        StoreError::StaleHead {
            repository_id: branch.repository_id.clone(),
            branch: branch.path.to_string(),
            expected,
            actual,
        }
    }

    /// Fail unless `branch` is still the live instance of its path and has
    /// no commit newer than `expected`.
    fn check_head(conn: &Connection, branch: &Branch, expected: Timestamp) -> Result<(), StoreError> {
        let live = queries::live_branch(conn, &branch.repository_id, &branch.path)?;
        let actual = queries::last_commit_time(conn, branch.id)?;
        let superseded = live.map(|b| b.id != branch.id).unwrap_or(true);
        if superseded || actual != expected {
            return Err(Self::stale_head(branch, expected, actual, superseded));
        }
        Ok(())
    }

    fn write_transaction(
        conn: &Connection,
        tx: &Transaction,
        user_id: &str,
        comment: &str,
    ) -> Result<Option<CommitInfo>, StoreError> {
        Self::check_head(conn, tx.branch(), tx.expected_last_commit())?;

        let branch = match tx.fork_base() {
            Some(fork) => {
                Self::check_head(conn, &fork.parent, fork.expected_last_commit)?;
                let path = &tx.branch().path;
                let base_timestamp = queries::next_timestamp(conn)?;
                queries::supersede_branches(conn, tx.repository_id(), path)?;
                let branch = queries::insert_branch(
                    conn,
                    tx.repository_id(),
                    path,
                    Some(fork.parent.id),
                    base_timestamp,
                )?;
                debug!(
                    repository_id = %branch.repository_id,
                    branch = %branch.path,
                    id = branch.id,
                    replaced = tx.branch().id,
                    base_timestamp,
                    "re-created branch"
                );
                branch
            }
            None => tx.branch().clone(),
        };

        if tx.is_empty() {
            return Ok(None);
        }

        let timestamp = queries::next_timestamp(conn)?;
        let info = CommitInfo {
            id: Uuid::new_v4().to_string(),
            repository_id: branch.repository_id.clone(),
            branch: branch.path.clone(),
            timestamp,
            user_id: user_id.to_string(),
            comment: comment.to_string(),
        };
        queries::insert_commit(conn, &info, branch.id)?;

        for state in tx.written() {
            let payload = serde_json::to_string(state)?;
            queries::insert_revision(
                conn,
                state.id.as_str(),
                branch.id,
                timestamp,
                &state.kind,
                false,
                Some(&payload),
                &info.id,
            )?;
        }
        for (id, kind) in tx.detached() {
            queries::insert_revision(conn, id.as_str(), branch.id, timestamp, kind, true, None, &info.id)?;
        }

        Ok(Some(info))
    }
}

impl RevisionStore for SqliteRevisionStore {
    fn register_repository(&self, repository_id: &str, kind: &str) -> Result<(), StoreError> {
        let inserted = self.db.insert_repository(repository_id, kind)?;
        self.db.transaction(|conn| {
            if queries::live_branch(conn, repository_id, &BranchPath::main())?.is_none() {
                queries::insert_branch(conn, repository_id, &BranchPath::main(), None, 0)?;
            }
            Ok(())
        })?;
        if inserted {
            info!(repository_id, kind, "registered repository");
        }
        Ok(())
    }

    fn repository_kind(&self, repository_id: &str) -> Result<String, StoreError> {
        let conn = self.db.conn();
        queries::repository_kind(&conn, repository_id)?
            .ok_or_else(|| StoreError::RepositoryNotFound(repository_id.to_string()))
    }

    fn get_branch(
        &self,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<Option<Branch>, StoreError> {
        let conn = self.db.conn();
        Self::require_repository(&conn, repository_id)?;
        queries::live_branch(&conn, repository_id, path)
    }

    fn create_child_branch(
        &self,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<Branch, StoreError> {
        let parent_path = match path.parent() {
            Some(parent) => parent,
            None => {
                return self.get_branch(repository_id, path)?.ok_or_else(|| {
                    StoreError::BranchNotFound {
                        repository_id: repository_id.to_string(),
                        path: path.to_string(),
                    }
                })
            }
        };

        let branch = self.db.transaction(|conn| {
            Self::require_repository(conn, repository_id)?;
            let parent = queries::live_branch(conn, repository_id, &parent_path)?.ok_or_else(|| {
                StoreError::ParentNotFound {
                    repository_id: repository_id.to_string(),
                    path: parent_path.to_string(),
                }
            })?;
            let base_timestamp = queries::next_timestamp(conn)?;
            let superseded = queries::supersede_branches(conn, repository_id, path)?;
            let branch =
                queries::insert_branch(conn, repository_id, path, Some(parent.id), base_timestamp)?;
            if superseded > 0 {
                debug!(repository_id, branch = %path, superseded, "superseded previous branch instance");
            }
            Ok(branch)
        })?;

        info!(
            repository_id,
            branch = %branch.path,
            id = branch.id,
            base_timestamp = branch.base_timestamp,
            "created branch"
        );
        Ok(branch)
    }

    fn last_commit_time(&self, branch: &Branch) -> Result<Timestamp, StoreError> {
        let conn = self.db.conn();
        queries::last_commit_time(&conn, branch.id)
    }

    fn view(&self, point: &BranchPoint) -> Result<Box<dyn ObjectView>, StoreError> {
        Ok(Box::new(SnapshotView::new(self.snapshot(point)?)))
    }

    fn open_transaction(&self, branch: &Branch) -> Result<Transaction, StoreError> {
        let expected = self.last_commit_time(branch)?;
        debug!(
            repository_id = %branch.repository_id,
            branch = %branch.path,
            expected_last_commit = expected,
            "opened transaction"
        );
        Ok(Transaction::new(branch.clone(), expected, self.active.register()))
    }

    fn open_fork_transaction(
        &self,
        branch: &Branch,
        parent: &Branch,
    ) -> Result<Transaction, StoreError> {
        let expected = self.last_commit_time(branch)?;
        let expected_parent = self.last_commit_time(parent)?;
        debug!(
            repository_id = %branch.repository_id,
            branch = %branch.path,
            parent = %parent.path,
            expected_last_commit = expected,
            expected_parent_commit = expected_parent,
            "opened fork transaction"
        );
        Ok(Transaction::fork(
            branch.clone(),
            expected,
            parent.clone(),
            expected_parent,
            self.active.register(),
        ))
    }

    fn commit(
        &self,
        transactions: &[Transaction],
        user_id: &str,
        comment: &str,
    ) -> Result<Vec<CommitInfo>, StoreError> {
        let pending: Vec<&Transaction> = transactions
            .iter()
            .filter(|tx| tx.is_fork() || !tx.is_empty())
            .collect();
        if pending.is_empty() {
            debug!("no pending changes, skipping commit");
            return Ok(Vec::new());
        }

        let result = self.db.transaction(|conn| {
            pending
                .iter()
                .map(|tx| Self::write_transaction(conn, tx, user_id, comment))
                .filter_map(Result::transpose)
                .collect::<Result<Vec<_>, _>>()
        });

        match result {
            Ok(commits) => {
                for commit in &commits {
                    info!(
                        repository_id = %commit.repository_id,
                        branch = %commit.branch,
                        user_id,
                        timestamp = commit.timestamp,
                        "committed changes"
                    );
                }
                Ok(commits)
            }
            Err(StoreError::Sqlite(ref e)) if db::is_busy(e) => {
                let repositories: Vec<&str> = pending.iter().map(|tx| tx.repository_id()).collect();
                Err(StoreError::RepositoryLocked(repositories.join(", ")))
            }
            Err(e) => Err(e),
        }
    }

    fn active_transactions(&self) -> usize {
        self.active.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NO_COMMIT;
    use crate::object::FeatureValue;

    fn store() -> SqliteRevisionStore {
        let store = SqliteRevisionStore::in_memory().unwrap();
        store.register_repository("snomedStore", "snomed").unwrap();
        store
    }

    fn main(store: &SqliteRevisionStore) -> Branch {
        store
            .get_branch("snomedStore", &BranchPath::main())
            .unwrap()
            .unwrap()
    }

    fn concept(id: &str, term: &str) -> ObjectState {
        ObjectState::new(id, "concept").with("term", FeatureValue::text(term))
    }

    #[test]
    fn test_register_creates_main() {
        let store = store();
        store.register_repository("snomedStore", "snomed").unwrap();
        let main = main(&store);
        assert!(main.is_main());
        assert_eq!(store.last_commit_time(&main).unwrap(), NO_COMMIT);
        assert_eq!(store.repository_kind("snomedStore").unwrap(), "snomed");
        assert!(matches!(
            store.get_branch("missing", &BranchPath::main()),
            Err(StoreError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_child_branch_reads_parent_up_to_base() {
        let store = store();
        let main = main(&store);
        store
            .write_objects(&main, vec![concept("c1", "Heart")], &[], "alice", "seed")
            .unwrap();

        let task_path = BranchPath::parse("MAIN/task").unwrap();
        let task = store.create_child_branch("snomedStore", &task_path).unwrap();

        store
            .write_objects(&main, vec![concept("c2", "Lung")], &[], "alice", "later")
            .unwrap();

        let task_view = store.view(&store.head_point(&task).unwrap()).unwrap();
        assert!(task_view.contains(&ObjectId::from("c1")));
        assert!(!task_view.contains(&ObjectId::from("c2")));

        let main_view = store.view(&store.head_point(&main).unwrap()).unwrap();
        assert_eq!(main_view.all().len(), 2);
    }

    #[test]
    fn test_create_child_requires_parent() {
        let store = store();
        let orphan = BranchPath::parse("MAIN/a/b").unwrap();
        assert!(matches!(
            store.create_child_branch("snomedStore", &orphan),
            Err(StoreError::ParentNotFound { .. })
        ));
    }

    #[test]
    fn test_recreated_branch_supersedes_previous_instance() {
        let store = store();
        let path = BranchPath::parse("MAIN/task").unwrap();
        let first = store.create_child_branch("snomedStore", &path).unwrap();
        store
            .write_objects(&first, vec![concept("c1", "Heart")], &[], "bob", "edit")
            .unwrap();
        let second = store.create_child_branch("snomedStore", &path).unwrap();

        assert_ne!(first.id, second.id);
        assert!(second.base_timestamp > first.base_timestamp);
        assert_eq!(store.get_branch("snomedStore", &path).unwrap().unwrap().id, second.id);

        // Historical reads still resolve the instance that was live then.
        let before = store.head_point(&first).unwrap();
        assert!(store.view(&before).unwrap().contains(&ObjectId::from("c1")));
        let now = store.head_point(&second).unwrap();
        assert!(!store.view(&now).unwrap().contains(&ObjectId::from("c1")));
    }

    #[test]
    fn test_change_set_between_points() {
        let store = store();
        let main = main(&store);
        let first = store
            .write_objects(
                &main,
                vec![concept("c1", "Heart"), concept("c2", "Lung")],
                &[],
                "alice",
                "seed",
            )
            .unwrap()
            .unwrap();
        let second = store
            .write_objects(
                &main,
                vec![concept("c1", "Heart structure"), concept("c3", "Liver")],
                &[ObjectId::from("c2")],
                "alice",
                "edit",
            )
            .unwrap()
            .unwrap();

        let start = main.point(first.timestamp);
        let end = main.point(second.timestamp);
        let cs = store.change_set(&start, &end).unwrap();
        assert_eq!(cs.new_objects.len(), 1);
        assert_eq!(cs.changed_objects.len(), 1);
        assert_eq!(cs.detached_objects, vec![ObjectId::from("c2")]);

        assert_eq!(
            store.change_set(&end, &end).unwrap(),
            crate::object::ChangeSetData::EMPTY
        );
    }

    #[test]
    fn test_stale_transaction_is_rejected_atomically() {
        let store = store();
        let main = main(&store);
        let path = BranchPath::parse("MAIN/task").unwrap();
        let task = store.create_child_branch("snomedStore", &path).unwrap();

        let mut task_tx = store.open_transaction(&task).unwrap();
        task_tx.put(concept("t1", "Task"));
        let mut main_tx = store.open_transaction(&main).unwrap();
        main_tx.put(concept("m1", "Main"));

        store
            .write_objects(&main, vec![concept("x", "Other")], &[], "bob", "race")
            .unwrap();

        let err = store
            .commit(&[task_tx, main_tx], "alice", "both")
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleHead { .. }));

        let task_view = store.view(&store.head_point(&task).unwrap()).unwrap();
        assert!(!task_view.contains(&ObjectId::from("t1")));
        assert_eq!(store.active_transactions(), 0);
    }

    #[test]
    fn test_fork_transaction_recreates_branch_on_commit() {
        let store = store();
        let main = main(&store);
        let path = BranchPath::parse("MAIN/task").unwrap();
        let task = store.create_child_branch("snomedStore", &path).unwrap();
        store
            .write_objects(&main, vec![concept("c1", "Heart")], &[], "alice", "seed")
            .unwrap();

        let mut tx = store.open_fork_transaction(&task, &main).unwrap();
        assert_eq!(tx.fork_base().map(|fork| fork.parent.id), Some(main.id));
        tx.put(concept("t1", "Task"));
        let commits = store.commit(std::slice::from_ref(&tx), "alice", "sync").unwrap();
        assert_eq!(commits.len(), 1);

        let live = store.get_branch("snomedStore", &path).unwrap().unwrap();
        assert_ne!(live.id, task.id);
        assert!(live.base_timestamp > task.base_timestamp);
        let view = store.view(&store.head_point(&live).unwrap()).unwrap();
        assert!(view.contains(&ObjectId::from("c1")));
        assert!(view.contains(&ObjectId::from("t1")));
    }

    #[test]
    fn test_stale_fork_keeps_previous_instance() {
        let store = store();
        let main = main(&store);
        let path = BranchPath::parse("MAIN/task").unwrap();
        let task = store.create_child_branch("snomedStore", &path).unwrap();
        store
            .write_objects(&task, vec![concept("t1", "Task")], &[], "alice", "edit")
            .unwrap();

        let tx = store.open_fork_transaction(&task, &main).unwrap();
        store
            .write_objects(&main, vec![concept("m1", "Main")], &[], "bob", "race")
            .unwrap();

        let err = store
            .commit(std::slice::from_ref(&tx), "alice", "sync")
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleHead { .. }));

        let live = store.get_branch("snomedStore", &path).unwrap().unwrap();
        assert_eq!(live.id, task.id);
        let view = store.view(&store.head_point(&live).unwrap()).unwrap();
        assert!(view.contains(&ObjectId::from("t1")));
        assert!(!view.contains(&ObjectId::from("m1")));
    }

    #[test]
    fn test_empty_transactions_are_skipped() {
        let store = store();
        let main = main(&store);
        let tx = store.open_transaction(&main).unwrap();
        assert_eq!(store.active_transactions(), 1);
        let commits = store.commit(std::slice::from_ref(&tx), "alice", "noop").unwrap();
        assert!(commits.is_empty());
        drop(tx);
        assert_eq!(store.active_transactions(), 0);
        assert_eq!(store.last_commit_time(&main).unwrap(), NO_COMMIT);
    }

    #[test]
    fn test_commit_times_strictly_increase() {
        let store = store();
        let main = main(&store);
        let a = store
            .write_objects(&main, vec![concept("c1", "A")], &[], "u", "1")
            .unwrap()
            .unwrap();
        let b = store
            .write_objects(&main, vec![concept("c1", "B")], &[], "u", "2")
            .unwrap()
            .unwrap();
        assert!(b.timestamp > a.timestamp);
        assert_eq!(store.last_commit_time(&main).unwrap(), b.timestamp);
        assert_eq!(store.database().count_commits().unwrap(), 2);
    }
}
