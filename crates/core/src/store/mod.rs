//! Revision store contract and object views.
//!
//! The branch manager only ever talks to a [`RevisionStore`]: it looks up
//! branches, reads point-in-time [`ObjectView`]s, computes changesets between
//! branch points and commits [`Transaction`]s. [`SqliteRevisionStore`] is the
//! reference implementation on top of [`crate::db::Database`].

pub mod sqlite;
pub mod transaction;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::errors::StoreError;
use crate::models::{Branch, BranchPath, BranchPoint, CommitInfo, Timestamp};
use crate::object::{ChangeSetData, FeatureValue, ObjectId, ObjectState};

pub use sqlite::SqliteRevisionStore;
pub use transaction::{ForkBase, Transaction, TransactionView};

// ---------------------------------------------------------------------------
// Object views
// ---------------------------------------------------------------------------

/// Read access to the objects visible at one branch point.
pub trait ObjectView {
    fn get(&self, id: &ObjectId) -> Option<ObjectState>;

    /// Every visible object, ordered by id.
    fn all(&self) -> Vec<ObjectState>;

    fn contains(&self, id: &ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Visible objects holding a reference to `id`.
    fn referencing(&self, id: &ObjectId) -> Vec<ObjectState> {
        self.all()
            .into_iter()
            .filter(|state| state.references_id(id))
            .collect()
    }

    /// Visible objects of `kind` whose `feature` equals `value`.
    fn find_by_feature(&self, kind: &str, feature: &str, value: &FeatureValue) -> Vec<ObjectState> {
        self.all()
            .into_iter()
            .filter(|state| state.kind == kind && state.feature(feature) == Some(value))
            .collect()
    }
}

/// A fully materialised view.
#[derive(Debug, Clone, Default)]
pub struct SnapshotView {
    objects: BTreeMap<ObjectId, ObjectState>,
}

impl SnapshotView {
    pub fn new(objects: BTreeMap<ObjectId, ObjectState>) -> Self {
        Self { objects }
    }

    pub fn into_objects(self) -> BTreeMap<ObjectId, ObjectState> {
        self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl ObjectView for SnapshotView {
    fn get(&self, id: &ObjectId) -> Option<ObjectState> {
        self.objects.get(id).cloned()
    }

    fn all(&self) -> Vec<ObjectState> {
        self.objects.values().cloned().collect()
    }

    fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }
}

// ---------------------------------------------------------------------------
// Active transaction tracking
// ---------------------------------------------------------------------------

/// Counter of open transactions shared between a store and its
/// transactions.
#[derive(Debug, Clone, Default)]
pub struct ActiveTransactions(Arc<AtomicUsize>);

impl ActiveTransactions {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Register a newly opened transaction. The registration ends when the
    /// returned guard is dropped.
    pub fn register(&self) -> ActiveGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(self.0.clone())
    }
}

/// Deactivates its transaction on drop.
#[derive(Debug)]
pub struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Revision store
// ---------------------------------------------------------------------------

/// Branch/timestamp-addressed storage of immutable object revisions.
pub trait RevisionStore: Send + Sync {
    /// Register a repository of the given kind and create its `MAIN` branch.
    /// Registering an existing repository is a no-op.
    fn register_repository(&self, repository_id: &str, kind: &str) -> Result<(), StoreError>;

    /// Kind of a registered repository.
    fn repository_kind(&self, repository_id: &str) -> Result<String, StoreError>;

    /// The live instance of a branch, if it exists.
    fn get_branch(&self, repository_id: &str, path: &BranchPath)
        -> Result<Option<Branch>, StoreError>;

    /// Create a branch under the live instance of its parent path, forked at
    /// the parent's current head. An existing branch with the same path is
    /// superseded by the new instance.
    fn create_child_branch(&self, repository_id: &str, path: &BranchPath)
        -> Result<Branch, StoreError>;

    /// Newest commit time on this branch instance, or
    /// [`crate::models::NO_COMMIT`].
    fn last_commit_time(&self, branch: &Branch) -> Result<Timestamp, StoreError>;

    /// Current head of a branch instance.
    fn head_point(&self, branch: &Branch) -> Result<BranchPoint, StoreError> {
        let last = self.last_commit_time(branch)?;
        Ok(branch.point(last.max(branch.base_timestamp)))
    }

    /// Read every object visible at a branch point.
    fn view(&self, point: &BranchPoint) -> Result<Box<dyn ObjectView>, StoreError>;

    /// Objects added, changed and detached between two branch points.
    fn change_set(&self, start: &BranchPoint, end: &BranchPoint) -> Result<ChangeSetData, StoreError> {
        if start == end {
            return Ok(ChangeSetData::EMPTY);
        }
        let before: BTreeMap<ObjectId, ObjectState> = self
            .view(start)?
            .all()
            .into_iter()
            .map(|state| (state.id.clone(), state))
            .collect();
        let after: BTreeMap<ObjectId, ObjectState> = self
            .view(end)?
            .all()
            .into_iter()
            .map(|state| (state.id.clone(), state))
            .collect();
        Ok(ChangeSetData::from_states(&before, &after))
    }

    /// Open a transaction against the current head of a branch instance.
    fn open_transaction(&self, branch: &Branch) -> Result<Transaction, StoreError>;

    /// Open a fork transaction: on commit, `branch` is re-created under the
    /// current head of `parent` and the pending writes go to the new
    /// instance. Fails at commit time if either branch moved since.
    fn open_fork_transaction(&self, branch: &Branch, parent: &Branch)
        -> Result<Transaction, StoreError>;

    /// Commit every non-empty transaction as one logical commit: all of them
    /// are written or none is. Fork transactions re-create their branch in
    /// the same SQLite transaction, even without writes. Returns one
    /// [`CommitInfo`] per transaction that wrote objects.
    fn commit(
        &self,
        transactions: &[Transaction],
        user_id: &str,
        comment: &str,
    ) -> Result<Vec<CommitInfo>, StoreError>;

    /// Number of transactions opened and not yet dropped.
    fn active_transactions(&self) -> usize;

    /// Ordinary single-branch write: store `objects` and detach `detached` on
    /// the head of `branch`. Returns `None` when nothing was written.
    fn write_objects(
        &self,
        branch: &Branch,
        objects: Vec<ObjectState>,
        detached: &[ObjectId],
        user_id: &str,
        comment: &str,
    ) -> Result<Option<CommitInfo>, StoreError> {
        let view = self.view(&self.head_point(branch)?)?;
        let mut tx = self.open_transaction(branch)?;
        for state in objects {
            tx.put(state);
        }
        for id in detached {
            let existing = tx.view(view.as_ref()).get(id);
            if let Some(state) = existing {
                tx.detach(id.clone(), state.kind);
            }
        }
        let commits = self.commit(std::slice::from_ref(&tx), user_id, comment)?;
        Ok(commits.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> SnapshotView {
        let states = [
            ObjectState::new("c1", "concept"),
            ObjectState::new("d1", "description")
                .with("concept", FeatureValue::reference("c1"))
                .with("term", FeatureValue::text("Heart")),
            ObjectState::new("d2", "description")
                .with("concept", FeatureValue::reference("c2"))
                .with("term", FeatureValue::text("Lung")),
        ];
        SnapshotView::new(states.into_iter().map(|s| (s.id.clone(), s)).collect())
    }

    #[test]
    fn test_snapshot_view_queries() {
        let view = view();
        assert_eq!(view.len(), 3);
        assert!(view.contains(&ObjectId::from("c1")));
        assert_eq!(view.referencing(&ObjectId::from("c1")).len(), 1);
        let found = view.find_by_feature("description", "term", &FeatureValue::text("Lung"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "d2");
        assert!(view
            .find_by_feature("concept", "term", &FeatureValue::text("Lung"))
            .is_empty());
    }

    #[test]
    fn test_active_transactions_guard() {
        let active = ActiveTransactions::default();
        let first = active.register();
        let second = active.register();
        assert_eq!(active.count(), 2);
        drop(first);
        assert_eq!(active.count(), 1);
        drop(second);
        assert_eq!(active.count(), 0);
    }
}
