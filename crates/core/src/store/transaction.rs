//! Pending writes against one branch instance.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{ActiveGuard, ObjectView};
use crate::errors::StoreError;
use crate::models::{Branch, BranchPoint, Timestamp};
use crate::object::{diff_states, ChangeSetData, ObjectId, ObjectState};

/// Mutable accumulation of writes against the head of one branch instance.
///
/// A transaction records the branch's last commit time when it is opened;
/// the store refuses to commit it if the branch has advanced since. Dropping
/// the transaction deactivates it.
///
/// A fork transaction re-creates its branch under the parent's head when it
/// is committed, and its writes land on the new instance. Its pending state
/// is therefore relative to the parent head, not to the old branch.
#[derive(Debug)]
pub struct Transaction {
    branch: Branch,
    expected_last_commit: Timestamp,
    fork: Option<ForkBase>,
    written: BTreeMap<ObjectId, ObjectState>,
    detached: BTreeMap<ObjectId, String>,
    removal_queue: BTreeSet<ObjectId>,
    _active: ActiveGuard,
}

impl Transaction {
    pub(crate) fn new(branch: Branch, expected_last_commit: Timestamp, active: ActiveGuard) -> Self {
        Self {
            branch,
            expected_last_commit,
            fork: None,
            written: BTreeMap::new(),
            detached: BTreeMap::new(),
            removal_queue: BTreeSet::new(),
            _active: active,
        }
    }

    pub(crate) fn fork(
        branch: Branch,
        expected_last_commit: Timestamp,
        parent: Branch,
        expected_parent_commit: Timestamp,
        active: ActiveGuard,
    ) -> Self {
        Self {
            fork: Some(ForkBase {
                parent,
                expected_last_commit: expected_parent_commit,
            }),
            ..Self::new(branch, expected_last_commit, active)
        }
    }

    pub fn repository_id(&self) -> &str {
        &self.branch.repository_id
    }

    pub fn branch(&self) -> &Branch {
        &self.branch
    }

    pub fn expected_last_commit(&self) -> Timestamp {
        self.expected_last_commit
    }

    /// The parent a fork transaction re-creates its branch under.
    pub fn fork_base(&self) -> Option<&ForkBase> {
        self.fork.as_ref()
    }

    pub fn is_fork(&self) -> bool {
        self.fork.is_some()
    }

    /// Store the full new state of an object (added or changed).
    pub fn put(&mut self, state: ObjectState) {
        self.detached.remove(&state.id);
        self.written.insert(state.id.clone(), state);
    }

    /// Detach (remove) an object.
    pub fn detach(&mut self, id: ObjectId, kind: impl Into<String>) {
        self.written.remove(&id);
        self.removal_queue.remove(&id);
        self.detached.insert(id, kind.into());
    }

    pub fn is_detached(&self, id: &ObjectId) -> bool {
        self.detached.contains_key(id)
    }

    /// Queue an object for removal by the conflict processor's post-process
    /// step.
    pub fn queue_removal(&mut self, id: ObjectId) {
        if !self.detached.contains_key(&id) {
            self.removal_queue.insert(id);
        }
    }

    pub fn removal_queue(&self) -> &BTreeSet<ObjectId> {
        &self.removal_queue
    }

    pub fn take_removal_queue(&mut self) -> BTreeSet<ObjectId> {
        std::mem::take(&mut self.removal_queue)
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty() && self.detached.is_empty()
    }

    /// States written by this transaction.
    pub fn written(&self) -> impl Iterator<Item = &ObjectState> {
        self.written.values()
    }

    /// Detached object ids with their kinds.
    pub fn detached(&self) -> impl Iterator<Item = (&ObjectId, &str)> {
        self.detached.iter().map(|(id, kind)| (id, kind.as_str()))
    }

    /// Overlay the pending writes on a committed view of the branch head.
    pub fn view<'a>(&'a self, base: &'a dyn ObjectView) -> TransactionView<'a> {
        TransactionView { base, tx: self }
    }

    /// Replay a changeset onto this transaction. Deltas are applied to the
    /// object's current state as seen through the transaction.
    pub fn apply_change_set(
        &mut self,
        change_set: &ChangeSetData,
        base: &dyn ObjectView,
    ) -> Result<(), StoreError> {
        for state in &change_set.new_objects {
            self.put(state.clone());
        }

        for delta in &change_set.changed_objects {
            let current = self.view(base).get(&delta.id).ok_or_else(|| {
                StoreError::ObjectNotFound {
                    object_id: delta.id.to_string(),
                    branch: self.branch.path.to_string(),
                }
            })?;
            self.put(delta.apply_to(&current));
        }

        for id in &change_set.detached_objects {
            let existing = self.view(base).get(id);
            if let Some(state) = existing {
                self.detach(id.clone(), state.kind);
            }
        }

        debug!(
            repository_id = %self.branch.repository_id,
            branch = %self.branch.path,
            new = change_set.new_objects.len(),
            changed = change_set.changed_objects.len(),
            detached = change_set.detached_objects.len(),
            "applied changeset to transaction"
        );
        Ok(())
    }

    /// Net changes of this transaction relative to `base`.
    pub fn change_set(&self, base: &dyn ObjectView) -> ChangeSetData {
        let mut new_objects = Vec::new();
        let mut changed_objects = Vec::new();
        for state in self.written.values() {
            match base.get(&state.id) {
                Some(previous) => changed_objects.push(diff_states(&previous, state)),
                None => new_objects.push(state.clone()),
            }
        }
        let detached_objects = self
            .detached
            .keys()
            .filter(|id| base.contains(id))
            .cloned()
            .collect();
        ChangeSetData::new(new_objects, changed_objects, detached_objects)
    }
}

/// Parent of a fork transaction, with its last commit time at open.
#[derive(Debug, Clone)]
pub struct ForkBase {
    pub parent: Branch,
    pub expected_last_commit: Timestamp,
}

impl ForkBase {
    /// The parent head the re-created branch will fork from.
    pub fn head(&self) -> BranchPoint {
        self.parent
            .point(self.expected_last_commit.max(self.parent.base_timestamp))
    }
}

/// A committed view with a transaction's pending writes laid over it.
pub struct TransactionView<'a> {
    base: &'a dyn ObjectView,
    tx: &'a Transaction,
}

impl ObjectView for TransactionView<'_> {
    fn get(&self, id: &ObjectId) -> Option<ObjectState> {
        if self.tx.detached.contains_key(id) {
            return None;
        }
        match self.tx.written.get(id) {
            Some(state) => Some(state.clone()),
            None => self.base.get(id),
        }
    }

    fn all(&self) -> Vec<ObjectState> {
        let mut merged: BTreeMap<ObjectId, ObjectState> = self
            .base
            .all()
            .into_iter()
            .filter(|state| !self.tx.detached.contains_key(&state.id))
            .map(|state| (state.id.clone(), state))
            .collect();
        for state in self.tx.written.values() {
            merged.insert(state.id.clone(), state.clone());
        }
        merged.into_values().collect()
    }
}
