//! Changesets between two branch points.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{diff_states, ObjectId, ObjectState, RevisionDelta};

/// Objects added, changed and detached between two branch points.
///
/// Every list is kept sorted by object id, so two changesets describing the
/// same difference compare equal. An empty changeset always equals
/// [`ChangeSetData::EMPTY`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetData {
    pub new_objects: Vec<ObjectState>,
    pub changed_objects: Vec<RevisionDelta>,
    pub detached_objects: Vec<ObjectId>,
}

impl ChangeSetData {
    /// The shared "nothing to do" changeset.
    pub const EMPTY: ChangeSetData = ChangeSetData {
        new_objects: Vec::new(),
        changed_objects: Vec::new(),
        detached_objects: Vec::new(),
    };

    /// Build a changeset from its parts, normalising the order.
    pub fn new(
        mut new_objects: Vec<ObjectState>,
        mut changed_objects: Vec<RevisionDelta>,
        mut detached_objects: Vec<ObjectId>,
    ) -> Self {
        new_objects.sort_by(|a, b| a.id.cmp(&b.id));
        changed_objects.retain(|delta| !delta.is_empty());
        changed_objects.sort_by(|a, b| a.id.cmp(&b.id));
        detached_objects.sort();
        detached_objects.dedup();
        Self {
            new_objects,
            changed_objects,
            detached_objects,
        }
    }

    /// Difference between two complete object snapshots.
    pub fn from_states(
        start: &BTreeMap<ObjectId, ObjectState>,
        end: &BTreeMap<ObjectId, ObjectState>,
    ) -> Self {
        let mut new_objects = Vec::new();
        let mut changed_objects = Vec::new();

        for (id, state) in end {
            match start.get(id) {
                None => new_objects.push(state.clone()),
                Some(previous) => {
                    let delta = diff_states(previous, state);
                    if !delta.is_empty() {
                        changed_objects.push(delta);
                    }
                }
            }
        }

        let detached_objects = start
            .keys()
            .filter(|id| !end.contains_key(*id))
            .cloned()
            .collect();

        Self::new(new_objects, changed_objects, detached_objects)
    }

    pub fn is_empty(&self) -> bool {
        self.new_objects.is_empty()
            && self.changed_objects.is_empty()
            && self.detached_objects.is_empty()
    }

    /// Total number of touched objects.
    pub fn len(&self) -> usize {
        self.new_objects.len() + self.changed_objects.len() + self.detached_objects.len()
    }

    pub fn new_object(&self, id: &ObjectId) -> Option<&ObjectState> {
        self.new_objects
            .binary_search_by(|state| state.id.cmp(id))
            .ok()
            .map(|index| &self.new_objects[index])
    }

    pub fn changed_object(&self, id: &ObjectId) -> Option<&RevisionDelta> {
        self.changed_objects
            .binary_search_by(|delta| delta.id.cmp(id))
            .ok()
            .map(|index| &self.changed_objects[index])
    }

    pub fn is_detached(&self, id: &ObjectId) -> bool {
        self.detached_objects.binary_search(id).is_ok()
    }

    pub fn detached_set(&self) -> BTreeSet<ObjectId> {
        self.detached_objects.iter().cloned().collect()
    }

    /// Ids of every object added or changed (not detached).
    pub fn touched_ids(&self) -> BTreeSet<&ObjectId> {
        self.new_objects
            .iter()
            .map(|state| &state.id)
            .chain(self.changed_objects.iter().map(|delta| &delta.id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::FeatureValue;

    fn snapshot(states: &[ObjectState]) -> BTreeMap<ObjectId, ObjectState> {
        states
            .iter()
            .map(|state| (state.id.clone(), state.clone()))
            .collect()
    }

    #[test]
    fn test_identical_snapshots_give_empty() {
        let states = snapshot(&[ObjectState::new("c1", "concept")]);
        let cs = ChangeSetData::from_states(&states, &states);
        assert!(cs.is_empty());
        assert_eq!(cs, ChangeSetData::EMPTY);
    }

    #[test]
    fn test_from_states_classifies() {
        let start = snapshot(&[
            ObjectState::new("c1", "concept").with("active", FeatureValue::Bool(true)),
            ObjectState::new("c2", "concept"),
        ]);
        let end = snapshot(&[
            ObjectState::new("c1", "concept").with("active", FeatureValue::Bool(false)),
            ObjectState::new("c3", "concept"),
        ]);
        let cs = ChangeSetData::from_states(&start, &end);

        assert_eq!(cs.len(), 3);
        assert!(cs.new_object(&ObjectId::from("c3")).is_some());
        assert!(cs.changed_object(&ObjectId::from("c1")).is_some());
        assert!(cs.is_detached(&ObjectId::from("c2")));
        assert!(!cs.is_detached(&ObjectId::from("c1")));
        assert_eq!(cs.touched_ids().len(), 2);
    }

    #[test]
    fn test_new_normalises_order_and_drops_empty_deltas() {
        let cs = ChangeSetData::new(
            vec![ObjectState::new("b", "x"), ObjectState::new("a", "x")],
            vec![RevisionDelta::new(ObjectId::from("z"), "x")],
            vec![ObjectId::from("d"), ObjectId::from("c"), ObjectId::from("d")],
        );
        assert_eq!(cs.new_objects[0].id.as_str(), "a");
        assert!(cs.changed_objects.is_empty());
        assert_eq!(cs.detached_objects.len(), 2);
    }
}
