//! Reference-integrity conflict processor.
//!
//! A general-purpose domain policy for object graphs where objects refer to
//! each other by id:
//!
//! - some kinds carry a natural key that must stay unique (e.g. the term of
//!   a description);
//! - a new object must not reference something the other side deleted,
//!   unless dangling cleanup is enabled for target additions;
//! - content flagged as protected (e.g. already released) may not be
//!   detached;
//! - removing an object removes whatever still points at it.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::processor::{ConflictProcessor, MergeContext, Resolution};
use super::{Conflict, ConflictKind};
use crate::object::{FeatureValue, ObjectId, ObjectState, RevisionDelta};
use crate::store::{ObjectView, Transaction};

#[derive(Debug, Clone, Default)]
pub struct ReferenceIntegrityProcessor {
    name: String,
    /// kind -> feature holding the natural key.
    unique_features: BTreeMap<String, String>,
    /// Boolean feature marking content that may not be detached.
    protected_feature: Option<String>,
    /// Remove target additions that reference a source deletion instead of
    /// reporting them.
    remove_dangling_additions: bool,
}

impl ReferenceIntegrityProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Require `feature` to be unique among visible objects of `kind`.
    pub fn with_unique_feature(mut self, kind: impl Into<String>, feature: impl Into<String>) -> Self {
        self.unique_features.insert(kind.into(), feature.into());
        self
    }

    pub fn with_protected_feature(mut self, feature: impl Into<String>) -> Self {
        self.protected_feature = Some(feature.into());
        self
    }

    /// Silently drop target additions left dangling by a source deletion.
    pub fn with_dangling_cleanup(mut self) -> Self {
        self.remove_dangling_additions = true;
        self
    }

    fn is_protected(&self, state: &ObjectState) -> bool {
        self.protected_feature
            .as_deref()
            .and_then(|feature| state.feature(feature))
            .and_then(FeatureValue::as_bool)
            .unwrap_or(false)
    }

    /// Another visible object of the same kind with the same natural key.
    fn duplicate_of(&self, object: &ObjectState, view: &dyn ObjectView) -> Option<(String, ObjectId)> {
        let feature = self.unique_features.get(&object.kind)?;
        let value = object.feature(feature)?;
        view.find_by_feature(&object.kind, feature, value)
            .into_iter()
            .find(|other| other.id != object.id)
            .map(|other| (value.to_string(), other.id))
    }
}

impl ConflictProcessor for ReferenceIntegrityProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn added_in_source(&self, object: &ObjectState, context: &MergeContext<'_>) -> Resolution {
        if let Some((key, other)) = self.duplicate_of(object, context.target_view) {
            return Resolution::Conflict(
                ConflictKind::AddedInBoth,
                format!(
                    "{} '{}' duplicates {} of '{}'",
                    object.kind, object.id, key, other
                ),
            );
        }

        let detached = context.target_changes.detached_set();
        if let Some(missing) = object.references().into_iter().find(|id| detached.contains(*id)) {
            return Resolution::Conflict(
                ConflictKind::AddedInSourceDetachedInTarget,
                format!(
                    "{} '{}' references '{}', which was deleted on the target",
                    object.kind, object.id, missing
                ),
            );
        }

        Resolution::Admit
    }

    fn added_in_target(&self, object: &ObjectState, context: &MergeContext<'_>) -> Resolution {
        let detached = context.source_changes.detached_set();
        let Some(missing) = object.references().into_iter().find(|id| detached.contains(*id)) else {
            return Resolution::Admit;
        };
        if self.remove_dangling_additions {
            debug!(
                object_id = %object.id,
                reference = %missing,
                "target object references a source deletion, queueing removal"
            );
            return Resolution::Remove;
        }
        Resolution::Conflict(
            ConflictKind::AddedInTargetDetachedInSource,
            format!(
                "{} '{}' was added on the target but references '{}', which was deleted on the source",
                object.kind, object.id, missing
            ),
        )
    }

    fn detached_in_source(&self, id: &ObjectId, context: &MergeContext<'_>) -> Resolution {
        let referrer = context
            .target_changes
            .changed_objects
            .iter()
            .filter(|delta| !context.source_changes.is_detached(&delta.id))
            .filter_map(|delta| context.target_view.get(&delta.id))
            .find(|state| state.references_id(id));

        match referrer {
            Some(state) => Resolution::Conflict(
                ConflictKind::ChangedInTargetDetachedInSource,
                format!(
                    "'{}' was deleted on the source but {} '{}' changed on the target still references it",
                    id, state.kind, state.id
                ),
            ),
            None => Resolution::Admit,
        }
    }

    fn changed_in_target_and_detached_in_source(
        &self,
        target_delta: &RevisionDelta,
        context: &MergeContext<'_>,
    ) -> Resolution {
        match context.target_view.get(&target_delta.id) {
            Some(state) if self.is_protected(&state) => Resolution::Conflict(
                ConflictKind::ChangedInTargetDetachedInSource,
                format!(
                    "released {} '{}' cannot be deleted",
                    target_delta.kind, target_delta.id
                ),
            ),
            _ => Resolution::Admit,
        }
    }

    /// Detach queued objects, cascade to everything referencing them, and
    /// strip list references to objects that are no longer visible.
    fn post_process(&self, tx: &mut Transaction, base: &dyn ObjectView) -> Result<(), Conflict> {
        let mut queue: Vec<ObjectId> = tx.take_removal_queue().into_iter().collect();

        // Written objects pointing at something no longer visible.
        let dangling: Vec<ObjectState> = {
            let view = tx.view(base);
            tx.written()
                .filter(|state| state.references().into_iter().any(|id| !view.contains(id)))
                .cloned()
                .collect()
        };
        for state in dangling {
            let stripped = strip_dangling(&state, &tx.view(base));
            match stripped {
                Some(next) => tx.put(next),
                None => queue.push(state.id.clone()),
            }
        }

        let mut removed = BTreeSet::new();
        while let Some(id) = queue.pop() {
            if !removed.insert(id.clone()) {
                continue;
            }
            let existing = tx.view(base).get(&id);
            let Some(state) = existing else {
                continue;
            };
            if self.is_protected(&state) {
                return Err(Conflict::new(
                    tx.repository_id(),
                    id.as_str(),
                    ConflictKind::ChangedInTargetDetachedInSource,
                    format!("released {} '{}' cannot be removed", state.kind, id),
                ));
            }
            let referrers = tx.view(base).referencing(&id);
            tx.detach(id, state.kind);
            queue.extend(referrers.into_iter().map(|referrer| referrer.id));
        }

        if !removed.is_empty() {
            info!(
                repository_id = tx.repository_id(),
                branch = %tx.branch().path,
                processor = %self.name,
                count = removed.len(),
                "removed dangling objects"
            );
        }
        Ok(())
    }
}

/// Drop missing entries from many-valued references. Returns `None` when a
/// single-valued reference dangles and the whole object has to go.
fn strip_dangling(state: &ObjectState, view: &dyn ObjectView) -> Option<ObjectState> {
    let mut next = state.clone();
    for value in next.features.values_mut() {
        match value {
            FeatureValue::Ref(id) if !view.contains(id) => return None,
            FeatureValue::List(items) => items.retain(|item| match item {
                FeatureValue::Ref(id) => view.contains(id),
                _ => true,
            }),
            _ => {}
        }
    }
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictDetector;
    use crate::models::{Branch, BranchPath};
    use crate::object::ChangeSetData;
    use crate::store::{ActiveTransactions, SnapshotView};

    fn processor() -> ReferenceIntegrityProcessor {
        ReferenceIntegrityProcessor::new("snomed")
            .with_unique_feature("description", "term")
            .with_protected_feature("released")
    }

    fn snapshot(states: Vec<ObjectState>) -> SnapshotView {
        SnapshotView::new(states.into_iter().map(|s| (s.id.clone(), s)).collect())
    }

    fn description(id: &str, concept: &str, term: &str) -> ObjectState {
        ObjectState::new(id, "description")
            .with("concept", FeatureValue::reference(concept))
            .with("term", FeatureValue::text(term))
    }

    fn context<'a>(
        source: &'a ChangeSetData,
        target: &'a ChangeSetData,
        source_view: &'a SnapshotView,
        target_view: &'a SnapshotView,
    ) -> MergeContext<'a> {
        MergeContext {
            repository_id: "snomedStore",
            source_changes: source,
            target_changes: target,
            source_view,
            target_view,
        }
    }

    #[test]
    fn test_duplicate_natural_key_is_added_in_both() {
        let ours = description("d1", "c1", "Heart");
        let theirs = description("d2", "c1", "Heart");
        let source = ChangeSetData::new(vec![ours.clone()], vec![], vec![]);
        let target = ChangeSetData::new(vec![theirs.clone()], vec![], vec![]);
        let source_view = snapshot(vec![ObjectState::new("c1", "concept"), ours]);
        let target_view = snapshot(vec![ObjectState::new("c1", "concept"), theirs]);

        let processor = processor();
        let detection = ConflictDetector::new(&processor)
            .detect(&context(&source, &target, &source_view, &target_view));
        assert_eq!(detection.conflicts.len(), 1);
        assert_eq!(detection.conflicts[0].kind, ConflictKind::AddedInBoth);
        assert_eq!(detection.conflicts[0].component_id, "d1");
    }

    #[test]
    fn test_new_object_referencing_target_deletion() {
        let ours = description("d1", "c1", "Heart");
        let source = ChangeSetData::new(vec![ours.clone()], vec![], vec![]);
        let target = ChangeSetData::new(vec![], vec![], vec![ObjectId::from("c1")]);
        let source_view = snapshot(vec![ObjectState::new("c1", "concept"), ours]);
        let target_view = snapshot(vec![]);

        let processor = processor();
        let detection = ConflictDetector::new(&processor)
            .detect(&context(&source, &target, &source_view, &target_view));
        assert_eq!(
            detection.conflicts[0].kind,
            ConflictKind::AddedInSourceDetachedInTarget
        );
    }

    #[test]
    fn test_target_addition_referencing_source_deletion_conflicts() {
        let theirs = description("d9", "c1", "Heart");
        let source = ChangeSetData::new(vec![], vec![], vec![ObjectId::from("c1")]);
        let target = ChangeSetData::new(vec![theirs.clone()], vec![], vec![]);
        let source_view = snapshot(vec![]);
        let target_view = snapshot(vec![ObjectState::new("c1", "concept"), theirs]);

        let processor = processor();
        let detection = ConflictDetector::new(&processor)
            .detect(&context(&source, &target, &source_view, &target_view));
        assert_eq!(detection.conflicts.len(), 1);
        let conflict = &detection.conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::AddedInTargetDetachedInSource);
        assert_eq!(conflict.component_id, "d9");
        assert!(detection.removals.is_empty());
    }

    #[test]
    fn test_dangling_cleanup_removes_target_addition() {
        let theirs = description("d9", "c1", "Heart");
        let source = ChangeSetData::new(vec![], vec![], vec![ObjectId::from("c1")]);
        let target = ChangeSetData::new(vec![theirs.clone()], vec![], vec![]);
        let source_view = snapshot(vec![]);
        let target_view = snapshot(vec![ObjectState::new("c1", "concept"), theirs]);

        let processor = processor().with_dangling_cleanup();
        let detection = ConflictDetector::new(&processor)
            .detect(&context(&source, &target, &source_view, &target_view));
        assert!(!detection.has_conflicts());
        assert!(detection.removals.contains(&ObjectId::from("d9")));
    }

    #[test]
    fn test_released_content_cannot_be_detached() {
        let mut delta = RevisionDelta::new(ObjectId::from("c1"), "concept");
        delta.features.insert(
            "released".into(),
            crate::object::FeatureDelta::Set {
                old: FeatureValue::Bool(false),
                new: FeatureValue::Bool(true),
            },
        );
        let source = ChangeSetData::new(vec![], vec![], vec![ObjectId::from("c1")]);
        let target = ChangeSetData::new(vec![], vec![delta], vec![]);
        let source_view = snapshot(vec![]);
        let target_view = snapshot(vec![
            ObjectState::new("c1", "concept").with("released", FeatureValue::Bool(true))
        ]);

        let processor = processor();
        let detection = ConflictDetector::new(&processor)
            .detect(&context(&source, &target, &source_view, &target_view));
        assert_eq!(detection.conflicts.len(), 1);
        assert_eq!(
            detection.conflicts[0].kind,
            ConflictKind::ChangedInTargetDetachedInSource
        );
    }

    #[test]
    fn test_post_process_cascades_and_strips() {
        let active = ActiveTransactions::default();
        let branch = Branch {
            id: 1,
            repository_id: "snomedStore".into(),
            path: BranchPath::main(),
            parent_id: None,
            base_timestamp: 0,
        };
        let base = snapshot(vec![
            ObjectState::new("c1", "concept"),
            ObjectState::new("c2", "concept"),
            description("d1", "c1", "Heart"),
            ObjectState::new("r1", "refset").with(
                "members",
                FeatureValue::List(vec![FeatureValue::reference("c2"), FeatureValue::reference("c3")]),
            ),
        ]);
        let mut tx = Transaction::new(branch, 0, active.register());
        tx.put(
            ObjectState::new("r1", "refset").with(
                "members",
                FeatureValue::List(vec![FeatureValue::reference("c2"), FeatureValue::reference("c3")]),
            ),
        );
        tx.queue_removal(ObjectId::from("c1"));

        processor().post_process(&mut tx, &base).unwrap();

        let view = tx.view(&base);
        assert!(!view.contains(&ObjectId::from("c1")));
        assert!(!view.contains(&ObjectId::from("d1")));
        assert_eq!(
            view.get(&ObjectId::from("r1")).unwrap().feature("members"),
            Some(&FeatureValue::List(vec![FeatureValue::reference("c2")]))
        );
    }

    #[test]
    fn test_post_process_refuses_released_removal() {
        let active = ActiveTransactions::default();
        let branch = Branch {
            id: 1,
            repository_id: "snomedStore".into(),
            path: BranchPath::main(),
            parent_id: None,
            base_timestamp: 0,
        };
        let base = snapshot(vec![
            ObjectState::new("c1", "concept").with("released", FeatureValue::Bool(true))
        ]);
        let mut tx = Transaction::new(branch, 0, active.register());
        tx.queue_removal(ObjectId::from("c1"));

        let conflict = processor().post_process(&mut tx, &base).unwrap_err();
        assert_eq!(conflict.component_id, "c1");
        assert_eq!(conflict.repository_id, "snomedStore");
    }
}
