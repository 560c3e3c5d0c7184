//! Per-feature structural merge of two changesets.
//!
//! The merger never looks at domain rules. It walks both changesets object by
//! object and, for objects changed on both sides, feature by feature:
//!
//! - a feature changed on one side only is carried over;
//! - a single-valued feature changed on both sides must end up with the same
//!   value (the processor may override this);
//! - a many-valued feature changed on both sides is merged as a set, and only
//!   conflicts when one side removes an element the other adds.
//!
//! The merged changeset describes what must still be applied on top of the
//! target to incorporate the source.

use tracing::{debug, info};

use super::processor::{ConflictProcessor, MergeContext, Resolution};
use super::ConflictKind;
use crate::object::{ChangeSetData, FeatureDelta, FeatureValue, ObjectId, RevisionDelta};

/// A conflict found by the structural pass, before domain mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralConflict {
    pub object_id: ObjectId,
    pub kind: ConflictKind,
    /// Conflicting feature names, when the conflict is feature-level.
    pub features: Vec<String>,
    /// Processor-supplied explanation, if any.
    pub detail: Option<String>,
}

impl StructuralConflict {
    fn new(object_id: ObjectId, kind: ConflictKind) -> Self {
        Self {
            object_id,
            kind,
            features: Vec::new(),
            detail: None,
        }
    }

    /// Human-readable description used for reporting.
    pub fn describe(&self) -> String {
        if let Some(detail) = &self.detail {
            return detail.clone();
        }
        match self.kind {
            ConflictKind::ChangedInBoth => format!(
                "'{}' changed on both sides: {}",
                self.object_id,
                self.features.join(", ")
            ),
            ConflictKind::ChangedInSourceDetachedInTarget => format!(
                "'{}' was modified on the source and deleted on the target",
                self.object_id
            ),
            ConflictKind::ChangedInTargetDetachedInSource => format!(
                "'{}' was modified on the target and deleted on the source",
                self.object_id
            ),
            ConflictKind::AddedInBoth => format!(
                "'{}' was added on both sides with different content",
                self.object_id
            ),
            kind => format!("'{}': {}", self.object_id, kind),
        }
    }
}

/// Result of a structural merge.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub merged: ChangeSetData,
    pub conflicts: Vec<StructuralConflict>,
}

impl MergeOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Structural merger delegating policy decisions to a [`ConflictProcessor`].
pub struct PerFeatureMerger<'a> {
    processor: &'a dyn ConflictProcessor,
}

impl<'a> PerFeatureMerger<'a> {
    pub fn new(processor: &'a dyn ConflictProcessor) -> Self {
        Self { processor }
    }

    /// Merge `context.source_changes` into `context.target_changes`.
    pub fn merge(&self, context: &MergeContext<'_>) -> MergeOutcome {
        let source = context.source_changes;
        let target = context.target_changes;

        let mut new_objects = Vec::new();
        let mut changed_objects = Vec::new();
        let mut detached_objects = Vec::new();
        let mut conflicts = Vec::new();

        for state in &source.new_objects {
            match target.new_object(&state.id) {
                Some(theirs) if theirs == state => {}
                Some(_) => {
                    conflicts.push(StructuralConflict::new(
                        state.id.clone(),
                        ConflictKind::AddedInBoth,
                    ));
                }
                None => new_objects.push(state.clone()),
            }
        }

        for delta in &source.changed_objects {
            if target.is_detached(&delta.id) {
                conflicts.push(StructuralConflict::new(
                    delta.id.clone(),
                    ConflictKind::ChangedInSourceDetachedInTarget,
                ));
                continue;
            }
            match target.changed_object(&delta.id) {
                Some(theirs) => match self.merge_features(theirs, delta) {
                    Ok(merged) if merged.is_empty() => {}
                    Ok(merged) => changed_objects.push(merged),
                    Err(features) => conflicts.push(StructuralConflict {
                        features,
                        ..StructuralConflict::new(delta.id.clone(), ConflictKind::ChangedInBoth)
                    }),
                },
                None => changed_objects.push(delta.clone()),
            }
        }

        for id in &source.detached_objects {
            if target.is_detached(id) {
                continue;
            }
            let Some(theirs) = target.changed_object(id) else {
                detached_objects.push(id.clone());
                continue;
            };
            match self
                .processor
                .changed_in_target_and_detached_in_source(theirs, context)
            {
                Resolution::Admit | Resolution::Remove => detached_objects.push(id.clone()),
                Resolution::Ignore => {}
                Resolution::Conflict(kind, detail) => conflicts.push(StructuralConflict {
                    object_id: id.clone(),
                    kind,
                    features: theirs.features.keys().cloned().collect(),
                    detail: Some(detail),
                }),
            }
        }

        for conflict in &conflicts {
            debug!(
                object_id = %conflict.object_id,
                kind = %conflict.kind,
                "structural conflict detected"
            );
        }
        info!(
            source = source.len(),
            target = target.len(),
            conflicts = conflicts.len(),
            "structural merge complete"
        );

        MergeOutcome {
            merged: ChangeSetData::new(new_objects, changed_objects, detached_objects),
            conflicts,
        }
    }

    /// Merge two deltas of the same object. Returns what remains to apply on
    /// top of the target, or the names of the conflicting features.
    fn merge_features(
        &self,
        target: &RevisionDelta,
        source: &RevisionDelta,
    ) -> Result<RevisionDelta, Vec<String>> {
        let mut merged = RevisionDelta::new(source.id.clone(), source.kind.clone());
        let mut conflicting = Vec::new();

        for (name, ours) in &source.features {
            let Some(theirs) = target.features.get(name) else {
                merged.features.insert(name.clone(), ours.clone());
                continue;
            };
            match (theirs, ours) {
                (FeatureDelta::List { .. }, FeatureDelta::List { .. }) => {
                    if !lists_compatible(theirs, ours) {
                        conflicting.push(name.clone());
                        continue;
                    }
                    let added = missing_from(ours.added(), theirs.added());
                    let removed = missing_from(ours.removed(), theirs.removed());
                    if !added.is_empty() || !removed.is_empty() {
                        merged
                            .features
                            .insert(name.clone(), FeatureDelta::List { added, removed });
                    }
                }
                (FeatureDelta::Set { .. }, FeatureDelta::Set { .. }) => {
                    match self
                        .processor
                        .changed_in_source_and_target_single_valued(name, theirs, ours)
                    {
                        Some(resolved) if !resolved.is_structurally_equal(theirs) => {
                            merged.features.insert(name.clone(), resolved);
                        }
                        Some(_) => {}
                        None => conflicting.push(name.clone()),
                    }
                }
                _ => conflicting.push(name.clone()),
            }
        }

        if conflicting.is_empty() {
            Ok(merged)
        } else {
            Err(conflicting)
        }
    }
}

/// One side must not remove what the other adds.
fn lists_compatible(target: &FeatureDelta, source: &FeatureDelta) -> bool {
    let crosses = |added: &[FeatureValue], removed: &[FeatureValue]| {
        added.iter().any(|item| removed.contains(item))
    };
    !crosses(source.added(), target.removed()) && !crosses(target.added(), source.removed())
}

fn missing_from(items: &[FeatureValue], already: &[FeatureValue]) -> Vec<FeatureValue> {
    items
        .iter()
        .filter(|item| !already.contains(item))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::NoopConflictProcessor;
    use crate::object::ObjectState;
    use crate::store::SnapshotView;

    fn delta(id: &str, features: Vec<(&str, FeatureDelta)>) -> RevisionDelta {
        let mut delta = RevisionDelta::new(ObjectId::from(id), "concept");
        for (name, feature) in features {
            delta.features.insert(name.to_string(), feature);
        }
        delta
    }

    fn set(old: &str, new: &str) -> FeatureDelta {
        FeatureDelta::Set {
            old: FeatureValue::text(old),
            new: FeatureValue::text(new),
        }
    }

    fn list(added: &[&str], removed: &[&str]) -> FeatureDelta {
        FeatureDelta::List {
            added: added.iter().map(|id| FeatureValue::reference(*id)).collect(),
            removed: removed.iter().map(|id| FeatureValue::reference(*id)).collect(),
        }
    }

    fn merge(target: ChangeSetData, source: ChangeSetData) -> MergeOutcome {
        let empty = SnapshotView::default();
        let context = MergeContext {
            repository_id: "r",
            source_changes: &source,
            target_changes: &target,
            source_view: &empty,
            target_view: &empty,
        };
        PerFeatureMerger::new(&NoopConflictProcessor).merge(&context)
    }

    #[test]
    fn test_disjoint_features_merge_cleanly() {
        let target = ChangeSetData::new(vec![], vec![delta("c1", vec![("term", set("a", "b"))])], vec![]);
        let source = ChangeSetData::new(
            vec![],
            vec![delta("c1", vec![("status", set("draft", "final"))])],
            vec![],
        );
        let outcome = merge(target, source);
        assert!(!outcome.has_conflicts());
        let merged = outcome.merged.changed_object(&ObjectId::from("c1")).unwrap();
        assert_eq!(merged.features.len(), 1);
        assert!(merged.features.contains_key("status"));
    }

    #[test]
    fn test_single_valued_feature_changed_differently() {
        let target = ChangeSetData::new(vec![], vec![delta("c1", vec![("term", set("a", "b"))])], vec![]);
        let source = ChangeSetData::new(vec![], vec![delta("c1", vec![("term", set("a", "c"))])], vec![]);
        let outcome = merge(target, source);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].kind, ConflictKind::ChangedInBoth);
        assert_eq!(outcome.conflicts[0].features, vec!["term".to_string()]);
    }

    #[test]
    fn test_identical_change_is_not_a_conflict() {
        let target = ChangeSetData::new(vec![], vec![delta("c1", vec![("term", set("a", "b"))])], vec![]);
        let source = target.clone();
        let outcome = merge(target, source);
        assert!(!outcome.has_conflicts());
        assert!(outcome.merged.is_empty());
    }

    #[test]
    fn test_many_valued_features_union() {
        let target = ChangeSetData::new(vec![], vec![delta("c1", vec![("parents", list(&["p1"], &[]))])], vec![]);
        let source = ChangeSetData::new(
            vec![],
            vec![delta("c1", vec![("parents", list(&["p1", "p2"], &[]))])],
            vec![],
        );
        let outcome = merge(target, source);
        assert!(!outcome.has_conflicts());
        let merged = outcome.merged.changed_object(&ObjectId::from("c1")).unwrap();
        assert_eq!(merged.features.get("parents"), Some(&list(&["p2"], &[])));
    }

    #[test]
    fn test_many_valued_add_remove_clash() {
        let target = ChangeSetData::new(vec![], vec![delta("c1", vec![("parents", list(&[], &["p1"]))])], vec![]);
        let source = ChangeSetData::new(vec![], vec![delta("c1", vec![("parents", list(&["p1"], &[]))])], vec![]);
        let outcome = merge(target, source);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].kind, ConflictKind::ChangedInBoth);
    }

    #[test]
    fn test_detach_combinations() {
        let target = ChangeSetData::new(
            vec![],
            vec![delta("c2", vec![("term", set("a", "b"))])],
            vec![ObjectId::from("c1"), ObjectId::from("c3")],
        );
        let source = ChangeSetData::new(
            vec![],
            vec![delta("c1", vec![("term", set("a", "b"))])],
            vec![ObjectId::from("c2"), ObjectId::from("c3"), ObjectId::from("c4")],
        );
        let outcome = merge(target, source);

        let kinds: Vec<ConflictKind> = outcome.conflicts.iter().map(|c| c.kind).collect();
        assert!(kinds.contains(&ConflictKind::ChangedInSourceDetachedInTarget));
        assert!(kinds.contains(&ConflictKind::ChangedInTargetDetachedInSource));
        assert_eq!(kinds.len(), 2);
        assert_eq!(outcome.merged.detached_objects, vec![ObjectId::from("c4")]);
    }

    #[test]
    fn test_same_object_added_on_both_sides() {
        let a = ObjectState::new("c9", "concept").with("term", FeatureValue::text("x"));
        let b = ObjectState::new("c9", "concept").with("term", FeatureValue::text("y"));

        let outcome = merge(
            ChangeSetData::new(vec![a.clone()], vec![], vec![]),
            ChangeSetData::new(vec![a.clone()], vec![], vec![]),
        );
        assert!(!outcome.has_conflicts());
        assert!(outcome.merged.is_empty());

        let outcome = merge(
            ChangeSetData::new(vec![a], vec![], vec![]),
            ChangeSetData::new(vec![b], vec![], vec![]),
        );
        assert_eq!(outcome.conflicts[0].kind, ConflictKind::AddedInBoth);
    }
}
