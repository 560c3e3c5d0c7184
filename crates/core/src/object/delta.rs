//! Per-feature deltas between two states of the same object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{FeatureValue, ObjectId, ObjectState};

/// Change of a single feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureDelta {
    /// Single-valued feature replaced. `Null` stands for "absent".
    Set { old: FeatureValue, new: FeatureValue },
    /// Many-valued feature: elements added and removed.
    List {
        added: Vec<FeatureValue>,
        removed: Vec<FeatureValue>,
    },
}

impl FeatureDelta {
    /// Two deltas are structurally equal when they leave the feature in the
    /// same state, regardless of where they started from.
    pub fn is_structurally_equal(&self, other: &FeatureDelta) -> bool {
        match (self, other) {
            (Self::Set { new: a, .. }, Self::Set { new: b, .. }) => a == b,
            (
                Self::List {
                    added: a_added,
                    removed: a_removed,
                },
                Self::List {
                    added: b_added,
                    removed: b_removed,
                },
            ) => same_elements(a_added, b_added) && same_elements(a_removed, b_removed),
            _ => false,
        }
    }

    /// Elements this delta adds to a many-valued feature.
    pub fn added(&self) -> &[FeatureValue] {
        match self {
            Self::List { added, .. } => added,
            Self::Set { .. } => &[],
        }
    }

    /// Elements this delta removes from a many-valued feature.
    pub fn removed(&self) -> &[FeatureValue] {
        match self {
            Self::List { removed, .. } => removed,
            Self::Set { .. } => &[],
        }
    }

    fn apply(&self, current: Option<&FeatureValue>) -> FeatureValue {
        match self {
            Self::Set { new, .. } => new.clone(),
            Self::List { added, removed } => {
                let mut items = match current {
                    Some(FeatureValue::List(items)) => items.clone(),
                    _ => Vec::new(),
                };
                items.retain(|item| !removed.contains(item));
                for item in added {
                    if !items.contains(item) {
                        items.push(item.clone());
                    }
                }
                FeatureValue::List(items)
            }
        }
    }
}

fn same_elements(a: &[FeatureValue], b: &[FeatureValue]) -> bool {
    a.len() == b.len() && a.iter().all(|item| b.contains(item))
}

/// All feature changes of one object between two revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionDelta {
    pub id: ObjectId,
    pub kind: String,
    pub features: BTreeMap<String, FeatureDelta>,
}

impl RevisionDelta {
    pub fn new(id: ObjectId, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            features: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Apply the delta onto `state`, producing the next revision's state.
    pub fn apply_to(&self, state: &ObjectState) -> ObjectState {
        let mut next = state.clone();
        for (name, delta) in &self.features {
            match delta.apply(state.features.get(name)) {
                FeatureValue::Null => {
                    next.features.remove(name);
                }
                value => {
                    next.features.insert(name.clone(), value);
                }
            }
        }
        next
    }

    /// Values newly referenced by this delta.
    pub fn added_references(&self) -> Vec<&ObjectId> {
        self.features
            .values()
            .flat_map(|delta| match delta {
                FeatureDelta::Set { new, .. } => new.references(),
                FeatureDelta::List { added, .. } => {
                    added.iter().flat_map(FeatureValue::references).collect()
                }
            })
            .collect()
    }
}

/// Walk the declared features of both states and describe what changed.
///
/// List-valued features are compared as sets; a reordering alone is not a
/// change.
pub fn diff_states(old: &ObjectState, new: &ObjectState) -> RevisionDelta {
    let mut delta = RevisionDelta::new(new.id.clone(), new.kind.clone());
    let null = FeatureValue::Null;

    let names = old.features.keys().chain(new.features.keys());
    for name in names {
        if delta.features.contains_key(name) {
            continue;
        }
        let before = old.features.get(name).unwrap_or(&null);
        let after = new.features.get(name).unwrap_or(&null);

        let feature_delta = match (before, after) {
            (FeatureValue::List(a), FeatureValue::List(b)) => {
                let added: Vec<FeatureValue> =
                    b.iter().filter(|item| !a.contains(item)).cloned().collect();
                let removed: Vec<FeatureValue> =
                    a.iter().filter(|item| !b.contains(item)).cloned().collect();
                if added.is_empty() && removed.is_empty() {
                    None
                } else {
                    Some(FeatureDelta::List { added, removed })
                }
            }
            (a, b) if a == b => None,
            (a, b) => Some(FeatureDelta::Set {
                old: a.clone(),
                new: b.clone(),
            }),
        };

        if let Some(feature_delta) = feature_delta {
            delta.features.insert(name.clone(), feature_delta);
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concept(term: &str, parents: &[&str]) -> ObjectState {
        ObjectState::new("c1", "concept")
            .with("term", FeatureValue::text(term))
            .with(
                "parents",
                FeatureValue::List(parents.iter().map(|p| FeatureValue::reference(*p)).collect()),
            )
    }

    #[test]
    fn test_diff_single_and_many_valued() {
        let old = concept("Heart", &["a", "b"]);
        let new = concept("Heart structure", &["b", "c"]);
        let delta = diff_states(&old, &new);

        assert_eq!(
            delta.features.get("term"),
            Some(&FeatureDelta::Set {
                old: FeatureValue::text("Heart"),
                new: FeatureValue::text("Heart structure"),
            })
        );
        let parents = &delta.features["parents"];
        assert_eq!(parents.added(), &[FeatureValue::reference("c")]);
        assert_eq!(parents.removed(), &[FeatureValue::reference("a")]);
        assert_eq!(delta.apply_to(&old).features, new.features);
    }

    #[test]
    fn test_reorder_is_not_a_change() {
        let old = concept("Heart", &["a", "b"]);
        let new = concept("Heart", &["b", "a"]);
        assert!(diff_states(&old, &new).is_empty());
    }

    #[test]
    fn test_removed_feature_becomes_null_and_is_dropped() {
        let old = concept("Heart", &[]).with("note", FeatureValue::text("draft"));
        let new = concept("Heart", &[]);
        let delta = diff_states(&old, &new);
        assert!(matches!(
            delta.features.get("note"),
            Some(FeatureDelta::Set { new: FeatureValue::Null, .. })
        ));
        assert!(delta.apply_to(&old).feature("note").is_none());
    }

    #[test]
    fn test_structural_equality() {
        let a = FeatureDelta::Set {
            old: FeatureValue::Int(1),
            new: FeatureValue::Int(2),
        };
        let b = FeatureDelta::Set {
            old: FeatureValue::Int(3),
            new: FeatureValue::Int(2),
        };
        assert!(a.is_structurally_equal(&b));

        let c = FeatureDelta::List {
            added: vec![FeatureValue::Int(1), FeatureValue::Int(2)],
            removed: vec![],
        };
        let d = FeatureDelta::List {
            added: vec![FeatureValue::Int(2), FeatureValue::Int(1)],
            removed: vec![],
        };
        assert!(c.is_structurally_equal(&d));
        assert!(!a.is_structurally_equal(&c));
    }

    #[test]
    fn test_added_references() {
        let old = concept("Heart", &["a"]).with("module", FeatureValue::reference("m1"));
        let new = concept("Heart", &["a", "b"]).with("module", FeatureValue::reference("m2"));
        let delta = diff_states(&old, &new);
        let refs: Vec<&str> = delta.added_references().into_iter().map(ObjectId::as_str).collect();
        assert_eq!(refs, vec!["m2", "b"]);
    }
}
