//! Versioned objects and the generic structural diff.
//!
//! Every entity stored in a repository is flattened into an [`ObjectState`]:
//! an identifier, a kind, and a map of named features. Entity types take part
//! in generic merging by implementing [`Diffable`], which declares their
//! features; the diff and merge routines only ever walk those declarations.

pub mod change_set;
pub mod delta;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub use change_set::ChangeSetData;
pub use delta::{diff_states, FeatureDelta, RevisionDelta};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable identifier of a logical object across all of its revisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ---------------------------------------------------------------------------
// Feature values
// ---------------------------------------------------------------------------

/// Value of a single feature. `List` values are many-valued features and
/// have set semantics during merges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Ref(ObjectId),
    List(Vec<FeatureValue>),
}

impl FeatureValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn reference(id: impl Into<ObjectId>) -> Self {
        Self::Ref(id.into())
    }

    pub fn is_many(&self) -> bool {
        matches!(self, Self::List(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Every object referenced by this value, descending into lists.
    pub fn references(&self) -> Vec<&ObjectId> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a ObjectId>) {
        match self {
            Self::Ref(id) => out.push(id),
            Self::List(items) => items.iter().for_each(|item| item.collect_references(out)),
            _ => {}
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "\"{value}\""),
            Self::Ref(id) => write!(f, "->{id}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Diffable
// ---------------------------------------------------------------------------

/// An entity whose declared features can be diffed and merged generically.
pub trait Diffable {
    fn object_id(&self) -> ObjectId;

    /// Entity kind, e.g. `concept` or `description`.
    fn kind(&self) -> &str;

    /// The declared features and their current values.
    fn features(&self) -> BTreeMap<String, FeatureValue>;

    fn to_state(&self) -> ObjectState {
        ObjectState {
            id: self.object_id(),
            kind: self.kind().to_string(),
            features: self.features(),
        }
    }
}

/// Snapshot of one logical object as stored in a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectState {
    pub id: ObjectId,
    pub kind: String,
    pub features: BTreeMap<String, FeatureValue>,
}

impl ObjectState {
    pub fn new(id: impl Into<ObjectId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            features: BTreeMap::new(),
        }
    }

    /// Builder-style feature setter.
    pub fn with(mut self, feature: impl Into<String>, value: FeatureValue) -> Self {
        self.features.insert(feature.into(), value);
        self
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureValue> {
        self.features.get(name)
    }

    /// Every object this one references through any feature.
    pub fn references(&self) -> BTreeSet<&ObjectId> {
        self.features
            .values()
            .flat_map(FeatureValue::references)
            .collect()
    }

    pub fn references_id(&self, id: &ObjectId) -> bool {
        self.features
            .values()
            .any(|value| value.references().contains(&id))
    }

    pub fn references_any(&self, ids: &BTreeSet<ObjectId>) -> bool {
        self.references().into_iter().any(|id| ids.contains(id))
    }
}

impl Diffable for ObjectState {
    fn object_id(&self) -> ObjectId {
        self.id.clone()
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn features(&self) -> BTreeMap<String, FeatureValue> {
        self.features.clone()
    }

    fn to_state(&self) -> ObjectState {
        self.clone()
    }
}
