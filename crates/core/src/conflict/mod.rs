//! Conflict detection and the pluggable conflict-processing policy.
//!
//! The conflict subsystem is responsible for:
//! 1. **Structural merging** -- a per-object, per-feature merge of two
//!    changesets ([`PerFeatureMerger`]).
//! 2. **Domain checks** -- application-level integrity rules supplied by a
//!    [`ConflictProcessor`] registered per repository kind.
//! 3. **Reporting** -- every conflict of both passes is collected into one
//!    [`ConflictReport`].

pub mod broker;
pub mod detector;
pub mod integrity;
pub mod merger;
pub mod processor;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use broker::ConflictProcessorBroker;
pub use detector::{ConflictDetector, Detection};
pub use integrity::ReferenceIntegrityProcessor;
pub use merger::{MergeOutcome, PerFeatureMerger, StructuralConflict};
pub use processor::{ConflictProcessor, MergeContext, NoopConflictProcessor, Resolution};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How two changesets disagree about an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    /// Both sides modified the same object and the changes do not agree.
    ChangedInBoth,
    /// The source modified an object the target removed.
    ChangedInSourceDetachedInTarget,
    /// The target modified an object the source removed.
    ChangedInTargetDetachedInSource,
    /// Both sides created objects colliding on identity or a natural key.
    AddedInBoth,
    /// The source added an object referencing something the target removed.
    AddedInSourceDetachedInTarget,
    /// The target added an object referencing something the source removed.
    AddedInTargetDetachedInSource,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChangedInBoth => "CHANGED_IN_BOTH",
            Self::ChangedInSourceDetachedInTarget => "CHANGED_IN_SOURCE_DETACHED_IN_TARGET",
            Self::ChangedInTargetDetachedInSource => "CHANGED_IN_TARGET_DETACHED_IN_SOURCE",
            Self::AddedInBoth => "ADDED_IN_BOTH",
            Self::AddedInSourceDetachedInTarget => "ADDED_IN_SOURCE_DETACHED_IN_TARGET",
            Self::AddedInTargetDetachedInSource => "ADDED_IN_TARGET_DETACHED_IN_SOURCE",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CHANGED_IN_BOTH" => Ok(Self::ChangedInBoth),
            "CHANGED_IN_SOURCE_DETACHED_IN_TARGET" => Ok(Self::ChangedInSourceDetachedInTarget),
            "CHANGED_IN_TARGET_DETACHED_IN_SOURCE" => Ok(Self::ChangedInTargetDetachedInSource),
            "ADDED_IN_BOTH" => Ok(Self::AddedInBoth),
            "ADDED_IN_SOURCE_DETACHED_IN_TARGET" => Ok(Self::AddedInSourceDetachedInTarget),
            "ADDED_IN_TARGET_DETACHED_IN_SOURCE" => Ok(Self::AddedInTargetDetachedInSource),
            other => Err(format!("unknown conflict kind: {other}")),
        }
    }
}

/// A reportable conflict on one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Unique conflict ID.
    pub id: String,
    pub repository_id: String,
    /// The object the conflict is about.
    pub component_id: String,
    pub kind: ConflictKind,
    /// Human-readable description.
    pub message: String,
}

impl Conflict {
    /// Create a new conflict with a fresh UUID.
    pub fn new(
        repository_id: impl Into<String>,
        component_id: impl Into<String>,
        kind: ConflictKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            repository_id: repository_id.into(),
            component_id: component_id.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on '{}' in '{}': {}",
            self.kind, self.component_id, self.repository_id, self.message
        )
    }
}

/// Every conflict detected by one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub conflicts: Vec<Conflict>,
}

impl ConflictReport {
    pub fn new(conflicts: Vec<Conflict>) -> Self {
        Self { conflicts }
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Conflicts of one kind.
    pub fn of_kind(&self, kind: ConflictKind) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(move |c| c.kind == kind)
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} conflict(s) detected", self.conflicts.len())?;
        for conflict in &self.conflicts {
            write!(f, "\n  - {conflict}")?;
        }
        Ok(())
    }
}
