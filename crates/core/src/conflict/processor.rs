//! Pluggable, per-repository-kind conflict policy.

use tracing::debug;

use super::merger::StructuralConflict;
use super::{Conflict, ConflictKind};
use crate::object::{ChangeSetData, FeatureDelta, ObjectId, ObjectState, RevisionDelta};
use crate::store::{ObjectView, Transaction};

/// Everything a processor may consult while judging one merge.
///
/// "Source" is the side whose changes are being carried over (the task
/// branch); "target" is the side receiving them (its parent).
pub struct MergeContext<'a> {
    pub repository_id: &'a str,
    pub source_changes: &'a ChangeSetData,
    pub target_changes: &'a ChangeSetData,
    pub source_view: &'a dyn ObjectView,
    pub target_view: &'a dyn ObjectView,
}

/// Verdict of a processor on a single object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Leave the change out of the merge.
    Ignore,
    /// Accept the change as is.
    Admit,
    /// Accept the change, then queue the object for removal during
    /// post-processing.
    Remove,
    /// Report a conflict.
    Conflict(ConflictKind, String),
}

/// Domain-specific conflict policy for one repository kind.
///
/// Every hook has a default, so an implementation only overrides the rules
/// its domain cares about.
pub trait ConflictProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// An object created on the source side.
    fn added_in_source(&self, _object: &ObjectState, _context: &MergeContext<'_>) -> Resolution {
        Resolution::Admit
    }

    /// An object created on the target side. [`Resolution::Remove`] drops it
    /// from the merged result.
    fn added_in_target(&self, _object: &ObjectState, _context: &MergeContext<'_>) -> Resolution {
        Resolution::Admit
    }

    /// An object detached on the source side, checked against what the
    /// target changed.
    fn detached_in_source(&self, _id: &ObjectId, _context: &MergeContext<'_>) -> Resolution {
        Resolution::Admit
    }

    /// The target changed an object the source detached. Admitting carries
    /// the detach over.
    fn changed_in_target_and_detached_in_source(
        &self,
        target_delta: &RevisionDelta,
        _context: &MergeContext<'_>,
    ) -> Resolution {
        Resolution::Conflict(
            ConflictKind::ChangedInTargetDetachedInSource,
            format!(
                "{} '{}' was modified on the target and deleted on the source",
                target_delta.kind, target_delta.id
            ),
        )
    }

    /// Both sides changed the same single-valued feature. Returning `None`
    /// reports the feature as conflicting.
    fn changed_in_source_and_target_single_valued(
        &self,
        _feature: &str,
        target: &FeatureDelta,
        source: &FeatureDelta,
    ) -> Option<FeatureDelta> {
        if target.is_structurally_equal(source) {
            Some(target.clone())
        } else {
            None
        }
    }

    /// Turn raw structural conflicts into reportable records.
    fn handle_conflicts(
        &self,
        repository_id: &str,
        conflicts: &[StructuralConflict],
    ) -> Vec<Conflict> {
        conflicts
            .iter()
            .map(|conflict| {
                Conflict::new(
                    repository_id,
                    conflict.object_id.as_str(),
                    conflict.kind,
                    conflict.describe(),
                )
            })
            .collect()
    }

    /// Clean up a transaction after a merged changeset has been applied.
    ///
    /// `base` is the committed view the transaction was opened on. The
    /// default detaches every object in the removal queue.
    fn post_process(&self, tx: &mut Transaction, base: &dyn ObjectView) -> Result<(), Conflict> {
        let queue = tx.take_removal_queue();
        for id in queue {
            let existing = tx.view(base).get(&id);
            if let Some(state) = existing {
                debug!(object_id = %id, processor = self.name(), "detaching queued object");
                tx.detach(id, state.kind);
            }
        }
        Ok(())
    }
}

/// Accepts everything and performs no cleanup beyond the removal queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConflictProcessor;

impl ConflictProcessor for NoopConflictProcessor {
    fn name(&self) -> &str {
        "noop"
    }
}
