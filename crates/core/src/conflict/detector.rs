//! Conflict detection between a source and a target changeset.
//!
//! Detection runs in two passes and never stops at the first problem:
//!
//! 1. the structural [`PerFeatureMerger`] pass, whose raw conflicts are mapped
//!    through the processor's `handle_conflicts`;
//! 2. the domain pass, which asks the processor about every object added on
//!    either side and every object detached on the source.
//!
//! The caller gets the merged changeset, every conflict of both passes, and
//! the objects the processor wants removed after the merge is applied.

use std::collections::BTreeSet;

use tracing::{debug, info};

use super::merger::PerFeatureMerger;
use super::processor::{ConflictProcessor, MergeContext, Resolution};
use super::{Conflict, ConflictReport};
use crate::object::{ChangeSetData, ObjectId};

/// Output of [`ConflictDetector::detect`].
#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// Changes still to apply on top of the target.
    pub merged: ChangeSetData,
    pub conflicts: Vec<Conflict>,
    /// Objects to queue for removal once `merged` is applied.
    pub removals: BTreeSet<ObjectId>,
}

impl Detection {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// The conflicts as a report, or the detection itself when clean.
    pub fn into_result(self) -> Result<Detection, ConflictReport> {
        if self.conflicts.is_empty() {
            Ok(self)
        } else {
            Err(ConflictReport::new(self.conflicts))
        }
    }
}

/// Runs both detection passes with one processor.
pub struct ConflictDetector<'a> {
    processor: &'a dyn ConflictProcessor,
}

impl<'a> ConflictDetector<'a> {
    pub fn new(processor: &'a dyn ConflictProcessor) -> Self {
        Self { processor }
    }

    pub fn detect(&self, context: &MergeContext<'_>) -> Detection {
        let source = context.source_changes;
        let target = context.target_changes;

        info!(
            repository_id = context.repository_id,
            processor = self.processor.name(),
            source_count = source.len(),
            target_count = target.len(),
            "detecting conflicts"
        );

        if source.is_empty() {
            return Detection::default();
        }

        let mut conflicts = Vec::new();
        let mut merged = if target.is_empty() {
            source.clone()
        } else {
            let outcome = PerFeatureMerger::new(self.processor).merge(context);
            conflicts.extend(
                self.processor
                    .handle_conflicts(context.repository_id, &outcome.conflicts),
            );
            outcome.merged
        };

        let mut removals = BTreeSet::new();
        let mut ignored = BTreeSet::new();

        for state in &source.new_objects {
            match self.processor.added_in_source(state, context) {
                Resolution::Admit => {}
                Resolution::Ignore => {
                    ignored.insert(state.id.clone());
                }
                Resolution::Remove => {
                    removals.insert(state.id.clone());
                }
                Resolution::Conflict(kind, message) => {
                    conflicts.push(Conflict::new(
                        context.repository_id,
                        state.id.as_str(),
                        kind,
                        message,
                    ));
                }
            }
        }

        for state in &target.new_objects {
            match self.processor.added_in_target(state, context) {
                Resolution::Admit | Resolution::Ignore => {}
                Resolution::Remove => {
                    removals.insert(state.id.clone());
                }
                Resolution::Conflict(kind, message) => {
                    conflicts.push(Conflict::new(
                        context.repository_id,
                        state.id.as_str(),
                        kind,
                        message,
                    ));
                }
            }
        }

        for id in &source.detached_objects {
            if let Resolution::Conflict(kind, message) =
                self.processor.detached_in_source(id, context)
            {
                conflicts.push(Conflict::new(context.repository_id, id.as_str(), kind, message));
            }
        }

        if !ignored.is_empty() {
            merged.new_objects.retain(|state| !ignored.contains(&state.id));
        }

        for conflict in &conflicts {
            debug!(
                component_id = %conflict.component_id,
                kind = %conflict.kind,
                "conflict detected"
            );
        }
        info!(
            count = conflicts.len(),
            removals = removals.len(),
            "conflict detection complete"
        );

        Detection {
            merged,
            conflicts,
            removals,
        }
    }
}
