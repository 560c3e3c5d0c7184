//! Promote: fast-forward task branches onto their parents.

use tracing::debug;

use super::{ActionKind, ActionReport, BranchAction, CommitBuilder, EmptyOperation, TransactionAggregator};
use crate::errors::BranchError;
use crate::manager::{BranchManager, BranchState};
use crate::models::BranchPath;

/// Promotes only branches that are strictly ahead of an unchanged parent.
/// Up-to-date branches are skipped; behind or diverged branches fail the
/// whole run with [`BranchError::NotSynchronized`].
#[derive(Debug)]
pub struct PromoteAction {
    commit: CommitBuilder,
    aggregator: TransactionAggregator,
}

impl PromoteAction {
    pub fn new(commit: CommitBuilder) -> Self {
        Self {
            commit,
            aggregator: TransactionAggregator::new(),
        }
    }
}

impl BranchAction for PromoteAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Promote
    }

    fn description(&self) -> &str {
        "Promoting changes"
    }

    fn is_applicable(
        &self,
        manager: &BranchManager,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<bool, BranchError> {
        if path.is_main() {
            return Ok(false);
        }
        match manager.branch_state(repository_id, path)? {
            BranchState::Forward => Ok(true),
            BranchState::UpToDate => {
                debug!(repository_id, branch = %path, "branch is up to date, nothing to promote");
                Ok(false)
            }
            BranchState::Behind | BranchState::Diverged => Err(BranchError::NotSynchronized {
                repository_id: repository_id.to_string(),
                path: path.to_string(),
                parent: path.parent().unwrap_or_else(BranchPath::main).to_string(),
            }),
        }
    }

    fn apply(
        &mut self,
        manager: &BranchManager,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<(), BranchError> {
        if let Some(tx) = manager.merge_into_parent(repository_id, path)? {
            self.aggregator.add(repository_id, path, tx);
        }
        Ok(())
    }

    fn post_run(&mut self, manager: &BranchManager, _user_id: &str) -> Result<ActionReport, BranchError> {
        let aggregator = std::mem::take(&mut self.aggregator);
        if aggregator.is_empty() {
            return Ok(ActionReport::empty(
                ActionKind::Promote,
                EmptyOperation::NothingToPromote,
            ));
        }

        let processed = aggregator.repositories();
        let commits = self.commit.commit_promotion(manager, aggregator)?;
        let mut report = ActionReport::new(ActionKind::Promote);
        report.processed = processed;
        report.commits = commits;
        Ok(report)
    }
}
