//! Synchronize: pull parent changes into task branches.

use super::{ActionKind, ActionReport, BranchAction, CommitBuilder, EmptyOperation};
use crate::errors::BranchError;
use crate::manager::BranchManager;
use crate::models::BranchPath;

/// Collects the applicable entries and synchronizes them together in
/// `post_run`, so the stages of every repository run before any write.
#[derive(Debug)]
pub struct SynchronizeAction {
    commit: CommitBuilder,
    entries: Vec<(String, BranchPath)>,
}

impl SynchronizeAction {
    pub fn new(commit: CommitBuilder) -> Self {
        Self {
            commit,
            entries: Vec::new(),
        }
    }
}

impl BranchAction for SynchronizeAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Synchronize
    }

    fn description(&self) -> &str {
        "Synchronizing changes"
    }

    fn apply(
        &mut self,
        _manager: &BranchManager,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<(), BranchError> {
        self.entries.push((repository_id.to_string(), path.clone()));
        Ok(())
    }

    fn post_run(&mut self, manager: &BranchManager, user_id: &str) -> Result<ActionReport, BranchError> {
        let comment = self.commit.comment_or(&manager.branching().synchronize_comment);
        let result = manager.synchronize(&self.entries, user_id, &comment)?;
        if result.is_empty() {
            return Ok(ActionReport::empty(
                ActionKind::Synchronize,
                EmptyOperation::NothingToSynchronize,
            ));
        }

        let mut report = ActionReport::new(ActionKind::Synchronize);
        report.processed = result
            .branches
            .iter()
            .map(|branch| branch.repository_id.clone())
            .collect();
        report.commits = result.commits;
        Ok(report)
    }
}
