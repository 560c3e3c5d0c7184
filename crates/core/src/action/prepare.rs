//! Prepare: create task branches.

use super::{ActionKind, ActionReport, BranchAction};
use crate::errors::BranchError;
use crate::manager::BranchManager;
use crate::models::{Branch, BranchPath};

/// Creates every missing branch of the map under its parent's head.
#[derive(Debug, Default)]
pub struct PrepareAction {
    created: Vec<Branch>,
}

impl PrepareAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> &[Branch] {
        &self.created
    }
}

impl BranchAction for PrepareAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Prepare
    }

    fn description(&self) -> &str {
        "Preparing branch"
    }

    fn apply(
        &mut self,
        manager: &BranchManager,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<(), BranchError> {
        if let Some(branch) = manager.prepare(repository_id, path)? {
            self.created.push(branch);
        }
        Ok(())
    }

    fn post_run(&mut self, _manager: &BranchManager, _user_id: &str) -> Result<ActionReport, BranchError> {
        let mut report = ActionReport::new(ActionKind::Prepare);
        report.processed = self
            .created
            .iter()
            .map(|branch| branch.repository_id.clone())
            .collect();
        Ok(report)
    }
}
