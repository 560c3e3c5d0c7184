//! Post-run hooks.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{ActionKind, ActionReport};
use crate::db::Database;
use crate::errors::BranchError;
use crate::models::{AuditEntry, BranchPathMap};

/// Observer invoked after every action run, once its locks are released.
pub trait PostRunHook: Send + Sync {
    fn after_run(
        &self,
        action: ActionKind,
        user_id: &str,
        map: &BranchPathMap,
        outcome: &Result<ActionReport, BranchError>,
    );
}

/// Records every run in the audit log and, optionally, the conflicts that
/// made it fail.
pub struct AuditTrail {
    db: Arc<Database>,
    persist_conflicts: bool,
}

impl AuditTrail {
    pub fn new(db: Arc<Database>, persist_conflicts: bool) -> Self {
        Self {
            db,
            persist_conflicts,
        }
    }
}

impl PostRunHook for AuditTrail {
    fn after_run(
        &self,
        action: ActionKind,
        user_id: &str,
        map: &BranchPathMap,
        outcome: &Result<ActionReport, BranchError>,
    ) {
        let action_name = action.to_string();
        let entry = match outcome {
            Ok(report) => AuditEntry::success(&action_name, user_id, &report.summary()),
            Err(err) => AuditEntry::failure(&action_name, user_id, &err.to_string()),
        };
        if let Err(e) = self.db.insert_audit_entry(&entry) {
            warn!(error = %e, action = %action_name, "failed to write audit entry");
        }

        let Err(err) = outcome else {
            return;
        };
        if !self.persist_conflicts {
            return;
        }
        for conflict in err.conflicts() {
            let branch_path = map
                .get(&conflict.repository_id)
                .map(|path| path.to_string())
                .unwrap_or_default();
            if let Err(e) = self.db.insert_conflict(conflict, &branch_path) {
                warn!(error = %e, conflict_id = %conflict.id, "failed to persist conflict");
            }
        }
        debug!(count = err.conflicts().len(), "persisted conflicts");
    }
}
