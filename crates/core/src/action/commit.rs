//! Commit glue shared by the actions.

use tracing::debug;

use crate::errors::BranchError;
use crate::manager::BranchManager;
use crate::models::{BranchPath, BranchPathMap, CommitInfo};
use crate::store::Transaction;

/// Owns the transactions of one operation.
///
/// Dropping the aggregator deactivates every transaction it holds, whether
/// or not they were committed.
#[derive(Debug, Default)]
pub struct TransactionAggregator {
    transactions: Vec<Transaction>,
    paths: BranchPathMap,
}

impl TransactionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the transaction produced for the branch at `path` of a repository.
    pub fn add(&mut self, repository_id: &str, path: &BranchPath, transaction: Transaction) {
        self.paths.insert(repository_id, path.clone());
        self.transactions.push(transaction);
    }

    /// True when no held transaction carries changes.
    pub fn is_empty(&self) -> bool {
        self.transactions.iter().all(Transaction::is_empty)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Branch paths the transactions were produced for.
    pub fn paths(&self) -> &BranchPathMap {
        &self.paths
    }

    /// Repositories with pending changes, in insertion order.
    pub fn repositories(&self) -> Vec<String> {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_empty())
            .map(|tx| tx.repository_id().to_string())
            .collect()
    }
}

/// Commit author and comment of one operation.
#[derive(Debug, Clone)]
pub struct CommitBuilder {
    user_id: String,
    comment: Option<String>,
}

impl CommitBuilder {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            comment: None,
        }
    }

    /// Use `comment` unless it is blank.
    pub fn comment(mut self, comment: Option<&str>) -> Self {
        self.comment = comment
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The caller's comment, or `default`.
    pub fn comment_or(&self, default: &str) -> String {
        self.comment.clone().unwrap_or_else(|| default.to_string())
    }

    /// Commit every transaction of the aggregator as one logical commit.
    pub fn commit_promotion(
        &self,
        manager: &BranchManager,
        aggregator: TransactionAggregator,
    ) -> Result<Vec<CommitInfo>, BranchError> {
        if aggregator.is_empty() {
            debug!(user_id = %self.user_id, "no pending transactions");
            return Ok(Vec::new());
        }
        let comment = self.comment_or(&manager.branching().promote_comment);
        manager.commit_promotion(
            aggregator.transactions(),
            aggregator.paths(),
            &self.user_id,
            &comment,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectState;
    use crate::store::{RevisionStore, SqliteRevisionStore};

    #[test]
    fn test_comment_defaults() {
        let builder = CommitBuilder::new("alice").comment(Some("   "));
        assert_eq!(builder.comment_or("Promoted changes"), "Promoted changes");
        let builder = CommitBuilder::new("alice").comment(Some(" Ship it "));
        assert_eq!(builder.comment_or("Promoted changes"), "Ship it");
        assert_eq!(builder.user_id(), "alice");
    }

    #[test]
    fn test_aggregator_tracks_changes_and_deactivates() {
        let store = SqliteRevisionStore::in_memory().unwrap();
        store.register_repository("r", "snomed").unwrap();
        let main = store.get_branch("r", &BranchPath::main()).unwrap().unwrap();

        let mut aggregator = TransactionAggregator::new();
        aggregator.add("r", &BranchPath::main(), store.open_transaction(&main).unwrap());
        assert!(aggregator.is_empty());
        assert_eq!(store.active_transactions(), 1);

        let mut tx = store.open_transaction(&main).unwrap();
        tx.put(ObjectState::new("c1", "concept"));
        aggregator.add("r", &BranchPath::main(), tx);
        assert!(!aggregator.is_empty());
        assert_eq!(aggregator.len(), 2);
        assert_eq!(aggregator.repositories(), vec!["r".to_string()]);

        drop(aggregator);
        assert_eq!(store.active_transactions(), 0);
    }
}
