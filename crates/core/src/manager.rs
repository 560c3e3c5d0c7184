//! Branch manager: changeset computation, branch classification and the
//! synchronize / promote / revert algorithms.
//!
//! The manager is the only component that decides *what* to write. Locking
//! and per-repository iteration belong to the action framework
//! ([`crate::action`]); persistence belongs to the [`RevisionStore`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BranchingConfig;
use crate::conflict::{
    ConflictDetector, ConflictProcessor, ConflictProcessorBroker, ConflictReport, Detection,
    MergeContext,
};
use crate::errors::{BranchError, StoreError};
use crate::models::{
    format_timestamp, Branch, BranchPath, BranchPathMap, BranchPoint, CommitInfo, Timestamp,
    NO_COMMIT,
};
use crate::object::ChangeSetData;
use crate::store::{RevisionStore, Transaction};

/// Relation of a branch to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    /// Neither side changed since the fork.
    UpToDate,
    /// Only the branch has new commits.
    Forward,
    /// Only the parent has new commits.
    Behind,
    /// Both sides have new commits.
    Diverged,
}

impl BranchState {
    fn from_flags(ahead: bool, behind: bool) -> Self {
        match (ahead, behind) {
            (false, false) => Self::UpToDate,
            (true, false) => Self::Forward,
            (false, true) => Self::Behind,
            (true, true) => Self::Diverged,
        }
    }
}

/// Result of a multi-repository synchronize.
#[derive(Debug, Clone, Default)]
pub struct Synchronization {
    /// The re-created task branches.
    pub branches: Vec<Branch>,
    pub commits: Vec<CommitInfo>,
}

impl Synchronization {
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

/// Per-repository state carried through the synchronize stages.
struct SyncPlan {
    repository_id: String,
    task: Branch,
    parent: Branch,
    /// Re-creates `task` under the parent head on commit.
    fork: Transaction,
    parent_head: BranchPoint,
    task_head: BranchPoint,
}

/// Identity of a synchronized branch once its fork transaction is handed
/// to the store.
struct SyncTarget {
    repository_id: String,
    path: BranchPath,
    parent_path: BranchPath,
}

pub struct BranchManager {
    store: Arc<dyn RevisionStore>,
    broker: Arc<ConflictProcessorBroker>,
    branching: BranchingConfig,
}

impl BranchManager {
    pub fn new(store: Arc<dyn RevisionStore>, broker: Arc<ConflictProcessorBroker>) -> Self {
        Self {
            store,
            broker,
            branching: BranchingConfig::default(),
        }
    }

    pub fn with_branching(mut self, branching: BranchingConfig) -> Self {
        self.branching = branching;
        self
    }

    pub fn store(&self) -> &Arc<dyn RevisionStore> {
        &self.store
    }

    pub fn broker(&self) -> &ConflictProcessorBroker {
        &self.broker
    }

    pub fn branching(&self) -> &BranchingConfig {
        &self.branching
    }

    // -----------------------------------------------------------------------
    // Lookups and primitives
    // -----------------------------------------------------------------------

    /// The live instance of a branch, or [`BranchError::BranchNotFound`].
    pub fn branch(&self, repository_id: &str, path: &BranchPath) -> Result<Branch, BranchError> {
        self.store
            .get_branch(repository_id, path)?
            .ok_or_else(|| BranchError::BranchNotFound {
                repository_id: repository_id.to_string(),
                path: path.to_string(),
            })
    }

    /// The live instance of a branch's parent path.
    fn live_parent(&self, branch: &Branch) -> Result<Option<Branch>, BranchError> {
        match branch.path.parent() {
            Some(parent) => Ok(self.store.get_branch(&branch.repository_id, &parent)?),
            None => Ok(None),
        }
    }

    fn parent_of(&self, branch: &Branch) -> Result<Branch, BranchError> {
        self.live_parent(branch)?
            .ok_or_else(|| BranchError::ParentNotFound {
                repository_id: branch.repository_id.clone(),
                path: branch
                    .path
                    .parent()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| branch.path.to_string()),
            })
    }

    /// Newest commit time on the live instance of a branch.
    pub fn last_commit_time(
        &self,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<Timestamp, BranchError> {
        let branch = self.branch(repository_id, path)?;
        Ok(self.store.last_commit_time(&branch)?)
    }

    pub fn change_set(
        &self,
        start: &BranchPoint,
        end: &BranchPoint,
    ) -> Result<ChangeSetData, BranchError> {
        Ok(self.store.change_set(start, end)?)
    }

    /// Latest time the content of `parent` changed: its last commit, or its
    /// own re-creation when it is a task branch that was synchronized.
    fn last_update_time(&self, parent: &Branch) -> Result<Timestamp, BranchError> {
        let last = self.store.last_commit_time(parent)?;
        if parent.is_main() {
            Ok(last)
        } else {
            Ok(last.max(parent.base_timestamp))
        }
    }

    fn is_branch_synchronized(&self, branch: &Branch) -> Result<bool, BranchError> {
        if branch.is_main() {
            return Ok(true);
        }
        match self.live_parent(branch)? {
            Some(parent) => Ok(self.last_update_time(&parent)? <= branch.base_timestamp),
            None => Ok(true),
        }
    }

    /// Whether the branch has seen every change of its parent. Missing
    /// branches and `MAIN` are always synchronized.
    pub fn is_synchronized(
        &self,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<bool, BranchError> {
        match self.store.get_branch(repository_id, path)? {
            Some(branch) => self.is_branch_synchronized(&branch),
            None => Ok(true),
        }
    }

    /// Whether every branch of the map is synchronized.
    pub fn is_synchronized_all(&self, map: &BranchPathMap) -> Result<bool, BranchError> {
        for (repository_id, path) in map.locked_entries() {
            if !self.is_synchronized(repository_id, path)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn branch_state(
        &self,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<BranchState, BranchError> {
        let branch = self.branch(repository_id, path)?;
        if branch.is_main() {
            return Ok(BranchState::UpToDate);
        }
        let ahead = self.store.last_commit_time(&branch)? != NO_COMMIT;
        let behind = !self.is_branch_synchronized(&branch)?;
        Ok(BranchState::from_flags(ahead, behind))
    }

    /// Head of the branch a transaction was opened on, as observed when it
    /// was opened.
    fn transaction_head(tx: &Transaction) -> BranchPoint {
        let branch = tx.branch();
        branch.point(tx.expected_last_commit().max(branch.base_timestamp))
    }

    /// Changes a task branch made since its base point.
    fn source_changes(&self, task: &Branch) -> Result<ChangeSetData, BranchError> {
        let head = self.store.head_point(task)?;
        self.changes_since_base(task, &head)
    }

    /// Changes a task branch made between its base point and `head`.
    fn changes_since_base(
        &self,
        task: &Branch,
        head: &BranchPoint,
    ) -> Result<ChangeSetData, BranchError> {
        if head.timestamp <= task.base_timestamp {
            return Ok(ChangeSetData::EMPTY);
        }
        Ok(self.store.change_set(&task.base(), head)?)
    }

    /// Changes `parent` received since `task` forked.
    fn target_changes(
        &self,
        task: &Branch,
        parent: &Branch,
        parent_head: &BranchPoint,
    ) -> Result<ChangeSetData, BranchError> {
        Ok(self
            .store
            .change_set(&parent.point(task.base_timestamp), parent_head)?)
    }

    fn detect(
        &self,
        processor: &dyn ConflictProcessor,
        repository_id: &str,
        source_changes: &ChangeSetData,
        target_changes: &ChangeSetData,
        source_head: &BranchPoint,
        target_head: &BranchPoint,
    ) -> Result<Detection, BranchError> {
        if source_changes.is_empty() {
            return Ok(Detection::default());
        }
        let source_view = self.store.view(source_head)?;
        let target_view = self.store.view(target_head)?;
        let context = MergeContext {
            repository_id,
            source_changes,
            target_changes,
            source_view: source_view.as_ref(),
            target_view: target_view.as_ref(),
        };
        Ok(ConflictDetector::new(processor).detect(&context))
    }

    // -----------------------------------------------------------------------
    // Prepare
    // -----------------------------------------------------------------------

    /// Create the branch under its parent's head unless it already exists.
    /// Returns the new branch, or `None` when it was already there.
    pub fn prepare(
        &self,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<Option<Branch>, BranchError> {
        if let Some(existing) = self.store.get_branch(repository_id, path)? {
            debug!(
                repository_id,
                branch = %path,
                id = existing.id,
                "branch already exists, nothing to prepare"
            );
            return Ok(None);
        }
        let branch = self.store.create_child_branch(repository_id, path)?;
        Ok(Some(branch))
    }

    // -----------------------------------------------------------------------
    // Synchronize
    // -----------------------------------------------------------------------

    /// Pull parent changes into every listed task branch.
    ///
    /// Stages run across all repositories before the next one starts: every
    /// target changeset, then every source changeset, then every conflict
    /// check, then every post-process step. Only then is anything written:
    /// the branches are re-created and their merged changes stored in one
    /// atomic commit, so any failure leaves every task branch as it was.
    pub fn synchronize(
        &self,
        entries: &[(String, BranchPath)],
        user_id: &str,
        comment: &str,
    ) -> Result<Synchronization, BranchError> {
        let mut plans = Vec::new();
        for (repository_id, path) in entries {
            let Some(task) = self.store.get_branch(repository_id, path)? else {
                debug!(repository_id = %repository_id, branch = %path, "branch does not exist, skipping");
                continue;
            };
            if task.is_main() {
                continue;
            }
            let Some(parent) = self.live_parent(&task)? else {
                debug!(repository_id = %repository_id, branch = %path, "parent does not exist, skipping");
                continue;
            };
            if self.last_update_time(&parent)? <= task.base_timestamp {
                debug!(repository_id = %repository_id, branch = %path, "already synchronized");
                continue;
            }
            let fork = self.store.open_fork_transaction(&task, &parent)?;
            let parent_head = fork
                .fork_base()
                .map(|base| base.head())
                .unwrap_or_else(|| parent.point(parent.base_timestamp));
            let task_head = Self::transaction_head(&fork);
            plans.push(SyncPlan {
                repository_id: repository_id.clone(),
                task,
                parent,
                fork,
                parent_head,
                task_head,
            });
        }

        if plans.is_empty() {
            return Ok(Synchronization::default());
        }

        let mut target_changes = Vec::with_capacity(plans.len());
        for plan in &plans {
            target_changes.push(self.target_changes(&plan.task, &plan.parent, &plan.parent_head)?);
        }

        let mut source_changes = Vec::with_capacity(plans.len());
        for plan in &plans {
            source_changes.push(self.changes_since_base(&plan.task, &plan.task_head)?);
        }

        let mut conflicts = Vec::new();
        let mut detections = Vec::with_capacity(plans.len());
        for (index, plan) in plans.iter().enumerate() {
            let processor = self.broker.processor_for(&plan.repository_id);
            let detection = self.detect(
                processor.as_ref(),
                &plan.repository_id,
                &source_changes[index],
                &target_changes[index],
                &plan.task_head,
                &plan.parent_head,
            )?;
            debug!(
                repository_id = %plan.repository_id,
                branch = %plan.task.path,
                target_changes = target_changes[index].len(),
                source_changes = source_changes[index].len(),
                conflicts = detection.conflicts.len(),
                "computed synchronization"
            );
            conflicts.extend(detection.conflicts.iter().cloned());
            detections.push((processor, detection));
        }

        if !conflicts.is_empty() {
            warn!(count = conflicts.len(), user_id, "synchronize aborted on conflicts");
            return Err(BranchError::MergeConflict(ConflictReport::new(conflicts)));
        }

        for (plan, (processor, detection)) in plans.iter_mut().zip(detections) {
            let base = self.store.view(&plan.parent_head)?;
            plan.fork.apply_change_set(&detection.merged, base.as_ref())?;
            for id in detection.removals {
                plan.fork.queue_removal(id);
            }
            processor
                .post_process(&mut plan.fork, base.as_ref())
                .map_err(BranchError::DomainConflict)?;
        }

        let (transactions, plans): (Vec<Transaction>, Vec<SyncTarget>) = plans
            .into_iter()
            .map(|plan| {
                let target = SyncTarget {
                    repository_id: plan.repository_id,
                    path: plan.task.path,
                    parent_path: plan.parent.path,
                };
                (plan.fork, target)
            })
            .unzip();

        let commits = self
            .store
            .commit(&transactions, user_id, comment)
            .map_err(|err| {
                commit_failure(err, |repository_id| {
                    plans
                        .iter()
                        .find(|plan| plan.repository_id == repository_id)
                        .map(|plan| (plan.path.to_string(), plan.parent_path.to_string()))
                })
            })?;

        let mut branches = Vec::with_capacity(plans.len());
        for plan in &plans {
            let branch = self.branch(&plan.repository_id, &plan.path)?;
            info!(
                repository_id = %branch.repository_id,
                branch = %branch.path,
                id = branch.id,
                base_timestamp = branch.base_timestamp,
                user_id,
                "synchronized branch"
            );
            branches.push(branch);
        }
        Ok(Synchronization { branches, commits })
    }

    // -----------------------------------------------------------------------
    // Promote
    // -----------------------------------------------------------------------

    /// Build the transaction carrying a task branch's changes onto its
    /// parent. Returns `None` when there is nothing to promote.
    ///
    /// The parent must not have changed since the fork. The transaction
    /// records the parent's head, so a promotion racing with another commit
    /// on the parent fails at commit time.
    pub fn merge_into_parent(
        &self,
        repository_id: &str,
        path: &BranchPath,
    ) -> Result<Option<Transaction>, BranchError> {
        let task = self.branch(repository_id, path)?;
        if task.is_main() || self.store.last_commit_time(&task)? == NO_COMMIT {
            debug!(repository_id, branch = %path, "no commits on branch, nothing to promote");
            return Ok(None);
        }
        let parent = self.parent_of(&task)?;

        let mut tx = self.store.open_transaction(&parent)?;
        let parent_head = Self::transaction_head(&tx);

        let target_changes = self.target_changes(&task, &parent, &parent_head)?;
        if !target_changes.is_empty() {
            warn!(
                repository_id,
                branch = %path,
                parent = %parent.path,
                changes = target_changes.len(),
                "parent changed since fork, refusing promotion"
            );
            return Err(BranchError::NotSynchronized {
                repository_id: repository_id.to_string(),
                path: path.to_string(),
                parent: parent.path.to_string(),
            });
        }

        let source_changes = self.source_changes(&task)?;
        let processor = self.broker.processor_for(repository_id);
        let detection = self
            .detect(
                processor.as_ref(),
                repository_id,
                &source_changes,
                &target_changes,
                &self.store.head_point(&task)?,
                &parent_head,
            )?
            .into_result()
            .map_err(BranchError::MergeConflict)?;

        let base = self.store.view(&parent_head)?;
        tx.apply_change_set(&detection.merged, base.as_ref())?;
        for id in detection.removals {
            tx.queue_removal(id);
        }
        processor
            .post_process(&mut tx, base.as_ref())
            .map_err(BranchError::DomainConflict)?;

        if tx.is_empty() {
            debug!(repository_id, branch = %path, "promotion carries no net changes");
            return Ok(None);
        }
        debug!(
            repository_id,
            branch = %path,
            parent = %parent.path,
            changes = source_changes.len(),
            "prepared promotion"
        );
        Ok(Some(tx))
    }

    /// Commit promotion transactions as one logical commit. A parent that
    /// moved since its transaction was opened is reported as
    /// [`BranchError::NotSynchronized`].
    pub fn commit_promotion(
        &self,
        transactions: &[Transaction],
        map: &BranchPathMap,
        user_id: &str,
        comment: &str,
    ) -> Result<Vec<CommitInfo>, BranchError> {
        self.store
            .commit(transactions, user_id, comment)
            .map_err(|err| {
                commit_failure(err, |repository_id| {
                    map.get(repository_id).map(|path| {
                        let parent = path.parent().unwrap_or_else(BranchPath::main);
                        (path.to_string(), parent.to_string())
                    })
                })
            })
    }

    // -----------------------------------------------------------------------
    // Revert
    // -----------------------------------------------------------------------

    /// Restore a branch to its state at `point.timestamp` with one new
    /// commit. Returns `None` when the branch already is in that state.
    pub fn revert(
        &self,
        point: &BranchPoint,
        user_id: &str,
    ) -> Result<Option<CommitInfo>, BranchError> {
        let branch = self.branch(&point.repository_id, &point.path)?;
        let comment = self.revert_comment(point.timestamp);
        self.revert_to(&branch, point.timestamp, user_id, &comment)
    }

    /// Undo every commit of a task branch, back to its base point.
    pub fn revert_all_changes_on_branch(
        &self,
        repository_id: &str,
        path: &BranchPath,
        user_id: &str,
        comment: Option<&str>,
    ) -> Result<Option<CommitInfo>, BranchError> {
        let branch = self.branch(repository_id, path)?;
        let comment = match comment {
            Some(comment) => comment.to_string(),
            None => self.revert_comment(branch.base_timestamp),
        };
        self.revert_to(&branch, branch.base_timestamp, user_id, &comment)
    }

    fn revert_comment(&self, timestamp: Timestamp) -> String {
        format!(
            "Reverted to repository state as of {}.",
            format_timestamp(timestamp, &self.branching.revert_time_format)
        )
    }

    fn revert_to(
        &self,
        branch: &Branch,
        timestamp: Timestamp,
        user_id: &str,
        comment: &str,
    ) -> Result<Option<CommitInfo>, BranchError> {
        let mut tx = self.store.open_transaction(branch)?;
        let head = Self::transaction_head(&tx);
        let changes = self.store.change_set(&head, &branch.point(timestamp))?;
        if changes.is_empty() {
            info!(
                repository_id = %branch.repository_id,
                branch = %branch.path,
                timestamp,
                "nothing to revert"
            );
            return Ok(None);
        }

        let view = self.store.view(&head)?;
        tx.apply_change_set(&changes, view.as_ref())?;
        let commits = self
            .store
            .commit(std::slice::from_ref(&tx), user_id, comment)
            .map_err(|err| commit_failure(err, |_| None))?;

        info!(
            repository_id = %branch.repository_id,
            branch = %branch.path,
            timestamp,
            changes = changes.len(),
            user_id,
            "reverted branch"
        );
        Ok(commits.into_iter().next())
    }
}

/// Map a store commit failure to the operation error taxonomy.
///
/// `paths_of` resolves a repository to its `(branch, parent)` paths; when it
/// does, a stale head means the parent moved underneath the operation.
/// Repository locks are surfaced unchanged.
fn commit_failure<F>(err: StoreError, paths_of: F) -> BranchError
where
    F: Fn(&str) -> Option<(String, String)>,
{
    match err {
        StoreError::StaleHead {
            repository_id,
            branch,
            expected,
            actual,
        } => match paths_of(&repository_id) {
            Some((path, parent)) => BranchError::NotSynchronized {
                repository_id,
                path,
                parent,
            },
            None => BranchError::CommitFailure(StoreError::StaleHead {
                repository_id,
                branch,
                expected,
                actual,
            }),
        },
        StoreError::RepositoryLocked(repository_id) => BranchError::RepositoryLocked(repository_id),
        other => BranchError::CommitFailure(other),
    }
}
