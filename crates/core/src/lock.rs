//! Branch lock manager.
//!
//! Locks are scoped to `(repository, branch path)` pairs and acquired in one
//! non-blocking batch: either every requested target is granted, or none
//! is and the caller gets a contention error naming the current holder.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::LockError;
use crate::models::BranchPath;

/// A lockable `(repository, branch)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockTarget {
    pub repository_id: String,
    pub branch_path: BranchPath,
}

impl LockTarget {
    pub fn new(repository_id: impl Into<String>, branch_path: BranchPath) -> Self {
        Self {
            repository_id: repository_id.into(),
            branch_path,
        }
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository_id, self.branch_path)
    }
}

/// Owner of a batch of locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockContext {
    pub user_id: String,
    pub description: String,
}

impl LockContext {
    pub fn new(user_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            description: description.into(),
        }
    }
}

/// Grants and releases branch locks.
pub trait LockManager: Send + Sync {
    /// Acquire every target or none, without waiting. Duplicate targets in
    /// one request collapse into one.
    fn try_lock(&self, context: &LockContext, targets: &[LockTarget]) -> Result<(), LockError>;

    /// Release targets held by `context`. Targets it does not hold are
    /// reported with [`LockError::NotHeld`] after the others are released.
    fn unlock(&self, context: &LockContext, targets: &[LockTarget]) -> Result<(), LockError>;
}

/// Process-wide lock table.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    held: Mutex<HashMap<LockTarget, LockContext>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently held targets, sorted.
    pub fn held_targets(&self) -> Vec<LockTarget> {
        let mut targets: Vec<LockTarget> = match self.held.lock() {
            Ok(held) => held.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        targets.sort();
        targets
    }

    pub fn is_locked(&self, target: &LockTarget) -> bool {
        self.held_targets().contains(target)
    }
}

impl LockManager for InMemoryLockManager {
    fn try_lock(&self, context: &LockContext, targets: &[LockTarget]) -> Result<(), LockError> {
        let mut held = self.held.lock().map_err(|_| LockError::Interrupted)?;

        if let Some((target, holder)) = targets
            .iter()
            .find_map(|target| held.get(target).map(|holder| (target, holder)))
        {
            debug!(
                target = %target,
                holder = %holder.user_id,
                requested_by = %context.user_id,
                "lock contention"
            );
            return Err(LockError::Contention {
                target: target.to_string(),
                holder: holder.user_id.clone(),
                description: holder.description.clone(),
            });
        }

        for target in targets {
            held.insert(target.clone(), context.clone());
        }
        info!(
            user_id = %context.user_id,
            description = %context.description,
            count = held.len(),
            "acquired branch locks"
        );
        Ok(())
    }

    fn unlock(&self, context: &LockContext, targets: &[LockTarget]) -> Result<(), LockError> {
        let mut held = match self.held.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut not_held = None;
        let unique: BTreeSet<&LockTarget> = targets.iter().collect();
        for target in unique {
            match held.get(target) {
                Some(owner) if owner == context => {
                    held.remove(target);
                }
                _ => {
                    not_held.get_or_insert_with(|| target.clone());
                }
            }
        }
        debug!(user_id = %context.user_id, "released branch locks");

        match not_held {
            Some(target) => Err(LockError::NotHeld {
                target: target.to_string(),
                user_id: context.user_id.clone(),
            }),
            None => Ok(()),
        }
    }
}
