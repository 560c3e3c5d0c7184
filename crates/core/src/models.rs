//! Domain model types shared by the store, the branch manager and the
//! action framework.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::BranchError;

/// Milliseconds since the Unix epoch, issued by the revision store clock.
pub type Timestamp = i64;

/// Last-commit time of a branch that has never been committed to.
pub const NO_COMMIT: Timestamp = i64::MIN;

/// Name of the root branch of every repository.
pub const MAIN_BRANCH: &str = "MAIN";

/// Render a store timestamp for humans, e.g. in generated commit comments.
pub fn format_timestamp(timestamp: Timestamp, format: &str) -> String {
    match Utc.timestamp_millis_opt(timestamp).single() {
        Some(dt) => dt.format(format).to_string(),
        None => timestamp.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Branch path
// ---------------------------------------------------------------------------

/// Slash-delimited path of a branch, always rooted at `MAIN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchPath(String);

impl BranchPath {
    /// The root branch.
    pub fn main() -> Self {
        Self(MAIN_BRANCH.to_string())
    }

    /// Parse and validate a branch path such as `MAIN/task-42`.
    pub fn parse(path: &str) -> Result<Self, BranchError> {
        let invalid = |detail: &str| BranchError::InvalidBranchPath {
            path: path.to_string(),
            detail: detail.to_string(),
        };

        let mut segments = path.split('/');
        if segments.next() != Some(MAIN_BRANCH) {
            return Err(invalid("path must start with MAIN"));
        }
        for segment in segments {
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if segment.chars().any(char::is_whitespace) {
                return Err(invalid("path segments must not contain whitespace"));
            }
        }
        Ok(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_main(&self) -> bool {
        self.0 == MAIN_BRANCH
    }

    /// The parent path, or `None` for `MAIN`.
    pub fn parent(&self) -> Option<BranchPath> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| BranchPath(parent.to_string()))
    }

    /// The final segment (`task-42` for `MAIN/task-42`).
    pub fn last_segment(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Append a child segment.
    pub fn child(&self, name: &str) -> Result<BranchPath, BranchError> {
        Self::parse(&format!("{}/{}", self.0, name))
    }

    /// Number of segments below `MAIN`.
    pub fn depth(&self) -> usize {
        self.0.matches('/').count()
    }
}

impl fmt::Display for BranchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BranchPath {
    type Err = BranchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BranchPath {
    type Error = BranchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BranchPath> for String {
    fn from(path: BranchPath) -> Self {
        path.0
    }
}

// ---------------------------------------------------------------------------
// Branches and branch points
// ---------------------------------------------------------------------------

/// A `(repository, branch, timestamp)` triple addressing a historical state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchPoint {
    pub repository_id: String,
    pub path: BranchPath,
    pub timestamp: Timestamp,
}

impl BranchPoint {
    pub fn new(repository_id: impl Into<String>, path: BranchPath, timestamp: Timestamp) -> Self {
        Self {
            repository_id: repository_id.into(),
            path,
            timestamp,
        }
    }
}

impl fmt::Display for BranchPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.repository_id, self.path, self.timestamp)
    }
}

/// One live instance of a branch in a repository.
///
/// Synchronization re-creates a task branch under the same path; each
/// instance gets its own `id` and base timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: i64,
    pub repository_id: String,
    pub path: BranchPath,
    pub parent_id: Option<i64>,
    /// Fork time on the parent; `0` for `MAIN`.
    pub base_timestamp: Timestamp,
}

impl Branch {
    pub fn is_main(&self) -> bool {
        self.path.is_main()
    }

    /// The parent branch point this branch was forked from.
    pub fn base_point(&self) -> Option<BranchPoint> {
        self.path.parent().map(|parent| {
            BranchPoint::new(self.repository_id.clone(), parent, self.base_timestamp)
        })
    }

    /// This branch at its own base time (the parent's state at fork).
    pub fn base(&self) -> BranchPoint {
        BranchPoint::new(
            self.repository_id.clone(),
            self.path.clone(),
            self.base_timestamp,
        )
    }

    /// This branch at the given time.
    pub fn point(&self, timestamp: Timestamp) -> BranchPoint {
        BranchPoint::new(self.repository_id.clone(), self.path.clone(), timestamp)
    }
}

// ---------------------------------------------------------------------------
// Branch path map
// ---------------------------------------------------------------------------

/// Per-operation mapping of repository identifiers to branch paths.
///
/// Iteration follows insertion order. An entry may carry no branch path,
/// meaning the repository takes no part in the operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchPathMap {
    entries: Vec<(String, Option<BranchPath>)>,
}

impl BranchPathMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every repository to the same branch path.
    pub fn uniform<I, S>(repository_ids: I, path: &BranchPath) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = Self::new();
        for id in repository_ids {
            map.insert(id, path.clone());
        }
        map
    }

    /// Set the branch path for a repository, replacing any previous value.
    pub fn insert(&mut self, repository_id: impl Into<String>, path: BranchPath) -> &mut Self {
        self.set(repository_id.into(), Some(path));
        self
    }

    /// Register a repository without a branch path.
    pub fn insert_unset(&mut self, repository_id: impl Into<String>) -> &mut Self {
        self.set(repository_id.into(), None);
        self
    }

    fn set(&mut self, repository_id: String, path: Option<BranchPath>) {
        match self.entries.iter_mut().find(|(id, _)| *id == repository_id) {
            Some(entry) => entry.1 = path,
            None => self.entries.push((repository_id, path)),
        }
    }

    pub fn get(&self, repository_id: &str) -> Option<&BranchPath> {
        self.entries
            .iter()
            .find(|(id, _)| id == repository_id)
            .and_then(|(_, path)| path.as_ref())
    }

    /// Every entry, including those without a branch path.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&BranchPath>)> {
        self.entries
            .iter()
            .map(|(id, path)| (id.as_str(), path.as_ref()))
    }

    /// Entries that carry a branch path.
    pub fn locked_entries(&self) -> impl Iterator<Item = (&str, &BranchPath)> {
        self.entries
            .iter()
            .filter_map(|(id, path)| path.as_ref().map(|p| (id.as_str(), p)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Commit info
// ---------------------------------------------------------------------------

/// A commit written by the revision store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: String,
    pub repository_id: String,
    pub branch: BranchPath,
    pub timestamp: Timestamp,
    pub user_id: String,
    pub comment: String,
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub user_id: String,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, user_id: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            user_id: user_id.to_string(),
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, user_id: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            user_id: user_id.to_string(),
            details: details.to_string(),
            success: false,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_path_parse() {
        let path = BranchPath::parse("MAIN/project/task-1").unwrap();
        assert_eq!(path.last_segment(), "task-1");
        assert_eq!(path.depth(), 2);
        assert_eq!(path.parent().unwrap().as_str(), "MAIN/project");
        assert!(BranchPath::main().parent().is_none());
        assert!(BranchPath::main().is_main());
    }

    #[test]
    fn test_branch_path_rejects_invalid() {
        assert!(BranchPath::parse("task-1").is_err());
        assert!(BranchPath::parse("MAIN//task").is_err());
        assert!(BranchPath::parse("MAIN/").is_err());
        assert!(BranchPath::parse("MAIN/my task").is_err());
    }

    #[test]
    fn test_branch_path_serde_roundtrip_validates() {
        let path: BranchPath = serde_json::from_str("\"MAIN/a\"").unwrap();
        assert_eq!(path.as_str(), "MAIN/a");
        assert!(serde_json::from_str::<BranchPath>("\"trunk\"").is_err());
    }

    #[test]
    fn test_branch_path_map_preserves_order() {
        let task = BranchPath::parse("MAIN/task").unwrap();
        let mut map = BranchPathMap::new();
        map.insert("snomed", task.clone())
            .insert_unset("atc")
            .insert("icd10", task.clone());
        map.insert("snomed", BranchPath::main());

        let ids: Vec<&str> = map.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["snomed", "atc", "icd10"]);
        assert_eq!(map.get("snomed"), Some(&BranchPath::main()));
        assert_eq!(map.get("atc"), None);
        assert_eq!(map.locked_entries().count(), 2);
    }

    #[test]
    fn test_branch_points() {
        let branch = Branch {
            id: 7,
            repository_id: "snomed".into(),
            path: BranchPath::parse("MAIN/task").unwrap(),
            parent_id: Some(1),
            base_timestamp: 100,
        };
        let base = branch.base_point().unwrap();
        assert_eq!(base.path, BranchPath::main());
        assert_eq!(base.timestamp, 100);
        assert_eq!(branch.base().path, branch.path);
        assert_eq!(branch.point(150).to_string(), "snomed:MAIN/task@150");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            format_timestamp(0, "%Y-%m-%d %H:%M:%S"),
            "1970-01-01 00:00:00"
        );
    }
}
