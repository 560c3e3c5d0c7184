//! TOML-based configuration for the branching core.
//!
//! Every section has defaults, so an empty file is a valid configuration
//! (with no repositories). Call [`AppConfig::validate`] after loading.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::conflict::{ConflictProcessorBroker, ReferenceIntegrityProcessor};
use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Revision store database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Branch operation settings.
    #[serde(default)]
    pub branching: BranchingConfig,

    /// Repositories served by this process.
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,

    /// Conflict processor settings per repository kind.
    #[serde(default)]
    pub processors: BTreeMap<String, ProcessorConfig>,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "/var/lib/termbranch/revisions.db".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level or an `EnvFilter` directive string.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Branching
// ---------------------------------------------------------------------------

/// Comments and formats used by branch operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchingConfig {
    /// Commit comment used by promote when the caller supplies none.
    #[serde(default = "default_promote_comment")]
    pub promote_comment: String,

    /// Commit comment used by synchronize when the caller supplies none.
    #[serde(default = "default_synchronize_comment")]
    pub synchronize_comment: String,

    /// `chrono` format for the restored time in revert comments.
    #[serde(default = "default_revert_time_format")]
    pub revert_time_format: String,

    /// Record detected conflicts in the database.
    #[serde(default = "default_true")]
    pub persist_conflicts: bool,
}

fn default_promote_comment() -> String {
    "Promoted changes".into()
}
fn default_synchronize_comment() -> String {
    "Synchronized task branch with parent.".into()
}
fn default_revert_time_format() -> String {
    "%Y-%m-%d %H:%M:%S UTC".into()
}
fn default_true() -> bool {
    true
}

impl Default for BranchingConfig {
    fn default() -> Self {
        Self {
            promote_comment: default_promote_comment(),
            synchronize_comment: default_synchronize_comment(),
            revert_time_format: default_revert_time_format(),
            persist_conflicts: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Repositories and processors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub id: String,
    /// Repository kind, used to pick the conflict processor.
    pub kind: String,
}

/// Settings of the reference-integrity processor for one repository kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Boolean feature marking content that may not be detached.
    #[serde(default)]
    pub protected_feature: Option<String>,

    /// object kind -> feature that must be unique among objects of that kind.
    #[serde(default)]
    pub unique_features: BTreeMap<String, String>,

    /// Drop target additions that reference a source deletion during
    /// synchronize instead of reporting a conflict.
    #[serde(default)]
    pub remove_dangling_additions: bool,
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!(
            repositories = config.repositories.len(),
            processors = config.processors.len(),
            "configuration parsed successfully"
        );
        Ok(config)
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.trim().is_empty() {
            return Err(invalid("database.path", "database path must not be empty"));
        }
        if self.branching.promote_comment.trim().is_empty() {
            return Err(invalid(
                "branching.promote_comment",
                "promote comment must not be empty",
            ));
        }
        if self.branching.synchronize_comment.trim().is_empty() {
            return Err(invalid(
                "branching.synchronize_comment",
                "synchronize comment must not be empty",
            ));
        }
        if self.branching.revert_time_format.is_empty() {
            return Err(invalid(
                "branching.revert_time_format",
                "time format must not be empty",
            ));
        }

        let mut seen = HashSet::new();
        for repository in &self.repositories {
            if repository.id.trim().is_empty() {
                return Err(invalid("repositories.id", "repository id must not be empty"));
            }
            if repository.kind.trim().is_empty() {
                return Err(invalid(
                    "repositories.kind",
                    &format!("repository '{}' has an empty kind", repository.id),
                ));
            }
            if !seen.insert(repository.id.as_str()) {
                return Err(invalid(
                    "repositories.id",
                    &format!("duplicate repository id '{}'", repository.id),
                ));
            }
        }

        for (kind, processor) in &self.processors {
            if processor
                .unique_features
                .iter()
                .any(|(object_kind, feature)| object_kind.is_empty() || feature.is_empty())
            {
                return Err(invalid(
                    &format!("processors.{kind}.unique_features"),
                    "object kinds and features must not be empty",
                ));
            }
        }

        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the conflict processor registry: one reference-integrity
    /// processor per configured kind, every repository bound to its kind.
    pub fn build_broker(&self) -> ConflictProcessorBroker {
        let mut broker = ConflictProcessorBroker::new();
        for (kind, settings) in &self.processors {
            let mut processor = ReferenceIntegrityProcessor::new(kind.as_str());
            if let Some(feature) = &settings.protected_feature {
                processor = processor.with_protected_feature(feature.as_str());
            }
            for (object_kind, feature) in &settings.unique_features {
                processor = processor.with_unique_feature(object_kind.as_str(), feature.as_str());
            }
            if settings.remove_dangling_additions {
                processor = processor.with_dangling_cleanup();
            }
            broker.register(kind.as_str(), Arc::new(processor));
        }
        for repository in &self.repositories {
            broker.bind_repository(repository.id.as_str(), repository.kind.as_str());
        }
        broker
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[database]
path = ":memory:"

[logging]
level = "debug"

[branching]
promote_comment = "Promoted task"
persist_conflicts = false

[[repositories]]
id = "snomedStore"
kind = "snomed"

[[repositories]]
id = "fhirStore"
kind = "fhir"

[processors.snomed]
protected_feature = "released"

[processors.fhir]
remove_dangling_additions = true

[processors.snomed.unique_features]
description = "term"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.database.path, ":memory:");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.branching.promote_comment, "Promoted task");
        assert_eq!(
            config.branching.synchronize_comment,
            "Synchronized task branch with parent."
        );
        assert!(!config.branching.persist_conflicts);
        assert_eq!(config.repositories.len(), 2);
        let snomed = &config.processors["snomed"];
        assert_eq!(snomed.protected_feature.as_deref(), Some("released"));
        assert_eq!(snomed.unique_features["description"], "term");
        assert!(!snomed.remove_dangling_additions);
        assert!(config.processors["fhir"].remove_dangling_additions);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termbranch.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_and_validate(&path).expect("load failed");
        assert_eq!(config.repositories[0].id, "snomedStore");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/termbranch.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[database\npath = 1").unwrap();
        let result = AppConfig::load_from_file(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_repository() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.repositories.push(RepositoryConfig {
            id: "snomedStore".into(),
            kind: "snomed".into(),
        });
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "repositories.id"
        ));
    }

    #[test]
    fn test_validate_rejects_empty_database_path() {
        let mut config = AppConfig::default();
        config.database.path = "  ".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "database.path"
        ));
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.database.path, "/var/lib/termbranch/revisions.db");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.branching.promote_comment, "Promoted changes");
        assert_eq!(config.branching.revert_time_format, "%Y-%m-%d %H:%M:%S UTC");
        assert!(config.branching.persist_conflicts);
        assert!(config.repositories.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_build_broker() {
        let config: AppConfig = toml::from_str(sample_toml()).unwrap();
        let broker = config.build_broker();
        assert_eq!(broker.processor_for("snomedStore").name(), "snomed");
        assert_eq!(broker.kind_of("fhirStore"), Some("fhir"));
        assert_eq!(broker.processor_for("fhirStore").name(), "fhir");
        assert_eq!(broker.processor_for("unbound").name(), "noop");
    }
}
