//! Registry resolving a repository to its conflict processor.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::processor::{ConflictProcessor, NoopConflictProcessor};

/// Explicit `kind -> processor` and `repository -> kind` registry, populated
/// at start-up. Unknown repositories and kinds get the no-op processor.
pub struct ConflictProcessorBroker {
    processors: HashMap<String, Arc<dyn ConflictProcessor>>,
    repository_kinds: HashMap<String, String>,
    fallback: Arc<dyn ConflictProcessor>,
}

impl Default for ConflictProcessorBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictProcessorBroker {
    pub fn new() -> Self {
        Self {
            processors: HashMap::new(),
            repository_kinds: HashMap::new(),
            fallback: Arc::new(NoopConflictProcessor),
        }
    }

    /// Register the processor for a repository kind, replacing any previous
    /// registration.
    pub fn register(&mut self, kind: impl Into<String>, processor: Arc<dyn ConflictProcessor>) {
        self.processors.insert(kind.into(), processor);
    }

    pub fn bind_repository(&mut self, repository_id: impl Into<String>, kind: impl Into<String>) {
        self.repository_kinds.insert(repository_id.into(), kind.into());
    }

    pub fn kind_of(&self, repository_id: &str) -> Option<&str> {
        self.repository_kinds.get(repository_id).map(String::as_str)
    }

    pub fn processor_for_kind(&self, kind: &str) -> Arc<dyn ConflictProcessor> {
        match self.processors.get(kind) {
            Some(processor) => processor.clone(),
            None => {
                debug!(kind, "no conflict processor registered, using no-op");
                self.fallback.clone()
            }
        }
    }

    /// The processor for a repository.
    pub fn processor_for(&self, repository_id: &str) -> Arc<dyn ConflictProcessor> {
        match self.kind_of(repository_id) {
            Some(kind) => self.processor_for_kind(kind),
            None => {
                debug!(repository_id, "repository has no bound kind, using no-op processor");
                self.fallback.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ReferenceIntegrityProcessor;

    #[test]
    fn test_resolution_and_fallback() {
        let mut broker = ConflictProcessorBroker::new();
        broker.register("snomed", Arc::new(ReferenceIntegrityProcessor::new("snomed")));
        broker.bind_repository("snomedStore", "snomed");
        broker.bind_repository("fhirStore", "fhir");

        assert_eq!(broker.processor_for("snomedStore").name(), "snomed");
        assert_eq!(broker.processor_for("fhirStore").name(), "noop");
        assert_eq!(broker.processor_for("unknown").name(), "noop");
        assert_eq!(broker.kind_of("fhirStore"), Some("fhir"));
    }
}
