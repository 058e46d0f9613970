//! Live replication state of one bucket.

use std::sync::Arc;

use mesh_core::{BucketRef, ConfigRule, ReplicationConfiguration, ReplicationRule, RetryConfig};
use tracing::debug;

use crate::backend::{BackendOp, MeshBackend};
use crate::error::BackendError;
use crate::retry::with_retry;

/// A bucket's replication document, split by ownership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveState {
    /// Role of the stored document; `None` when the bucket has no document.
    pub role: Option<String>,
    /// Rules in the mesh id namespace.
    pub mesh_rules: Vec<ReplicationRule>,
    /// All other rules, in document order.
    pub foreign_rules: Vec<ConfigRule>,
}

impl LiveState {
    /// Splits a stored document of `source`.
    pub fn from_document(source: &str, document: Option<ReplicationConfiguration>) -> Self {
        let Some(document) = document else {
            return Self::default();
        };
        let mut state = Self { role: Some(document.role), ..Self::default() };
        for rule in document.rules {
            match ReplicationRule::from_config_rule(source, &rule) {
                Some(mesh_rule) => state.mesh_rules.push(mesh_rule),
                None => state.foreign_rules.push(rule),
            }
        }
        state
    }

    /// Returns true if the bucket has a stored document.
    pub fn has_document(&self) -> bool {
        self.role.is_some()
    }

    /// Destinations of the live mesh rules.
    pub fn mesh_destinations(&self) -> impl Iterator<Item = &str> {
        self.mesh_rules.iter().map(|r| r.destination.as_str())
    }
}

/// Result of reading a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveRead {
    /// The bucket exists. An unconfigured bucket yields an empty state.
    Found(LiveState),
    /// The bucket does not exist.
    NotFound,
}

/// Fetches live state from the backend.
#[derive(Clone)]
pub struct LiveStateReader {
    backend: Arc<dyn MeshBackend>,
    retry: RetryConfig,
}

impl LiveStateReader {
    /// Creates a reader.
    pub fn new(backend: Arc<dyn MeshBackend>, retry: RetryConfig) -> Self {
        Self { backend, retry }
    }

    /// Reads `bucket`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the backend error for anything other than a missing bucket.
    pub async fn read(&self, bucket: &BucketRef) -> Result<LiveRead, BackendError> {
        let result = with_retry(&self.retry, BackendOp::GetReplication, &bucket.name, || {
            self.backend.get_replication(bucket)
        })
        .await;

        match result {
            Ok(document) => {
                let state = LiveState::from_document(&bucket.name, document);
                debug!(
                    bucket = %bucket.name,
                    mesh_rules = state.mesh_rules.len(),
                    foreign_rules = state.foreign_rules.len(),
                    "Read live replication state"
                );
                Ok(LiveRead::Found(state))
            }
            Err(e) if e.is_not_found() => Ok(LiveRead::NotFound),
            Err(e) => Err(e),
        }
    }
}
