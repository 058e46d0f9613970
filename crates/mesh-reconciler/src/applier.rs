// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Change application for one bucket.
//!
//! The backend replaces a bucket's replication document as a whole, so a
//! change list is applied as a single write: foreign rules are carried over
//! verbatim, mesh rules are rebuilt from the live ones plus the changes. A
//! document left without rules is deleted rather than written.

use std::collections::BTreeMap;
use std::sync::Arc;

use mesh_core::{BucketRef, ConfigRule, ReplicationConfiguration, ReplicationRule, RetryConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{BackendOp, MeshBackend};
use crate::differ::{ChangeKind, ChangeList};
use crate::error::MeshError;
use crate::reader::LiveState;
use crate::retry::with_retry;

/// What the applier did to a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    /// A new document was written, or the document was deleted.
    Applied {
        /// Rules added.
        added: usize,
        /// Rules removed.
        removed: usize,
        /// Rules replaced.
        replaced: usize,
    },
    /// The bucket already matched.
    Unchanged,
    /// Dry run: the bucket would have been written with these changes.
    Planned(ChangeList),
}

/// The document a bucket must end up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDocument {
    /// Write this document.
    Put(ReplicationConfiguration),
    /// Remove the document; no rules remain.
    Delete,
}

/// Computes the target document from live state and a change list.
///
/// Returns `None` when no write is needed: the change list is empty and the
/// document role already matches, or the bucket has neither rules nor a
/// document.
pub fn target_document(
    live: &LiveState,
    changes: &ChangeList,
    identity_arn: &str,
) -> Option<TargetDocument> {
    let mut mesh: BTreeMap<&str, &ReplicationRule> =
        live.mesh_rules.iter().map(|r| (r.id.as_str(), r)).collect();
    for change in changes {
        match change.kind {
            ChangeKind::Remove => {
                mesh.remove(change.rule.id.as_str());
            }
            ChangeKind::Add | ChangeKind::Replace => {
                mesh.insert(change.rule.id.as_str(), &change.rule);
            }
        }
    }

    let mut mesh_rules: Vec<&ReplicationRule> = mesh.into_values().collect();
    mesh_rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

    let role_drift = !mesh_rules.is_empty() && live.role.as_deref() != Some(identity_arn);
    if changes.is_empty() && !role_drift {
        return None;
    }

    if mesh_rules.is_empty() && live.foreign_rules.is_empty() {
        return live.has_document().then_some(TargetDocument::Delete);
    }

    let role = match (&live.role, mesh_rules.is_empty()) {
        (Some(role), true) => role.clone(),
        _ => identity_arn.to_string(),
    };
    let rules: Vec<ConfigRule> = live
        .foreign_rules
        .iter()
        .cloned()
        .chain(mesh_rules.into_iter().map(ReplicationRule::to_config_rule))
        .collect();

    Some(TargetDocument::Put(ReplicationConfiguration::new(role, rules)))
}

/// Applies change lists to buckets.
#[derive(Clone)]
pub struct BucketApplier {
    backend: Arc<dyn MeshBackend>,
    retry: RetryConfig,
    dry_run: bool,
}

impl BucketApplier {
    /// Creates an applier.
    pub fn new(backend: Arc<dyn MeshBackend>, retry: RetryConfig) -> Self {
        Self { backend, retry, dry_run: false }
    }

    /// Plan writes instead of performing them.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Applies `changes` to `bucket` in one document write.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` if the resulting document is invalid (for example
    /// a foreign rule shares a priority with a mesh rule), otherwise the
    /// classified backend failure.
    pub async fn apply(
        &self,
        bucket: &BucketRef,
        live: &LiveState,
        changes: &ChangeList,
        identity_arn: &str,
    ) -> Result<ApplyOutcome, MeshError> {
        let name = &bucket.name;
        let Some(target) = target_document(live, changes, identity_arn) else {
            debug!(bucket = %name, "Bucket already matches");
            return Ok(ApplyOutcome::Unchanged);
        };

        if let TargetDocument::Put(document) = &target {
            document
                .validate()
                .map_err(|e| MeshError::Rejected { bucket: name.clone(), reason: e.to_string() })?;
        }

        if self.dry_run {
            info!(bucket = %name, changes = changes.len(), "Planned replication changes");
            return Ok(ApplyOutcome::Planned(changes.clone()));
        }

        let written = match &target {
            TargetDocument::Put(document) => {
                with_retry(&self.retry, BackendOp::PutReplication, name, || {
                    self.backend.put_replication(bucket, document)
                })
                .await
            }
            TargetDocument::Delete => {
                with_retry(&self.retry, BackendOp::DeleteReplication, name, || {
                    self.backend.delete_replication(bucket)
                })
                .await
            }
        };
        written.map_err(|e| MeshError::from_backend(name, e))?;

        let added = changes.count(ChangeKind::Add);
        let removed = changes.count(ChangeKind::Remove);
        let replaced = changes.count(ChangeKind::Replace);
        info!(
            bucket = %name,
            added = added,
            removed = removed,
            replaced = replaced,
            deleted_document = matches!(target, TargetDocument::Delete),
            "Applied replication changes"
        );
        Ok(ApplyOutcome::Applied { added, removed, replaced })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mesh_core::replication::{ReplicationDestination, RuleStatus};
    use mesh_core::RuleOptions;

    use super::*;
    use crate::differ::Differ;
    use crate::error::BackendError;
    use crate::memory::MemoryBackend;

    const ROLE: &str = "arn:aws:iam::111:role/repl";
    const OLD_ROLE: &str = "arn:aws:iam::111:role/old";

    fn rule(source: &str, destination: &str, priority: u32) -> ReplicationRule {
        ReplicationRule::new(source, destination, priority, RuleOptions::default())
    }

    fn foreign(priority: u32) -> ConfigRule {
        ConfigRule {
            id: Some("manual".to_string()),
            status: RuleStatus::Enabled,
            priority: Some(priority),
            prefix: None,
            filter: None,
            destination: ReplicationDestination::bucket("archive"),
            delete_marker_replication: None,
            source_selection_criteria: None,
            existing_object_replication: None,
        }
    }

    fn applier(backend: &Arc<MemoryBackend>) -> BucketApplier {
        let retry = RetryConfig::new()
            .initial_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(5));
        BucketApplier::new(backend.clone(), retry)
    }

    fn bucket() -> BucketRef {
        BucketRef::new("a-1", "us-east-1")
    }

    #[test]
    fn test_target_keeps_foreign_rules_first() {
        let live = LiveState {
            role: Some(OLD_ROLE.to_string()),
            mesh_rules: vec![],
            foreign_rules: vec![foreign(100)],
        };
        let desired = vec![rule("a-1", "b-2", 0)];
        let changes = Differ::diff(&desired, &live.mesh_rules);

        let Some(TargetDocument::Put(document)) = target_document(&live, &changes, ROLE) else {
            panic!("expected a put");
        };
        assert_eq!(document.role, ROLE);
        assert_eq!(document.rules[0], foreign(100));
        assert_eq!(document.rules[1], desired[0].to_config_rule());
    }

    #[test]
    fn test_target_none_when_unchanged() {
        let desired = vec![rule("a-1", "b-2", 0)];
        let live =
            LiveState { role: Some(ROLE.to_string()), mesh_rules: desired.clone(), foreign_rules: vec![] };
        assert_eq!(target_document(&live, &Differ::diff(&desired, &live.mesh_rules), ROLE), None);
    }

    #[test]
    fn test_role_drift_forces_write() {
        let desired = vec![rule("a-1", "b-2", 0)];
        let live = LiveState {
            role: Some(OLD_ROLE.to_string()),
            mesh_rules: desired.clone(),
            foreign_rules: vec![],
        };
        let changes = Differ::diff(&desired, &live.mesh_rules);
        assert!(changes.is_empty());

        let Some(TargetDocument::Put(document)) = target_document(&live, &changes, ROLE) else {
            panic!("expected a put");
        };
        assert_eq!(document.role, ROLE);
    }

    #[test]
    fn test_foreign_only_keeps_live_role() {
        let live = LiveState {
            role: Some(OLD_ROLE.to_string()),
            mesh_rules: vec![rule("a-1", "b-2", 0)],
            foreign_rules: vec![foreign(100)],
        };
        let changes = Differ::diff(&[], &live.mesh_rules);

        let Some(TargetDocument::Put(document)) = target_document(&live, &changes, ROLE) else {
            panic!("expected a put");
        };
        assert_eq!(document.role, OLD_ROLE);
        assert_eq!(document.rules, vec![foreign(100)]);
    }

    #[test]
    fn test_no_rules_left_deletes_document() {
        let live = LiveState {
            role: Some(ROLE.to_string()),
            mesh_rules: vec![rule("a-1", "b-2", 0)],
            foreign_rules: vec![],
        };
        let changes = Differ::diff(&[], &live.mesh_rules);
        assert_eq!(target_document(&live, &changes, ROLE), Some(TargetDocument::Delete));
        assert_eq!(target_document(&LiveState::default(), &ChangeList::default(), ROLE), None);
    }

    #[tokio::test]
    async fn test_apply_writes_document() {
        let backend = Arc::new(MemoryBackend::new().with_bucket("a-1", "us-east-1"));
        let desired = vec![rule("a-1", "b-2", 0), rule("a-1", "c-3", 1)];
        let changes = Differ::diff(&desired, &[]);

        let outcome =
            applier(&backend).apply(&bucket(), &LiveState::default(), &changes, ROLE).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied { added: 2, removed: 0, replaced: 0 });

        let document = backend.replication("a-1").unwrap();
        assert_eq!(document.mesh_rules().count(), 2);
        assert_eq!(backend.calls(BackendOp::PutReplication), 1);
    }

    #[tokio::test]
    async fn test_apply_retries_transient_failures() {
        let backend = Arc::new(MemoryBackend::new().with_bucket("a-1", "us-east-1"));
        backend.fail(
            "a-1",
            BackendOp::PutReplication,
            BackendError::transient("s3:PutReplicationConfiguration", "a-1", "SlowDown"),
            Some(2),
        );
        let changes = Differ::diff(&[rule("a-1", "b-2", 0)], &[]);

        let outcome = applier(&backend).apply(&bucket(), &LiveState::default(), &changes, ROLE).await;
        assert!(outcome.is_ok());
        assert_eq!(backend.calls(BackendOp::PutReplication), 3);
    }

    #[tokio::test]
    async fn test_apply_permission_denied_not_retried() {
        let backend = Arc::new(MemoryBackend::new().with_bucket("a-1", "us-east-1"));
        backend.fail(
            "a-1",
            BackendOp::PutReplication,
            BackendError::permission_denied("iam:PassRole", ROLE, "not authorized to pass role"),
            None,
        );
        let changes = Differ::diff(&[rule("a-1", "b-2", 0)], &[]);

        let err = applier(&backend)
            .apply(&bucket(), &LiveState::default(), &changes, ROLE)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::PermissionDenied { ref action, .. } if action == "iam:PassRole"));
        assert_eq!(backend.calls(BackendOp::PutReplication), 1);
    }

    #[tokio::test]
    async fn test_priority_collision_rejected_before_write() {
        let backend = Arc::new(MemoryBackend::new().with_bucket("a-1", "us-east-1"));
        let live =
            LiveState { role: Some(OLD_ROLE.to_string()), mesh_rules: vec![], foreign_rules: vec![foreign(0)] };
        let changes = Differ::diff(&[rule("a-1", "b-2", 0)], &[]);

        let err = applier(&backend).apply(&bucket(), &live, &changes, ROLE).await.unwrap_err();
        assert!(matches!(err, MeshError::Rejected { .. }));
        assert_eq!(backend.calls(BackendOp::PutReplication), 0);
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_writing() {
        let backend = Arc::new(MemoryBackend::new().with_bucket("a-1", "us-east-1"));
        let changes = Differ::diff(&[rule("a-1", "b-2", 0)], &[]);

        let outcome = applier(&backend)
            .dry_run(true)
            .apply(&bucket(), &LiveState::default(), &changes, ROLE)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Planned(changes));
        assert!(backend.writes().is_empty());
    }
}
