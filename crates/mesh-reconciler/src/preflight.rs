//! Backend preconditions for replication.

use std::sync::Arc;

use mesh_core::{BucketRef, RetryConfig, VersioningPolicy};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{BackendOp, MeshBackend};
use crate::error::{BackendErrorKind, MeshError};
use crate::retry::with_retry;

/// A passed precondition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreflightStatus {
    /// Versioning was already enabled.
    Ok,
    /// Versioning was enabled by this check.
    Remediated,
    /// Versioning is off and would be enabled; nothing was written.
    RemediationPlanned,
}

/// Verifies that a bucket can hold replication rules.
#[derive(Clone)]
pub struct PreflightChecker {
    backend: Arc<dyn MeshBackend>,
    retry: RetryConfig,
    policy: VersioningPolicy,
    dry_run: bool,
}

impl PreflightChecker {
    /// Creates a checker.
    pub fn new(backend: Arc<dyn MeshBackend>, retry: RetryConfig, policy: VersioningPolicy) -> Self {
        Self { backend, retry, policy, dry_run: false }
    }

    /// Report what would be remediated instead of doing it.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Ensures versioning is enabled on `bucket`.
    ///
    /// # Errors
    ///
    /// Returns `PreconditionUnmet` when versioning is off and the policy
    /// forbids remediation, or when enabling it is refused. Other backend
    /// failures are classified as usual.
    pub async fn ensure(&self, bucket: &BucketRef) -> Result<PreflightStatus, MeshError> {
        let name = &bucket.name;
        let status = with_retry(&self.retry, BackendOp::GetVersioning, name, || {
            self.backend.get_versioning(bucket)
        })
        .await
        .map_err(|e| MeshError::from_backend(name, e))?;

        if status.is_enabled() {
            return Ok(PreflightStatus::Ok);
        }

        if self.policy == VersioningPolicy::Fail {
            warn!(bucket = %name, versioning = ?status, "Versioning is not enabled");
            return Err(MeshError::PreconditionUnmet {
                bucket: name.clone(),
                reason: format!("versioning is {status:?}; replication requires it to be enabled"),
            });
        }

        if self.dry_run {
            info!(bucket = %name, versioning = ?status, "Would enable versioning");
            return Ok(PreflightStatus::RemediationPlanned);
        }

        with_retry(&self.retry, BackendOp::EnableVersioning, name, || {
            self.backend.enable_versioning(bucket)
        })
        .await
        .map_err(|e| match e.kind {
            BackendErrorKind::InvalidRequest | BackendErrorKind::Other => {
                MeshError::PreconditionUnmet {
                    bucket: name.clone(),
                    reason: format!("versioning could not be enabled: {}", e.message),
                }
            }
            _ => MeshError::from_backend(name, e),
        })?;

        info!(bucket = %name, previous = ?status, "Enabled versioning");
        Ok(PreflightStatus::Remediated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VersioningStatus;
    use crate::error::BackendError;
    use crate::memory::MemoryBackend;

    fn bucket() -> BucketRef {
        BucketRef::new("x-1", "us-east-1")
    }

    fn checker(backend: &Arc<MemoryBackend>, policy: VersioningPolicy) -> PreflightChecker {
        PreflightChecker::new(backend.clone(), RetryConfig::default(), policy)
    }

    #[tokio::test]
    async fn test_enabled_is_ok() {
        let backend = Arc::new(MemoryBackend::new().with_bucket("x-1", "us-east-1"));
        let status = checker(&backend, VersioningPolicy::Fail).ensure(&bucket()).await.unwrap();
        assert_eq!(status, PreflightStatus::Ok);
        assert!(backend.writes().is_empty());
    }

    #[tokio::test]
    async fn test_remediates_when_allowed() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_bucket("x-1", "us-east-1", VersioningStatus::Suspended);

        let status = checker(&backend, VersioningPolicy::Remediate).ensure(&bucket()).await.unwrap();
        assert_eq!(status, PreflightStatus::Remediated);
        assert_eq!(backend.versioning("x-1"), Some(VersioningStatus::Enabled));
    }

    #[tokio::test]
    async fn test_fails_when_policy_forbids() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_bucket("x-1", "us-east-1", VersioningStatus::Unversioned);

        let err = checker(&backend, VersioningPolicy::Fail).ensure(&bucket()).await.unwrap_err();
        assert!(matches!(err, MeshError::PreconditionUnmet { .. }));
        assert_eq!(backend.versioning("x-1"), Some(VersioningStatus::Unversioned));
    }

    #[tokio::test]
    async fn test_dry_run_does_not_write() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_bucket("x-1", "us-east-1", VersioningStatus::Unversioned);

        let status = checker(&backend, VersioningPolicy::Remediate)
            .dry_run(true)
            .ensure(&bucket())
            .await
            .unwrap();
        assert_eq!(status, PreflightStatus::RemediationPlanned);
        assert_eq!(backend.calls(BackendOp::EnableVersioning), 0);
    }

    #[tokio::test]
    async fn test_refused_remediation_is_precondition_unmet() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_bucket("x-1", "us-east-1", VersioningStatus::Suspended);
        backend.fail(
            "x-1",
            BackendOp::EnableVersioning,
            BackendError::invalid_request("s3:PutBucketVersioning", "x-1", "object lock conflict"),
            None,
        );

        let err = checker(&backend, VersioningPolicy::Remediate).ensure(&bucket()).await.unwrap_err();
        assert!(matches!(err, MeshError::PreconditionUnmet { ref reason, .. } if reason.contains("object lock")));
    }

    #[tokio::test]
    async fn test_missing_bucket() {
        let backend = Arc::new(MemoryBackend::new());
        let err = checker(&backend, VersioningPolicy::Remediate).ensure(&bucket()).await.unwrap_err();
        assert_eq!(err, MeshError::BucketNotFound { bucket: "x-1".to_string() });
    }
}
