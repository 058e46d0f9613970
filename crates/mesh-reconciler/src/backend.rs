//! The storage backend seam.
//!
//! Every side effect of a reconciliation goes through [`MeshBackend`].
//! Implementations classify their failures into [`BackendError`] so the
//! reconciler never sees SDK error types.

use async_trait::async_trait;
use mesh_core::{BucketRef, ReplicationConfiguration};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Versioning state of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VersioningStatus {
    /// Versioning has never been enabled.
    #[default]
    Unversioned,
    /// Versioning is enabled.
    Enabled,
    /// Versioning was enabled and later suspended.
    Suspended,
}

impl VersioningStatus {
    /// Returns true if replication may be configured on the bucket.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Backend operations, used for retries, metrics and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    /// Read a bucket's replication document.
    GetReplication,
    /// Replace a bucket's replication document.
    PutReplication,
    /// Remove a bucket's replication document.
    DeleteReplication,
    /// Read a bucket's versioning state.
    GetVersioning,
    /// Enable versioning on a bucket.
    EnableVersioning,
    /// Look up the region of a bucket by name.
    LocateBucket,
}

impl BackendOp {
    /// Short name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetReplication => "get_replication",
            Self::PutReplication => "put_replication",
            Self::DeleteReplication => "delete_replication",
            Self::GetVersioning => "get_versioning",
            Self::EnableVersioning => "enable_versioning",
            Self::LocateBucket => "locate_bucket",
        }
    }

    /// IAM action the operation requires.
    pub fn action(&self) -> &'static str {
        match self {
            Self::GetReplication => "s3:GetReplicationConfiguration",
            Self::PutReplication => "s3:PutReplicationConfiguration",
            Self::DeleteReplication => "s3:DeleteBucketReplication",
            Self::GetVersioning => "s3:GetBucketVersioning",
            Self::EnableVersioning => "s3:PutBucketVersioning",
            Self::LocateBucket => "s3:GetBucketLocation",
        }
    }

    /// Returns true if the operation mutates the bucket.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::PutReplication | Self::DeleteReplication | Self::EnableVersioning)
    }
}

/// A storage service that holds buckets and their replication documents.
#[async_trait]
pub trait MeshBackend: Send + Sync {
    /// Returns a short name for logs.
    fn name(&self) -> &str;

    /// Reads the replication document of a bucket.
    ///
    /// Returns `Ok(None)` when the bucket exists but has no document, and an
    /// error of kind `NotFound` when the bucket itself does not exist.
    async fn get_replication(
        &self,
        bucket: &BucketRef,
    ) -> Result<Option<ReplicationConfiguration>, BackendError>;

    /// Atomically replaces the replication document of a bucket.
    async fn put_replication(
        &self,
        bucket: &BucketRef,
        config: &ReplicationConfiguration,
    ) -> Result<(), BackendError>;

    /// Removes the replication document of a bucket.
    async fn delete_replication(&self, bucket: &BucketRef) -> Result<(), BackendError>;

    /// Reads the versioning state of a bucket.
    async fn get_versioning(&self, bucket: &BucketRef) -> Result<VersioningStatus, BackendError>;

    /// Enables versioning on a bucket. Idempotent.
    async fn enable_versioning(&self, bucket: &BucketRef) -> Result<(), BackendError>;

    /// Looks up the region of a bucket by name.
    ///
    /// Returns `Ok(None)` if the bucket does not exist or the backend cannot
    /// locate buckets.
    async fn locate_bucket(&self, _name: &str) -> Result<Option<String>, BackendError> {
        Ok(None)
    }
}
