//! Error types for mesh reconciliation.
//!
//! Backend calls fail with a [`BackendError`]. The pipeline classifies it
//! into a [`MeshError`] at the applier boundary, and only the resulting
//! [`BucketFailure`] (bucket, kind, reason) reaches the aggregate outcome.

use std::fmt;

use mesh_core::SpecError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, MeshError>;

/// Classification of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Throttling, timeouts, 5xx. Safe to retry.
    Transient,
    /// The caller lacks permission for the action.
    PermissionDenied,
    /// The bucket does not exist.
    NotFound,
    /// The backend refused the request as malformed.
    InvalidRequest,
    /// Anything else; not retried.
    Other,
}

impl BackendErrorKind {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::InvalidRequest => "invalid_request",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{action} on {resource} failed ({kind}): {message}")]
pub struct BackendError {
    /// Error classification.
    pub kind: BackendErrorKind,
    /// The action attempted, e.g. `s3:PutReplicationConfiguration`.
    pub action: String,
    /// The resource acted upon.
    pub resource: String,
    /// The backend's message, verbatim.
    pub message: String,
}

impl BackendError {
    /// Creates a backend error.
    pub fn new(
        kind: BackendErrorKind,
        action: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self { kind, action: action.into(), resource: resource.into(), message: message.into() }
    }

    /// Creates a transient error.
    pub fn transient(action: impl Into<String>, resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transient, action, resource, message)
    }

    /// Creates a permission-denied error.
    pub fn permission_denied(
        action: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(BackendErrorKind::PermissionDenied, action, resource, message)
    }

    /// Creates a bucket-not-found error.
    pub fn not_found(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, action, resource, "The specified bucket does not exist")
    }

    /// Creates an invalid-request error.
    pub fn invalid_request(
        action: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(BackendErrorKind::InvalidRequest, action, resource, message)
    }

    /// Returns true if the call may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        self.kind == BackendErrorKind::Transient
    }

    /// Returns true if the bucket does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind == BackendErrorKind::NotFound
    }
}

/// Terminal error kind of one bucket's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// A backend precondition (versioning) is not met.
    PreconditionUnmet,
    /// Transient errors persisted past the retry budget.
    TransientBackend,
    /// The backend denied an action.
    PermissionDenied,
    /// The bucket does not exist.
    BucketNotFound,
    /// The backend refused the request, or the document was invalid.
    Rejected,
    /// The pipeline exceeded its deadline.
    TimedOut,
    /// The run was cancelled before the bucket was processed.
    Cancelled,
    /// The pipeline did not run to completion.
    Internal,
}

impl FailureKind {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreconditionUnmet => "PreconditionUnmet",
            Self::TransientBackend => "TransientBackendError",
            Self::PermissionDenied => "PermissionDenied",
            Self::BucketNotFound => "BucketNotFound",
            Self::Rejected => "Rejected",
            Self::TimedOut => "TimedOut",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bucket that did not converge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketFailure {
    /// Bucket name.
    pub bucket: String,
    /// Terminal error kind.
    pub kind: FailureKind,
    /// Human-readable reason, including the backend message where one exists.
    pub reason: String,
}

impl fmt::Display for BucketFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}: {})", self.bucket, self.kind, self.reason)
    }
}

fn join_failures(failures: &[BucketFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Errors that can occur during reconciliation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// The declared mesh is malformed. No backend call was made.
    #[error("InvalidSpec: {0}")]
    InvalidSpec(#[from] SpecError),

    /// A backend precondition is not met.
    #[error("PreconditionUnmet: bucket {bucket}: {reason}")]
    PreconditionUnmet {
        /// The bucket.
        bucket: String,
        /// Why the precondition failed.
        reason: String,
    },

    /// Transient backend errors outlasted the retry budget.
    #[error("TransientBackendError: bucket {bucket}: {reason}")]
    TransientBackend {
        /// The bucket.
        bucket: String,
        /// The last backend message.
        reason: String,
    },

    /// The backend denied an action.
    #[error("PermissionDenied: bucket {bucket}: {action} on {resource} denied: {reason}")]
    PermissionDenied {
        /// The bucket.
        bucket: String,
        /// The denied action.
        action: String,
        /// The resource the action targeted.
        resource: String,
        /// The backend's denial message, verbatim.
        reason: String,
    },

    /// The bucket does not exist.
    #[error("BucketNotFound: bucket {bucket} does not exist")]
    BucketNotFound {
        /// The bucket.
        bucket: String,
    },

    /// The backend refused the request, or the document failed validation.
    #[error("Rejected: bucket {bucket}: {reason}")]
    Rejected {
        /// The bucket.
        bucket: String,
        /// Why.
        reason: String,
    },

    /// A bucket pipeline exceeded its deadline.
    #[error("TimedOut: bucket {bucket} did not finish within {timeout_ms}ms")]
    TimedOut {
        /// The bucket.
        bucket: String,
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The run was cancelled before the bucket was processed.
    #[error("Cancelled: bucket {bucket} was not processed")]
    Cancelled {
        /// The bucket.
        bucket: String,
    },

    /// A bucket pipeline did not run to completion.
    #[error("Internal: bucket {bucket}: {reason}")]
    Internal {
        /// The bucket.
        bucket: String,
        /// Why.
        reason: String,
    },

    /// Some buckets converged and some did not.
    #[error("PartialMeshFailure: {} of {total} buckets failed: {}", failures.len(), join_failures(failures))]
    PartialMeshFailure {
        /// Number of buckets processed.
        total: usize,
        /// The buckets that did not converge.
        failures: Vec<BucketFailure>,
    },

    /// The lifecycle event could not be decoded.
    #[error("malformed lifecycle event: {0}")]
    Event(String),
}

impl MeshError {
    /// Classifies a backend error for `bucket`.
    ///
    /// Transient errors reaching this point have exhausted their retries.
    pub fn from_backend(bucket: &str, err: BackendError) -> Self {
        let bucket = bucket.to_string();
        match err.kind {
            BackendErrorKind::Transient => Self::TransientBackend { bucket, reason: err.to_string() },
            BackendErrorKind::PermissionDenied => Self::PermissionDenied {
                bucket,
                action: err.action,
                resource: err.resource,
                reason: err.message,
            },
            BackendErrorKind::NotFound => Self::BucketNotFound { bucket },
            BackendErrorKind::InvalidRequest | BackendErrorKind::Other => {
                Self::Rejected { bucket, reason: err.to_string() }
            }
        }
    }

    /// Returns the bucket-level failure this error represents, if any.
    pub fn to_failure(&self) -> Option<BucketFailure> {
        let (bucket, kind) = match self {
            Self::PreconditionUnmet { bucket, .. } => (bucket, FailureKind::PreconditionUnmet),
            Self::TransientBackend { bucket, .. } => (bucket, FailureKind::TransientBackend),
            Self::PermissionDenied { bucket, .. } => (bucket, FailureKind::PermissionDenied),
            Self::BucketNotFound { bucket } => (bucket, FailureKind::BucketNotFound),
            Self::Rejected { bucket, .. } => (bucket, FailureKind::Rejected),
            Self::TimedOut { bucket, .. } => (bucket, FailureKind::TimedOut),
            Self::Cancelled { bucket } => (bucket, FailureKind::Cancelled),
            Self::Internal { bucket, .. } => (bucket, FailureKind::Internal),
            Self::InvalidSpec(_) | Self::PartialMeshFailure { .. } | Self::Event(_) => return None,
        };
        let reason = match self {
            Self::PreconditionUnmet { reason, .. }
            | Self::TransientBackend { reason, .. }
            | Self::Rejected { reason, .. }
            | Self::Internal { reason, .. } => reason.clone(),
            Self::PermissionDenied { action, resource, reason, .. } => {
                format!("{action} on {resource} denied: {reason}")
            }
            Self::BucketNotFound { .. } => "bucket does not exist".to_string(),
            Self::TimedOut { timeout_ms, .. } => format!("did not finish within {timeout_ms}ms"),
            Self::Cancelled { .. } => "cancelled before the bucket was processed".to_string(),
            Self::InvalidSpec(_) | Self::PartialMeshFailure { .. } | Self::Event(_) => String::new(),
        };
        Some(BucketFailure { bucket: bucket.clone(), kind, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::permission_denied(
            "s3:PutReplicationConfiguration",
            "x-1",
            "Access Denied",
        );
        assert_eq!(
            err.to_string(),
            "s3:PutReplicationConfiguration on x-1 failed (permission_denied): Access Denied"
        );
        assert!(!err.is_retryable());
        assert!(BackendError::transient("s3:GetBucketVersioning", "x-1", "SlowDown").is_retryable());
    }

    #[test]
    fn test_classify_permission_denied_keeps_details() {
        let err = MeshError::from_backend(
            "x-1",
            BackendError::permission_denied("iam:PassRole", "arn:aws:iam::111:role/repl", "denied"),
        );
        assert_eq!(
            err,
            MeshError::PermissionDenied {
                bucket: "x-1".to_string(),
                action: "iam:PassRole".to_string(),
                resource: "arn:aws:iam::111:role/repl".to_string(),
                reason: "denied".to_string(),
            }
        );
        let failure = err.to_failure().unwrap();
        assert_eq!(failure.kind, FailureKind::PermissionDenied);
        assert!(failure.reason.contains("iam:PassRole"));
    }

    #[test]
    fn test_classify_kinds() {
        let classify = |kind| MeshError::from_backend("b-1", BackendError::new(kind, "a", "r", "m"));
        assert!(matches!(classify(BackendErrorKind::Transient), MeshError::TransientBackend { .. }));
        assert!(matches!(classify(BackendErrorKind::NotFound), MeshError::BucketNotFound { .. }));
        assert!(matches!(classify(BackendErrorKind::InvalidRequest), MeshError::Rejected { .. }));
        assert!(matches!(classify(BackendErrorKind::Other), MeshError::Rejected { .. }));
    }

    #[test]
    fn test_partial_failure_names_buckets_and_kinds() {
        let err = MeshError::PartialMeshFailure {
            total: 3,
            failures: vec![BucketFailure {
                bucket: "x-2".to_string(),
                kind: FailureKind::PermissionDenied,
                reason: "s3:PutReplicationConfiguration on x-2 denied: Access Denied".to_string(),
            }],
        };
        let message = err.to_string();
        assert!(message.starts_with("PartialMeshFailure: 1 of 3 buckets failed"));
        assert!(message.contains("x-2 (PermissionDenied"));
        assert!(err.to_failure().is_none());
    }

    #[test]
    fn test_invalid_spec_display() {
        let err: MeshError = SpecError::DuplicateBucket("x-1".to_string()).into();
        assert_eq!(err.to_string(), "InvalidSpec: duplicate bucket name: x-1");
    }
}
