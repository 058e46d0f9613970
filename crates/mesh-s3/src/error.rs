//! Mapping of S3 errors onto [`BackendError`].

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use mesh_reconciler::{BackendError, BackendErrorKind, BackendOp};

/// Error code returned when a bucket has no replication configuration.
pub const REPLICATION_NOT_FOUND: &str = "ReplicationConfigurationNotFoundError";

/// Classifies an S3 error by its code and HTTP status.
pub fn classify(code: Option<&str>, status: Option<u16>) -> BackendErrorKind {
    match code {
        Some("NoSuchBucket") => BackendErrorKind::NotFound,
        Some(
            "AccessDenied" | "AllAccessDisabled" | "InvalidAccessKeyId" | "SignatureDoesNotMatch"
            | "AccountProblem",
        ) => BackendErrorKind::PermissionDenied,
        Some(
            "SlowDown" | "Throttling" | "ThrottlingException" | "RequestTimeout"
            | "RequestTimeTooSkewed" | "InternalError" | "ServiceUnavailable"
            | "OperationAborted",
        ) => BackendErrorKind::Transient,
        Some(
            "InvalidRequest" | "InvalidArgument" | "MalformedXML" | "InvalidBucketState"
            | "InvalidStorageClass",
        ) => BackendErrorKind::InvalidRequest,
        _ => match status {
            Some(403) => BackendErrorKind::PermissionDenied,
            Some(404) => BackendErrorKind::NotFound,
            Some(408 | 429) => BackendErrorKind::Transient,
            Some(s) if s >= 500 => BackendErrorKind::Transient,
            Some(400) => BackendErrorKind::InvalidRequest,
            _ => BackendErrorKind::Other,
        },
    }
}

/// Returns the S3 error code of `err`, if the service sent one.
pub(crate) fn error_code<E>(err: &SdkError<E, HttpResponse>) -> Option<&str>
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::ServiceError(service) => service.err().code(),
        _ => None,
    }
}

/// Converts an SDK error for `op` on `resource`.
pub(crate) fn from_sdk<E>(err: SdkError<E, HttpResponse>, op: BackendOp, resource: &str) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let kind = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => BackendErrorKind::Transient,
        SdkError::ResponseError(_) => BackendErrorKind::Transient,
        SdkError::ServiceError(service) => {
            classify(service.err().code(), Some(service.raw().status().as_u16()))
        }
        _ => BackendErrorKind::Other,
    };
    let message = match &err {
        SdkError::ServiceError(service) => match (service.err().code(), service.err().message()) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (Some(code), None) => code.to_string(),
            _ => DisplayErrorContext(&err).to_string(),
        },
        _ => DisplayErrorContext(&err).to_string(),
    };
    BackendError::new(kind, op.action(), resource, message)
}
