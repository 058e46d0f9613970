// Copyright 2024 The Rucket Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types for mesh declarations and configuration.

use thiserror::Error;

/// A specialized `Result` type for mesh-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a declared mesh is rejected before any backend call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    /// The same bucket name appears more than once.
    #[error("duplicate bucket name: {0}")]
    DuplicateBucket(String),

    /// A bucket name is not a valid backend identifier.
    #[error("invalid bucket name {name:?}: {reason}")]
    InvalidBucketName {
        /// The offending name.
        name: String,
        /// Why the name was rejected.
        reason: &'static str,
    },

    /// A bucket was declared without a region.
    #[error("bucket {0} has an empty region")]
    MissingRegion(String),

    /// The replication identity is not an IAM role ARN.
    #[error("malformed replication identity {arn:?}: {reason}")]
    MalformedIdentity {
        /// The offending ARN.
        arn: String,
        /// Why the ARN was rejected.
        reason: &'static str,
    },
}

/// Errors that can occur while loading mesh-core data.
#[derive(Debug, Error)]
pub enum Error {
    /// The declared mesh is invalid.
    #[error("invalid spec: {0}")]
    InvalidSpec(#[from] SpecError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_error_display() {
        let err = SpecError::DuplicateBucket("logs".to_string());
        assert_eq!(err.to_string(), "duplicate bucket name: logs");

        let err = SpecError::MalformedIdentity { arn: "nope".to_string(), reason: "not an ARN" };
        assert_eq!(err.to_string(), "malformed replication identity \"nope\": not an ARN");
    }

    #[test]
    fn test_error_from_spec_error() {
        let err: Error = SpecError::MissingRegion("logs".to_string()).into();
        assert!(matches!(err, Error::InvalidSpec(_)));
        assert_eq!(err.to_string(), "invalid spec: bucket logs has an empty region");
    }
}
