//! Core types and utilities for bucket-mesh replication.
//!
//! This crate provides the building blocks shared by the reconciler, the
//! storage backends and the command-line tool:
//! - The declared mesh ([`MeshSpec`]) and its validation
//! - Replication documents as stored by the backend
//! - Mesh-owned rules and their stable ids
//! - Configuration management

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod hash;
pub mod replication;
pub mod rule;
pub mod types;

pub use config::{
    BackendConfig, Config, ConfigValidationError, LogFormat, LoggingConfig, ReconcilerConfig,
    RetryConfig, VersioningPolicy,
};
pub use error::{Error, Result, SpecError};
pub use hash::{is_mesh_rule_id, physical_id, rule_id};
pub use replication::{ConfigRule, DocumentError, ReplicationConfiguration, RuleStatus};
pub use rule::ReplicationRule;
pub use types::{BucketRef, MeshSpec, RuleOptions};
