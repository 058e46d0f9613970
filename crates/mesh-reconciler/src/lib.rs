//! Full-mesh replication reconciliation for bucket-mesh.
//!
//! Given a declared set of buckets, every bucket must replicate to every
//! other one. The reconciler computes the rules each bucket needs, compares
//! them with what the backend holds, and writes the smallest change per
//! bucket. Runs are idempotent: retrying after any failure converges.
//!
//! # Architecture
//!
//! ```text
//! LifecycleEvent
//!      │
//!      ▼
//! ┌──────────────┐   MeshSpec    ┌────────────────┐
//! │ EventAdapter │──────────────►│ MeshReconciler │── RuleCompiler
//! └──────────────┘               └───────┬────────┘
//!                                        │ one pipeline per bucket,
//!                                        │ bounded concurrency
//!                                        ▼
//!        PreflightChecker ──► LiveStateReader ──► Differ ──► BucketApplier
//!                                        │
//!                                        ▼
//!                                  MeshBackend
//!                          (S3, or in-memory for tests)
//! ```
//!
//! Rules owned by the mesh are recognized by their id prefix; any other rule
//! in a bucket's document is left untouched.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mesh_core::{BucketRef, MeshSpec};
//! use mesh_reconciler::{MemoryBackend, MeshReconciler, ReconcileRequest};
//!
//! let backend = Arc::new(
//!     MemoryBackend::new().with_bucket("x-1", "us-east-1").with_bucket("x-2", "eu-west-1"),
//! );
//! let spec = MeshSpec::new(
//!     vec![BucketRef::new("x-1", "us-east-1"), BucketRef::new("x-2", "eu-west-1")],
//!     "arn:aws:iam::111:role/repl",
//! );
//! let outcome = MeshReconciler::new(backend).reconcile(ReconcileRequest::Create { spec }).await;
//! assert!(outcome.is_success());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod applier;
pub mod backend;
pub mod compiler;
pub mod differ;
pub mod error;
pub mod event;
pub mod memory;
pub mod preflight;
pub mod reader;
pub mod reconciler;
pub mod registry;
pub mod retry;

pub use applier::{target_document, ApplyOutcome, BucketApplier, TargetDocument};
pub use backend::{BackendOp, MeshBackend, VersioningStatus};
pub use compiler::{DesiredRules, RuleCompiler};
pub use differ::{Change, ChangeKind, ChangeList, Differ};
pub use error::{
    BackendError, BackendErrorKind, BucketFailure, FailureKind, MeshError, Result,
};
pub use event::{
    CreateRequest, DeleteRequest, EventAdapter, LifecycleEvent, LifecycleResponse, MeshProperties,
    RequestContext, ResponseData, ResponseStatus, UpdateRequest,
};
pub use memory::MemoryBackend;
pub use preflight::{PreflightChecker, PreflightStatus};
pub use reader::{LiveRead, LiveState, LiveStateReader};
pub use reconciler::{
    BucketReport, BucketRole, BucketStatus, MeshReconciler, ReconcileMode, ReconcileOutcome,
    ReconcileRequest, ReconcileState,
};
pub use registry::{
    DeploymentScope, PermissionSet, PolicyDocument, PolicyStatement, ProviderHandle,
    ProviderRegistry,
};
pub use retry::with_retry;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exports() {
        let _ = ReconcileState::Pending;
        let _ = ChangeKind::Add;
        let _ = VersioningStatus::Enabled;
        let _ = ResponseStatus::Success;
        let _ = FailureKind::PreconditionUnmet.as_str();
    }
}
