//! Amazon S3 backend for bucket-mesh.
//!
//! Implements [`mesh_reconciler::MeshBackend`] with the AWS SDK for Rust.
//! SDK types never leave this crate: documents are converted to the
//! `mesh-core` model and failures are classified into
//! [`mesh_reconciler::BackendError`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod convert;
pub mod error;

pub use backend::{region_from_location, S3Backend};
pub use error::classify;
