// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! In-memory backend.
//!
//! Holds buckets, versioning state and replication documents in process and
//! enforces the same rules the real service does: documents are validated,
//! and replication requires versioning on the bucket and on every destination
//! this backend holds. Faults can be injected per bucket and
//! operation, which makes it the backend of choice for tests and dry runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mesh_core::{BucketRef, ConfigRule, ReplicationConfiguration, RuleStatus};
use parking_lot::Mutex;

use crate::backend::{BackendOp, MeshBackend, VersioningStatus};
use crate::error::BackendError;

#[derive(Debug, Clone)]
struct BucketState {
    region: String,
    versioning: VersioningStatus,
    replication: Option<ReplicationConfiguration>,
}

#[derive(Debug, Clone)]
struct Fault {
    bucket: String,
    op: BackendOp,
    error: BackendError,
    /// Remaining failures; `None` fails forever.
    remaining: Option<u32>,
}

/// A backend that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    buckets: DashMap<String, BucketState>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<HashMap<BackendOp, u64>>,
    writes: Mutex<Vec<(String, BackendOp)>>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a versioned bucket.
    pub fn with_bucket(self, name: &str, region: &str) -> Self {
        self.add_bucket(name, region, VersioningStatus::Enabled);
        self
    }

    /// Adds (or resets) a bucket with the given versioning state.
    pub fn add_bucket(&self, name: &str, region: &str, versioning: VersioningStatus) {
        self.buckets.insert(
            name.to_string(),
            BucketState { region: region.to_string(), versioning, replication: None },
        );
    }

    /// Deletes a bucket.
    pub fn remove_bucket(&self, name: &str) {
        self.buckets.remove(name);
    }

    /// Overwrites a bucket's replication document without going through the
    /// backend API. Unknown buckets are ignored.
    pub fn set_replication(&self, name: &str, config: Option<ReplicationConfiguration>) {
        if let Some(mut state) = self.buckets.get_mut(name) {
            state.replication = config;
        }
    }

    /// Returns a bucket's replication document.
    pub fn replication(&self, name: &str) -> Option<ReplicationConfiguration> {
        self.buckets.get(name).and_then(|state| state.replication.clone())
    }

    /// Returns a bucket's versioning state.
    pub fn versioning(&self, name: &str) -> Option<VersioningStatus> {
        self.buckets.get(name).map(|state| state.versioning)
    }

    /// Makes `op` on `bucket` fail with `error`, `times` times or forever.
    pub fn fail(&self, bucket: &str, op: BackendOp, error: BackendError, times: Option<u32>) {
        self.faults.lock().push(Fault { bucket: bucket.to_string(), op, error, remaining: times });
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of calls made for `op`, including failed ones.
    pub fn calls(&self, op: BackendOp) -> u64 {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Successful writes in order, as `(bucket, op)`.
    pub fn writes(&self) -> Vec<(String, BackendOp)> {
        self.writes.lock().clone()
    }

    /// Forgets recorded calls and writes.
    pub fn reset_counters(&self) {
        self.calls.lock().clear();
        self.writes.lock().clear();
    }

    async fn enter(&self, bucket: &str, op: BackendOp) -> Result<(), BackendError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.faults.lock();
        if let Some(index) = faults.iter().position(|f| f.bucket == bucket && f.op == op) {
            let fault = &mut faults[index];
            let error = fault.error.clone();
            let exhausted = match fault.remaining.as_mut() {
                Some(n) => {
                    *n = n.saturating_sub(1);
                    *n == 0
                }
                None => false,
            };
            if exhausted {
                faults.remove(index);
            }
            return Err(error);
        }
        Ok(())
    }

    fn record_write(&self, bucket: &str, op: BackendOp) {
        self.writes.lock().push((bucket.to_string(), op));
    }

    fn missing(bucket: &str, op: BackendOp) -> BackendError {
        BackendError::not_found(op.action(), bucket)
    }
}

#[async_trait]
impl MeshBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_replication(
        &self,
        bucket: &BucketRef,
    ) -> Result<Option<ReplicationConfiguration>, BackendError> {
        let op = BackendOp::GetReplication;
        self.enter(&bucket.name, op).await?;
        self.buckets
            .get(&bucket.name)
            .map(|state| state.replication.clone())
            .ok_or_else(|| Self::missing(&bucket.name, op))
    }

    async fn put_replication(
        &self,
        bucket: &BucketRef,
        config: &ReplicationConfiguration,
    ) -> Result<(), BackendError> {
        let op = BackendOp::PutReplication;
        self.enter(&bucket.name, op).await?;

        let versioning = self.versioning(&bucket.name).ok_or_else(|| Self::missing(&bucket.name, op))?;
        if !versioning.is_enabled() {
            return Err(BackendError::invalid_request(
                op.action(),
                &bucket.name,
                "Versioning must be 'Enabled' on the bucket to apply a replication configuration",
            ));
        }
        // Destinations held elsewhere are not checked.
        let unversioned = config
            .rules
            .iter()
            .filter(|rule| rule.status == RuleStatus::Enabled)
            .map(ConfigRule::destination_bucket)
            .find(|dest| self.versioning(dest).is_some_and(|v| !v.is_enabled()));
        if let Some(dest) = unversioned {
            return Err(BackendError::invalid_request(
                op.action(),
                &bucket.name,
                format!("Destination bucket must have versioning enabled: {dest}"),
            ));
        }
        config
            .validate()
            .map_err(|e| BackendError::invalid_request(op.action(), &bucket.name, e.to_string()))?;

        {
            let mut state =
                self.buckets.get_mut(&bucket.name).ok_or_else(|| Self::missing(&bucket.name, op))?;
            state.replication = Some(config.clone());
        }
        self.record_write(&bucket.name, op);
        Ok(())
    }

    async fn delete_replication(&self, bucket: &BucketRef) -> Result<(), BackendError> {
        let op = BackendOp::DeleteReplication;
        self.enter(&bucket.name, op).await?;
        {
            let mut state =
                self.buckets.get_mut(&bucket.name).ok_or_else(|| Self::missing(&bucket.name, op))?;
            state.replication = None;
        }
        self.record_write(&bucket.name, op);
        Ok(())
    }

    async fn get_versioning(&self, bucket: &BucketRef) -> Result<VersioningStatus, BackendError> {
        let op = BackendOp::GetVersioning;
        self.enter(&bucket.name, op).await?;
        self.versioning(&bucket.name).ok_or_else(|| Self::missing(&bucket.name, op))
    }

    async fn enable_versioning(&self, bucket: &BucketRef) -> Result<(), BackendError> {
        let op = BackendOp::EnableVersioning;
        self.enter(&bucket.name, op).await?;
        {
            let mut state =
                self.buckets.get_mut(&bucket.name).ok_or_else(|| Self::missing(&bucket.name, op))?;
            state.versioning = VersioningStatus::Enabled;
        }
        self.record_write(&bucket.name, op);
        Ok(())
    }

    async fn locate_bucket(&self, name: &str) -> Result<Option<String>, BackendError> {
        self.enter(name, BackendOp::LocateBucket).await?;
        Ok(self.buckets.get(name).map(|state| state.region.clone()))
    }
}

#[cfg(test)]
mod tests {
    use mesh_core::replication::ReplicationDestination;

    use super::*;

    fn bucket(name: &str) -> BucketRef {
        BucketRef::new(name, "us-east-1")
    }

    fn config(dest: &str) -> ReplicationConfiguration {
        ReplicationConfiguration::new(
            "arn:aws:iam::111:role/repl",
            vec![ConfigRule {
                id: Some("manual".to_string()),
                status: RuleStatus::Enabled,
                priority: Some(0),
                prefix: None,
                filter: None,
                destination: ReplicationDestination::bucket(dest),
                delete_marker_replication: None,
                source_selection_criteria: None,
                existing_object_replication: None,
            }],
        )
    }

    #[tokio::test]
    async fn test_missing_bucket_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend.get_replication(&bucket("nope")).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.action, "s3:GetReplicationConfiguration");
    }

    #[tokio::test]
    async fn test_put_and_get_replication() {
        let backend = MemoryBackend::new().with_bucket("x-1", "us-east-1");
        assert_eq!(backend.get_replication(&bucket("x-1")).await.unwrap(), None);

        backend.put_replication(&bucket("x-1"), &config("x-2")).await.unwrap();
        assert_eq!(backend.get_replication(&bucket("x-1")).await.unwrap(), Some(config("x-2")));
        assert_eq!(backend.writes(), vec![("x-1".to_string(), BackendOp::PutReplication)]);

        backend.delete_replication(&bucket("x-1")).await.unwrap();
        assert_eq!(backend.replication("x-1"), None);
    }

    #[tokio::test]
    async fn test_put_requires_versioning() {
        let backend = MemoryBackend::new();
        backend.add_bucket("x-1", "us-east-1", VersioningStatus::Suspended);

        let err = backend.put_replication(&bucket("x-1"), &config("x-2")).await.unwrap_err();
        assert_eq!(err.kind, crate::error::BackendErrorKind::InvalidRequest);

        backend.enable_versioning(&bucket("x-1")).await.unwrap();
        assert_eq!(backend.versioning("x-1"), Some(VersioningStatus::Enabled));
        assert!(backend.put_replication(&bucket("x-1"), &config("x-2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_put_rejects_unversioned_destination() {
        let backend = MemoryBackend::new().with_bucket("a-1", "us-east-1");
        backend.add_bucket("b-2", "us-east-1", VersioningStatus::Unversioned);

        let err = backend.put_replication(&bucket("a-1"), &config("b-2")).await.unwrap_err();
        assert_eq!(err.kind, crate::error::BackendErrorKind::InvalidRequest);
        assert!(err.to_string().contains("b-2"));
        assert_eq!(backend.replication("a-1"), None);

        let mut disabled = config("b-2");
        disabled.rules[0].status = RuleStatus::Disabled;
        assert!(backend.put_replication(&bucket("a-1"), &disabled).await.is_ok());

        backend.enable_versioning(&bucket("b-2")).await.unwrap();
        assert!(backend.put_replication(&bucket("a-1"), &config("b-2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_document() {
        let backend = MemoryBackend::new().with_bucket("x-1", "us-east-1");
        let empty = ReplicationConfiguration::new("arn:aws:iam::111:role/repl", vec![]);
        assert!(backend.put_replication(&bucket("x-1"), &empty).await.is_err());
        assert!(backend.writes().is_empty());
    }

    #[tokio::test]
    async fn test_fault_injection_counts_down() {
        let backend = MemoryBackend::new().with_bucket("x-1", "us-east-1");
        backend.fail(
            "x-1",
            BackendOp::GetVersioning,
            BackendError::transient("s3:GetBucketVersioning", "x-1", "SlowDown"),
            Some(2),
        );

        assert!(backend.get_versioning(&bucket("x-1")).await.is_err());
        assert!(backend.get_versioning(&bucket("x-1")).await.is_err());
        assert_eq!(backend.get_versioning(&bucket("x-1")).await.unwrap(), VersioningStatus::Enabled);
        assert_eq!(backend.calls(BackendOp::GetVersioning), 3);
    }

    #[tokio::test]
    async fn test_locate_bucket() {
        let backend = MemoryBackend::new().with_bucket("x-1", "eu-west-1");
        assert_eq!(backend.locate_bucket("x-1").await.unwrap(), Some("eu-west-1".to_string()));
        assert_eq!(backend.locate_bucket("x-9").await.unwrap(), None);
    }
}
