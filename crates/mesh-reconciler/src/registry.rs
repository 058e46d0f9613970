// Copyright 2024 The Rucket Authors
// SPDX-License-Identifier: Apache-2.0

//! Reconciler handles shared per deployment scope.
//!
//! Every mesh declared in the same scope is served by the same handle. The
//! handle accumulates the permissions its meshes need; callers merge grants
//! into it explicitly and render the result as an IAM policy document.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use mesh_core::replication::bucket_arn;
use mesh_core::MeshSpec;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::BackendOp;
use crate::event::EventAdapter;

/// IAM policy language version.
pub const POLICY_VERSION: &str = "2012-10-17";

/// Actions the replication identity needs on each bucket.
const IDENTITY_BUCKET_ACTIONS: &[&str] = &["s3:GetReplicationConfiguration", "s3:ListBucket"];

/// Actions the replication identity needs on each bucket's objects.
const IDENTITY_OBJECT_ACTIONS: &[&str] = &[
    "s3:GetObjectVersionForReplication",
    "s3:GetObjectVersionAcl",
    "s3:GetObjectVersionTagging",
    "s3:ReplicateObject",
    "s3:ReplicateDelete",
    "s3:ReplicateTags",
];

/// Needed on destination objects when replicas change owner.
const OWNER_OVERRIDE_ACTION: &str = "s3:ObjectOwnerOverrideToBucketOwner";

/// Where a reconciler is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentScope {
    /// Deployment (stack) name.
    pub stack: String,
    /// Region the reconciler runs in.
    pub region: String,
}

impl DeploymentScope {
    /// Creates a scope.
    pub fn new(stack: impl Into<String>, region: impl Into<String>) -> Self {
        Self { stack: stack.into(), region: region.into() }
    }
}

impl std::fmt::Display for DeploymentScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stack, self.region)
    }
}

/// Allowed actions by resource, deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    grants: BTreeMap<String, BTreeSet<String>>,
}

impl PermissionSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows `action` on `resource`.
    pub fn grant(&mut self, action: impl Into<String>, resource: impl Into<String>) -> &mut Self {
        self.grants.entry(action.into()).or_default().insert(resource.into());
        self
    }

    /// Adds every grant of `other`.
    pub fn merge(&mut self, other: &PermissionSet) {
        for (action, resources) in &other.grants {
            self.grants.entry(action.clone()).or_default().extend(resources.iter().cloned());
        }
    }

    /// Returns true if `action` is allowed on `resource`.
    pub fn allows(&self, action: &str, resource: &str) -> bool {
        self.grants.get(action).is_some_and(|r| r.contains(resource))
    }

    /// Returns true if nothing is granted.
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// Number of distinct actions.
    pub fn action_count(&self) -> usize {
        self.grants.len()
    }

    /// What the reconciler itself must be allowed to do for `spec`.
    pub fn for_reconciler(spec: &MeshSpec) -> Self {
        let mut set = Self::new();
        let ops = [
            BackendOp::GetReplication,
            BackendOp::PutReplication,
            BackendOp::DeleteReplication,
            BackendOp::GetVersioning,
            BackendOp::EnableVersioning,
            BackendOp::LocateBucket,
        ];
        for bucket in spec.bucket_names() {
            let arn = bucket_arn(bucket);
            for op in ops {
                set.grant(op.action(), arn.clone());
            }
        }
        if !spec.replication_identity_arn.is_empty() {
            set.grant("iam:PassRole", spec.replication_identity_arn.clone());
        }
        set
    }

    /// What the replication identity must be allowed to do for `spec`.
    pub fn for_replication_identity(spec: &MeshSpec) -> Self {
        let mut set = Self::new();
        for bucket in spec.bucket_names() {
            let arn = bucket_arn(bucket);
            for action in IDENTITY_BUCKET_ACTIONS {
                set.grant(*action, arn.clone());
            }
            for action in IDENTITY_OBJECT_ACTIONS {
                set.grant(*action, format!("{arn}/*"));
            }
            if spec.options.owner_override {
                set.grant(OWNER_OVERRIDE_ACTION, format!("{arn}/*"));
            }
        }
        set
    }

    /// Renders the set as a policy document.
    ///
    /// Actions sharing the same resources are grouped into one statement.
    pub fn to_policy_document(&self) -> PolicyDocument {
        let mut grouped: BTreeMap<&BTreeSet<String>, Vec<String>> = BTreeMap::new();
        for (action, resources) in &self.grants {
            grouped.entry(resources).or_default().push(action.clone());
        }
        let statement = grouped
            .into_iter()
            .map(|(resources, action)| PolicyStatement {
                effect: Effect::Allow,
                action,
                resource: resources.iter().cloned().collect(),
            })
            .collect();
        PolicyDocument { version: POLICY_VERSION.to_string(), statement }
    }
}

/// Statement effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    /// Allow the actions.
    Allow,
}

/// One policy statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyStatement {
    /// Statement effect.
    pub effect: Effect,
    /// Actions covered.
    pub action: Vec<String>,
    /// Resources covered.
    pub resource: Vec<String>,
}

/// An IAM policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    /// Policy language version.
    pub version: String,
    /// Statements.
    pub statement: Vec<PolicyStatement>,
}

/// The reconciler of one deployment scope and the permissions it has been
/// granted so far.
pub struct ProviderHandle {
    scope: DeploymentScope,
    adapter: EventAdapter,
    permissions: Mutex<PermissionSet>,
}

impl ProviderHandle {
    /// Creates a handle with no permissions.
    pub fn new(scope: DeploymentScope, adapter: EventAdapter) -> Self {
        Self { scope, adapter, permissions: Mutex::new(PermissionSet::new()) }
    }

    /// The scope this handle serves.
    pub fn scope(&self) -> &DeploymentScope {
        &self.scope
    }

    /// The event adapter.
    pub fn adapter(&self) -> &EventAdapter {
        &self.adapter
    }

    /// Merges `grants` into the accumulated permissions.
    pub fn grant(&self, grants: &PermissionSet) {
        self.permissions.lock().merge(grants);
        debug!(scope = %self.scope, actions = grants.action_count(), "Merged provider grants");
    }

    /// Snapshot of the accumulated permissions.
    pub fn permissions(&self) -> PermissionSet {
        self.permissions.lock().clone()
    }

    /// Accumulated permissions as a policy document.
    pub fn policy_document(&self) -> PolicyDocument {
        self.permissions.lock().to_policy_document()
    }
}

/// Provider handles by deployment scope.
#[derive(Default)]
pub struct ProviderRegistry {
    handles: DashMap<DeploymentScope, Arc<ProviderHandle>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for `scope`, creating it with `factory` on first
    /// use. Concurrent callers for the same scope get the same handle.
    pub fn get_or_register<F>(&self, scope: &DeploymentScope, factory: F) -> Arc<ProviderHandle>
    where
        F: FnOnce() -> EventAdapter,
    {
        let handle = self.handles.entry(scope.clone()).or_insert_with(|| {
            debug!(scope = %scope, "Registered provider");
            Arc::new(ProviderHandle::new(scope.clone(), factory()))
        });
        Arc::clone(handle.value())
    }

    /// Returns the handle for `scope`, if registered.
    pub fn get(&self, scope: &DeploymentScope) -> Option<Arc<ProviderHandle>> {
        self.handles.get(scope).map(|h| Arc::clone(h.value()))
    }

    /// Unregisters `scope`.
    pub fn remove(&self, scope: &DeploymentScope) -> Option<Arc<ProviderHandle>> {
        self.handles.remove(scope).map(|(_, h)| h)
    }

    /// Number of registered scopes.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if no scope is registered.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use mesh_core::BucketRef;

    use super::*;
    use crate::memory::MemoryBackend;
    use crate::reconciler::MeshReconciler;

    const ROLE: &str = "arn:aws:iam::111:role/repl";

    fn spec(names: &[&str]) -> MeshSpec {
        MeshSpec::new(names.iter().map(|n| BucketRef::new(*n, "us-east-1")).collect(), ROLE)
    }

    fn adapter() -> EventAdapter {
        EventAdapter::new(Arc::new(MeshReconciler::new(Arc::new(MemoryBackend::new()))))
    }

    #[test]
    fn test_same_scope_same_handle() {
        let registry = ProviderRegistry::new();
        let scope = DeploymentScope::new("stack-a", "us-east-1");

        let first = registry.get_or_register(&scope, adapter);
        let mut created = false;
        let second = registry.get_or_register(&scope, || {
            created = true;
            adapter()
        });

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!created);
        assert_eq!(registry.len(), 1);

        let other = registry.get_or_register(&DeploymentScope::new("stack-a", "eu-west-1"), adapter);
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_grants_accumulate_across_meshes() {
        let registry = ProviderRegistry::new();
        let handle = registry.get_or_register(&DeploymentScope::new("s", "us-east-1"), adapter);

        handle.grant(&PermissionSet::for_reconciler(&spec(&["x-1", "x-2"])));
        handle.grant(&PermissionSet::for_reconciler(&spec(&["y-1", "y-2"])));

        let permissions = handle.permissions();
        assert!(permissions.allows("s3:PutReplicationConfiguration", "arn:aws:s3:::x-1"));
        assert!(permissions.allows("s3:DeleteBucketReplication", "arn:aws:s3:::y-2"));
        assert!(permissions.allows("iam:PassRole", ROLE));
        assert!(!permissions.allows("s3:ReplicateObject", "arn:aws:s3:::x-1/*"));
    }

    #[test]
    fn test_identity_permissions() {
        let set = PermissionSet::for_replication_identity(&spec(&["x-1"]));
        assert!(set.allows("s3:ListBucket", "arn:aws:s3:::x-1"));
        assert!(set.allows("s3:ReplicateObject", "arn:aws:s3:::x-1/*"));
        assert!(!set.allows("iam:PassRole", ROLE));
        assert!(!set.allows(OWNER_OVERRIDE_ACTION, "arn:aws:s3:::x-1/*"));

        let options = mesh_core::RuleOptions { owner_override: true, ..Default::default() };
        let set = PermissionSet::for_replication_identity(&spec(&["x-1"]).with_options(options));
        assert!(set.allows(OWNER_OVERRIDE_ACTION, "arn:aws:s3:::x-1/*"));
    }

    #[test]
    fn test_policy_document_groups_by_resource() {
        let doc = PermissionSet::for_reconciler(&spec(&["x-1", "x-2"])).to_policy_document();
        assert_eq!(doc.version, POLICY_VERSION);
        assert_eq!(doc.statement.len(), 2);

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["Version"], "2012-10-17");
        let statements = json["Statement"].as_array().unwrap();
        assert!(statements.iter().all(|s| s["Effect"] == "Allow"));
        let pass_role = statements
            .iter()
            .find(|s| s["Action"].as_array().unwrap().contains(&serde_json::json!("iam:PassRole")))
            .unwrap();
        assert_eq!(pass_role["Resource"], serde_json::json!([ROLE]));
    }

    #[test]
    fn test_remove_scope() {
        let registry = ProviderRegistry::new();
        let scope = DeploymentScope::new("s", "us-east-1");
        registry.get_or_register(&scope, adapter);
        assert!(registry.remove(&scope).is_some());
        assert!(registry.get(&scope).is_none());
        assert!(registry.is_empty());
    }
}
