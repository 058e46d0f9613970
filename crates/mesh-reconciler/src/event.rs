//! Lifecycle event protocol.
//!
//! Requests arrive as JSON objects tagged by `requestType`:
//!
//! ```json
//! {
//!   "requestType": "Update",
//!   "requestId": "5d1c...",
//!   "physicalId": "bucket-mesh-9f86...",
//!   "buckets": [{ "name": "x-1", "region": "us-east-1" }],
//!   "replicationIdentityArn": "arn:aws:iam::111:role/repl",
//!   "previous": { "buckets": [], "replicationIdentityArn": "..." }
//! }
//! ```
//!
//! Every request yields a response, including requests that cannot be
//! decoded; the caller never has to interpret a transport error.

use std::sync::Arc;

use mesh_core::{BucketRef, MeshSpec, RuleOptions};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::MeshError;
use crate::reconciler::{
    BucketReport, MeshReconciler, ReconcileMode, ReconcileOutcome, ReconcileRequest,
    ReconcileState,
};

/// Mesh declaration as carried by an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshProperties {
    /// Participating buckets.
    pub buckets: Vec<BucketRef>,
    /// IAM role the backend assumes to replicate.
    pub replication_identity_arn: String,
    /// Replicate delete markers (default true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicate_delete_markers: Option<bool>,
    /// Backfill objects that predate the mesh (default false).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicate_existing_objects: Option<bool>,
    /// Destination accounts own the replicas (default false).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_override: Option<bool>,
}

impl MeshProperties {
    /// Builds the mesh spec, filling in option defaults.
    pub fn to_spec(&self) -> MeshSpec {
        let defaults = RuleOptions::default();
        let options = RuleOptions {
            replicate_delete_markers: self
                .replicate_delete_markers
                .unwrap_or(defaults.replicate_delete_markers),
            replicate_existing_objects: self
                .replicate_existing_objects
                .unwrap_or(defaults.replicate_existing_objects),
            owner_override: self.owner_override.unwrap_or(defaults.owner_override),
        };
        MeshSpec::new(self.buckets.clone(), self.replication_identity_arn.clone()).with_options(options)
    }
}

/// Correlation fields echoed back in the response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestContext {
    /// Caller-assigned request id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Deployment the resource belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_id: Option<String>,
    /// Name of the resource within the deployment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_resource_id: Option<String>,
}

/// Create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Correlation fields.
    #[serde(flatten)]
    pub context: RequestContext,
    /// The new mesh.
    #[serde(flatten)]
    pub properties: MeshProperties,
}

/// Update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    /// Correlation fields.
    #[serde(flatten)]
    pub context: RequestContext,
    /// The new declaration.
    #[serde(flatten)]
    pub properties: MeshProperties,
    /// The previous declaration, when the caller kept it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<MeshProperties>,
    /// Physical id reported for the previous declaration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
}

/// Delete request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    /// Correlation fields.
    #[serde(flatten)]
    pub context: RequestContext,
    /// The last known declaration.
    #[serde(flatten)]
    pub properties: MeshProperties,
    /// Physical id of the resource being deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "requestType")]
pub enum LifecycleEvent {
    /// The mesh is new.
    Create(CreateRequest),
    /// The mesh declaration changed.
    Update(UpdateRequest),
    /// The mesh is going away.
    Delete(DeleteRequest),
}

impl LifecycleEvent {
    /// Decodes an event from JSON.
    pub fn from_json(payload: &str) -> Result<Self, MeshError> {
        serde_json::from_str(payload).map_err(|e| MeshError::Event(e.to_string()))
    }

    /// Lifecycle event kind.
    pub fn mode(&self) -> ReconcileMode {
        match self {
            Self::Create(_) => ReconcileMode::Create,
            Self::Update(_) => ReconcileMode::Update,
            Self::Delete(_) => ReconcileMode::Delete,
        }
    }

    /// Correlation fields.
    pub fn context(&self) -> &RequestContext {
        match self {
            Self::Create(r) => &r.context,
            Self::Update(r) => &r.context,
            Self::Delete(r) => &r.context,
        }
    }

    /// The declaration the event carries.
    pub fn properties(&self) -> &MeshProperties {
        match self {
            Self::Create(r) => &r.properties,
            Self::Update(r) => &r.properties,
            Self::Delete(r) => &r.properties,
        }
    }

    /// Converts the event into a reconciliation request.
    pub fn into_request(self) -> ReconcileRequest {
        match self {
            Self::Create(r) => ReconcileRequest::Create { spec: r.properties.to_spec() },
            Self::Update(r) => ReconcileRequest::Update {
                spec: r.properties.to_spec(),
                previous: r.previous.as_ref().map(MeshProperties::to_spec),
                previous_physical_id: r.physical_id,
            },
            Self::Delete(r) => ReconcileRequest::Delete { spec: r.properties.to_spec() },
        }
    }
}

/// Protocol status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    /// The resource converged.
    Success,
    /// The resource did not converge.
    Failed,
}

/// Run details attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseData {
    /// Reconciliation run id.
    pub run_id: Uuid,
    /// Terminal state of the run.
    pub state: ReconcileState,
    /// True when the physical id changed.
    pub replaced: bool,
    /// Physical id of the previous declaration, on update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_physical_id: Option<String>,
    /// Per-bucket reports.
    pub buckets: Vec<BucketReport>,
}

/// Response to a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Durable identity of the mesh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    /// Why the request failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Correlation fields from the request.
    #[serde(flatten)]
    pub context: RequestContext,
    /// Run details, absent when the request could not be decoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl LifecycleResponse {
    /// Response for a request that never reached the reconciler.
    pub fn rejected(err: &MeshError) -> Self {
        Self {
            status: ResponseStatus::Failed,
            physical_id: None,
            failure_reason: Some(err.to_string()),
            context: RequestContext::default(),
            data: None,
        }
    }

    fn from_outcome(
        outcome: ReconcileOutcome,
        context: RequestContext,
        physical_id: Option<String>,
    ) -> Self {
        let error = outcome.error();
        Self {
            status: if error.is_none() { ResponseStatus::Success } else { ResponseStatus::Failed },
            physical_id,
            failure_reason: error.map(|e| e.to_string()),
            context,
            data: Some(ResponseData {
                run_id: outcome.run_id,
                state: outcome.state,
                replaced: outcome.replaced,
                previous_physical_id: outcome.previous_physical_id,
                buckets: outcome.buckets,
            }),
        }
    }

    /// Returns true on `SUCCESS`.
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Serves lifecycle events with a shared reconciler.
#[derive(Clone)]
pub struct EventAdapter {
    reconciler: Arc<MeshReconciler>,
}

impl EventAdapter {
    /// Creates an adapter.
    pub fn new(reconciler: Arc<MeshReconciler>) -> Self {
        Self { reconciler }
    }

    /// Returns the reconciler.
    pub fn reconciler(&self) -> &Arc<MeshReconciler> {
        &self.reconciler
    }

    /// Decodes and handles a JSON event.
    pub async fn handle_json(&self, payload: &str, cancel: &CancellationToken) -> LifecycleResponse {
        match LifecycleEvent::from_json(payload) {
            Ok(event) => self.handle(event, cancel).await,
            Err(e) => {
                error!(error = %e, "Rejected lifecycle event");
                LifecycleResponse::rejected(&e)
            }
        }
    }

    /// Handles an event.
    ///
    /// The physical id of a delete echoes the one the caller sent, since it
    /// names the resource being removed. Create and update report the id of
    /// the declared mesh; a failed create without a valid declaration falls
    /// back to the caller's id, if any.
    pub async fn handle(&self, event: LifecycleEvent, cancel: &CancellationToken) -> LifecycleResponse {
        let context = event.context().clone();
        let requested_id = match &event {
            LifecycleEvent::Create(_) => None,
            LifecycleEvent::Update(r) => r.physical_id.clone(),
            LifecycleEvent::Delete(r) => r.physical_id.clone(),
        };
        let mode = event.mode();
        info!(
            mode = %mode,
            request_id = context.request_id.as_deref().unwrap_or("-"),
            buckets = event.properties().buckets.len(),
            "Handling lifecycle event"
        );

        let outcome = self.reconciler.reconcile_with_cancel(event.into_request(), cancel).await;
        let physical_id = match mode {
            ReconcileMode::Delete => requested_id.or_else(|| outcome.physical_id.clone()),
            ReconcileMode::Create | ReconcileMode::Update => {
                outcome.physical_id.clone().or(requested_id)
            }
        };
        LifecycleResponse::from_outcome(outcome, context, physical_id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::backend::VersioningStatus;
    use crate::memory::MemoryBackend;

    const ROLE: &str = "arn:aws:iam::111:role/repl";

    fn adapter(names: &[&str]) -> (EventAdapter, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        for name in names {
            backend.add_bucket(name, "us-east-1", VersioningStatus::Enabled);
        }
        (EventAdapter::new(Arc::new(MeshReconciler::new(backend.clone()))), backend)
    }

    fn buckets(names: &[&str]) -> serde_json::Value {
        names.iter().map(|n| json!({ "name": n, "region": "us-east-1" })).collect()
    }

    #[test]
    fn test_decode_update() {
        let event = LifecycleEvent::from_json(
            &json!({
                "requestType": "Update",
                "requestId": "r-1",
                "physicalId": "bucket-mesh-old",
                "buckets": buckets(&["x-1", "x-2"]),
                "replicationIdentityArn": ROLE,
                "replicateExistingObjects": true,
                "ownerOverride": true,
                "previous": { "buckets": buckets(&["x-1"]), "replicationIdentityArn": ROLE }
            })
            .to_string(),
        )
        .unwrap();

        assert_eq!(event.mode(), ReconcileMode::Update);
        assert_eq!(event.context().request_id.as_deref(), Some("r-1"));
        match event.into_request() {
            ReconcileRequest::Update { spec, previous, previous_physical_id } => {
                assert_eq!(spec.len(), 2);
                assert!(spec.options.replicate_existing_objects);
                assert!(spec.options.replicate_delete_markers);
                assert!(spec.options.owner_override);
                assert_eq!(previous.map(|p| p.len()), Some(1));
                assert_eq!(previous_physical_id.as_deref(), Some("bucket-mesh-old"));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_unknown_request_type() {
        let err = LifecycleEvent::from_json(r#"{"requestType":"Restore","buckets":[]}"#).unwrap_err();
        assert!(matches!(err, MeshError::Event(_)));
    }

    #[tokio::test]
    async fn test_create_response() {
        let (adapter, backend) = adapter(&["x-1", "x-2"]);
        let payload = json!({
            "requestType": "Create",
            "requestId": "r-1",
            "buckets": buckets(&["x-2", "x-1"]),
            "replicationIdentityArn": ROLE
        });

        let response = adapter.handle_json(&payload.to_string(), &CancellationToken::new()).await;
        assert!(response.is_success());
        assert_eq!(response.physical_id, Some(mesh_core::physical_id(["x-1", "x-2"])));
        assert!(backend.replication("x-2").is_some());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "SUCCESS");
        assert_eq!(json["requestId"], "r-1");
        assert_eq!(json["data"]["state"], "Succeeded");
        assert!(json.get("failureReason").is_none());
    }

    #[tokio::test]
    async fn test_invalid_spec_is_failed() {
        let (adapter, backend) = adapter(&["x-1"]);
        let payload = json!({
            "requestType": "Create",
            "buckets": buckets(&["x-1", "x-1"]),
            "replicationIdentityArn": ROLE
        });

        let response = adapter.handle_json(&payload.to_string(), &CancellationToken::new()).await;
        assert_eq!(response.status, ResponseStatus::Failed);
        assert!(response.failure_reason.unwrap().starts_with("InvalidSpec"));
        assert!(backend.writes().is_empty());
    }

    #[tokio::test]
    async fn test_delete_echoes_physical_id() {
        let (adapter, _backend) = adapter(&[]);
        let payload = json!({
            "requestType": "Delete",
            "physicalId": "bucket-mesh-abc",
            "buckets": buckets(&["gone-1", "gone-2"]),
            "replicationIdentityArn": ROLE
        });

        let response = adapter.handle_json(&payload.to_string(), &CancellationToken::new()).await;
        assert!(response.is_success());
        assert_eq!(response.physical_id.as_deref(), Some("bucket-mesh-abc"));
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let (adapter, _backend) = adapter(&[]);
        let response = adapter.handle_json("{not json", &CancellationToken::new()).await;
        assert_eq!(response.status, ResponseStatus::Failed);
        assert!(response.data.is_none());
        assert!(response.failure_reason.unwrap().starts_with("malformed lifecycle event"));
    }

    #[tokio::test]
    async fn test_partial_failure_names_bucket() {
        let (adapter, _backend) = adapter(&["x-1"]);
        let payload = json!({
            "requestType": "Create",
            "buckets": buckets(&["x-1", "x-2"]),
            "replicationIdentityArn": ROLE
        });

        let response = adapter.handle_json(&payload.to_string(), &CancellationToken::new()).await;
        assert_eq!(response.status, ResponseStatus::Failed);
        let reason = response.failure_reason.unwrap();
        assert!(reason.starts_with("PartialMeshFailure"));
        assert!(reason.contains("x-2"));
        assert!(response.physical_id.is_some());
    }
}
