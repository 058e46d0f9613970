// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Bucket replication configuration documents.
//!
//! A backend stores exactly one [`ReplicationConfiguration`] per bucket and
//! replaces it atomically on every write. The document may mix rules owned by
//! a mesh with rules configured by hand, so this model carries every field the
//! backend understands and round-trips foreign rules untouched.
//!
//! # Example XML
//!
//! ```xml
//! <ReplicationConfiguration>
//!     <Role>arn:aws:iam::123456789:role/replication</Role>
//!     <Rule>
//!         <ID>mesh-5d1e0c0b9a8f7e6d5c4b3a2918070605</ID>
//!         <Status>Enabled</Status>
//!         <Priority>0</Priority>
//!         <Filter>
//!             <Prefix></Prefix>
//!         </Filter>
//!         <Destination>
//!             <Bucket>arn:aws:s3:::dest-bucket</Bucket>
//!         </Destination>
//!         <DeleteMarkerReplication>
//!             <Status>Enabled</Status>
//!         </DeleteMarkerReplication>
//!     </Rule>
//! </ReplicationConfiguration>
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::hash::is_mesh_rule_id;

/// ARN prefix of S3 buckets.
pub const BUCKET_ARN_PREFIX: &str = "arn:aws:s3:::";

/// Returns the ARN of a bucket.
#[must_use]
pub fn bucket_arn(name: &str) -> String {
    format!("{BUCKET_ARN_PREFIX}{name}")
}

/// Extracts the bucket name from a destination reference.
///
/// Destinations are normally ARNs, but plain names are accepted as-is.
#[must_use]
pub fn bucket_from_arn(destination: &str) -> &str {
    destination.strip_prefix(BUCKET_ARN_PREFIX).unwrap_or(destination)
}

/// Replication configuration document of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfiguration {
    /// IAM role ARN the backend assumes to replicate.
    pub role: String,
    /// List of replication rules.
    pub rules: Vec<ConfigRule>,
}

impl ReplicationConfiguration {
    /// Creates a document from a role and rules.
    pub fn new(role: impl Into<String>, rules: Vec<ConfigRule>) -> Self {
        Self { role: role.into(), rules }
    }

    /// Checks that the backend would accept this document.
    ///
    /// A writable document has a role, at least one rule, and no two rules
    /// sharing an id or a priority.
    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.role.trim().is_empty() {
            return Err(DocumentError::MissingRole);
        }
        if self.rules.is_empty() {
            return Err(DocumentError::Empty);
        }

        let mut ids = HashSet::with_capacity(self.rules.len());
        let mut priorities: HashMap<u32, &str> = HashMap::with_capacity(self.rules.len());
        for rule in &self.rules {
            let label = rule.id.as_deref().unwrap_or("<unnamed>");
            if rule.destination.bucket.is_empty() {
                return Err(DocumentError::MissingDestination(label.to_string()));
            }
            if rule.id.is_some() && !ids.insert(label) {
                return Err(DocumentError::DuplicateId(label.to_string()));
            }
            if let Some(priority) = rule.priority {
                if let Some(first) = priorities.insert(priority, label) {
                    return Err(DocumentError::PriorityCollision {
                        priority,
                        first: first.to_string(),
                        second: label.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Rules whose id falls in the mesh-owned namespace.
    pub fn mesh_rules(&self) -> impl Iterator<Item = &ConfigRule> {
        self.rules.iter().filter(|r| r.is_mesh_owned())
    }

    /// Rules the mesh does not own.
    pub fn foreign_rules(&self) -> impl Iterator<Item = &ConfigRule> {
        self.rules.iter().filter(|r| !r.is_mesh_owned())
    }
}

/// A single rule of a replication document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRule {
    /// Unique identifier for the rule (optional).
    #[serde(default)]
    pub id: Option<String>,

    /// Status of the rule (Enabled or Disabled).
    pub status: RuleStatus,

    /// Priority of the rule.
    #[serde(default)]
    pub priority: Option<u32>,

    /// Legacy top-level key prefix (schema V1 rules).
    #[serde(default)]
    pub prefix: Option<String>,

    /// Filter to select objects this rule applies to.
    #[serde(default)]
    pub filter: Option<ReplicationFilter>,

    /// Destination bucket for replicated objects.
    pub destination: ReplicationDestination,

    /// Whether to replicate delete markers.
    #[serde(default)]
    pub delete_marker_replication: Option<DeleteMarkerReplication>,

    /// Criteria for selecting source objects.
    #[serde(default)]
    pub source_selection_criteria: Option<SourceSelectionCriteria>,

    /// Whether to replicate existing objects.
    #[serde(default)]
    pub existing_object_replication: Option<ExistingObjectReplication>,
}

impl ConfigRule {
    /// Returns true if a mesh owns this rule.
    #[must_use]
    pub fn is_mesh_owned(&self) -> bool {
        self.id.as_deref().is_some_and(is_mesh_rule_id)
    }

    /// Name of the destination bucket.
    #[must_use]
    pub fn destination_bucket(&self) -> &str {
        bucket_from_arn(&self.destination.bucket)
    }
}

/// Status of a replication rule or rule feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleStatus {
    /// Active.
    #[default]
    Enabled,
    /// Inactive.
    Disabled,
}

impl RuleStatus {
    /// Parse from string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Enabled" => Some(Self::Enabled),
            "Disabled" => Some(Self::Disabled),
            _ => None,
        }
    }

    /// Convert to string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "Enabled",
            Self::Disabled => "Disabled",
        }
    }

    /// Maps a flag onto a status.
    #[must_use]
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

/// Filter to select objects for replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationFilter {
    /// Key name prefix that selects objects.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Tag that selects objects.
    #[serde(default)]
    pub tag: Option<ReplicationTag>,

    /// Logical AND of multiple filter conditions.
    #[serde(default)]
    pub and: Option<ReplicationFilterAnd>,
}

impl ReplicationFilter {
    /// A filter selecting every object in the bucket.
    #[must_use]
    pub fn whole_bucket() -> Self {
        Self { prefix: Some(String::new()), tag: None, and: None }
    }
}

/// Logical AND filter for replication rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationFilterAnd {
    /// Key name prefix.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Tags to match.
    #[serde(default)]
    pub tags: Vec<ReplicationTag>,
}

/// A tag used in replication filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// Destination for replicated objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationDestination {
    /// Destination bucket ARN.
    pub bucket: String,

    /// Optional account ID for cross-account replication.
    #[serde(default)]
    pub account: Option<String>,

    /// Storage class for replicated objects.
    #[serde(default)]
    pub storage_class: Option<String>,

    /// Access control translation for cross-account replication.
    #[serde(default)]
    pub access_control_translation: Option<AccessControlTranslation>,

    /// Encryption configuration for replicated objects.
    #[serde(default)]
    pub encryption_configuration: Option<EncryptionConfiguration>,

    /// Replication time control settings.
    #[serde(default)]
    pub replication_time: Option<ReplicationTime>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: Option<ReplicationMetrics>,
}

impl ReplicationDestination {
    /// A destination pointing at a bucket with every optional feature unset.
    #[must_use]
    pub fn bucket(name: &str) -> Self {
        Self { bucket: bucket_arn(name), ..Self::default() }
    }
}

/// Access control translation for cross-account replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlTranslation {
    /// Owner override (Destination).
    pub owner: String,
}

impl AccessControlTranslation {
    /// The only owner value the backend accepts.
    pub const DESTINATION: &'static str = "Destination";

    /// Replicas are owned by the destination bucket's account.
    #[must_use]
    pub fn destination() -> Self {
        Self { owner: Self::DESTINATION.to_string() }
    }

    /// Returns true for an owner override to the destination.
    pub fn is_destination(&self) -> bool {
        self.owner == Self::DESTINATION
    }
}

/// Encryption configuration for destination objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfiguration {
    /// KMS key ID for destination encryption.
    #[serde(default)]
    pub replica_kms_key_id: Option<String>,
}

/// Replication time control settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTime {
    /// Status of replication time control.
    pub status: RuleStatus,
    /// Time threshold.
    #[serde(default)]
    pub time: Option<ReplicationTimeValue>,
}

/// Time value for replication time control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTimeValue {
    /// Minutes threshold.
    pub minutes: u32,
}

/// Metrics configuration for replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMetrics {
    /// Status of metrics.
    pub status: RuleStatus,
    /// Event threshold for metrics.
    #[serde(default)]
    pub event_threshold: Option<ReplicationTimeValue>,
}

/// Delete marker replication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMarkerReplication {
    /// Status of delete marker replication.
    pub status: RuleStatus,
}

/// Source selection criteria for replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSelectionCriteria {
    /// Settings for replicating SSE-KMS encrypted objects.
    #[serde(default)]
    pub sse_kms_encrypted_objects: Option<FeatureStatus>,

    /// Replica modifications settings.
    #[serde(default)]
    pub replica_modifications: Option<FeatureStatus>,
}

/// A feature toggle carried by source selection criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureStatus {
    /// Whether the feature is on.
    pub status: RuleStatus,
}

/// Existing object replication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingObjectReplication {
    /// Status of existing object replication.
    pub status: RuleStatus,
}

/// Reasons a document cannot be written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// No replication role.
    #[error("document has no replication role")]
    MissingRole,

    /// No rules; the document must be deleted instead.
    #[error("document has no rules")]
    Empty,

    /// Two rules share an id.
    #[error("rule id {0} appears more than once")]
    DuplicateId(String),

    /// Two rules share a priority.
    #[error("rules {first} and {second} share priority {priority}")]
    PriorityCollision {
        /// The contested priority.
        priority: u32,
        /// Rule that held the priority first.
        first: String,
        /// Rule that collided with it.
        second: String,
    },

    /// A rule has no destination bucket.
    #[error("rule {0} has no destination bucket")]
    MissingDestination(String),
}
