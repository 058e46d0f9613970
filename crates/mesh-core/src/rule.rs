// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Mesh-owned replication rules.
//!
//! A [`ReplicationRule`] is the mesh's view of one directed replication edge.
//! It renders to exactly one [`ConfigRule`] in the source bucket's document,
//! and live mesh-owned document rules parse back into it so desired and live
//! state can be compared by id.

use serde::{Deserialize, Serialize};

use crate::hash::rule_id;
use crate::replication::{
    AccessControlTranslation, ConfigRule, DeleteMarkerReplication, ExistingObjectReplication,
    ReplicationDestination, ReplicationFilter, RuleStatus,
};
use crate::types::RuleOptions;

/// One directed replication edge owned by a mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationRule {
    /// Stable id derived from the source and destination names.
    pub id: String,
    /// Source bucket name.
    pub source: String,
    /// Destination bucket name.
    pub destination: String,
    /// Priority among the source bucket's mesh rules.
    pub priority: u32,
    /// Rule status.
    pub status: RuleStatus,
    /// Rule options.
    pub options: RuleOptions,
    /// Account that takes ownership of replicas under an owner override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_account: Option<String>,
    /// False when the stored rule carries anything the mesh would not write
    /// (extra filters, storage class, a missing priority, ...).
    pub canonical: bool,
}

impl ReplicationRule {
    /// Creates an enabled rule for `source -> destination`.
    pub fn new(source: &str, destination: &str, priority: u32, options: RuleOptions) -> Self {
        Self {
            id: rule_id(source, destination),
            source: source.to_string(),
            destination: destination.to_string(),
            priority,
            status: RuleStatus::Enabled,
            options,
            destination_account: None,
            canonical: true,
        }
    }

    /// Sets the account that owns replicas when the owner override is on.
    #[must_use]
    pub fn with_destination_account(mut self, account: impl Into<String>) -> Self {
        self.destination_account = Some(account.into());
        self
    }

    fn destination(&self) -> ReplicationDestination {
        let mut destination = ReplicationDestination::bucket(&self.destination);
        // The backend refuses an owner override without the owning account.
        if let (true, Some(account)) = (self.options.owner_override, &self.destination_account) {
            destination.account = Some(account.clone());
            destination.access_control_translation = Some(AccessControlTranslation::destination());
        }
        destination
    }

    /// Renders the rule as a document rule.
    #[must_use]
    pub fn to_config_rule(&self) -> ConfigRule {
        ConfigRule {
            id: Some(self.id.clone()),
            status: self.status,
            priority: Some(self.priority),
            prefix: None,
            filter: Some(ReplicationFilter::whole_bucket()),
            destination: self.destination(),
            delete_marker_replication: Some(DeleteMarkerReplication {
                status: RuleStatus::from_enabled(self.options.replicate_delete_markers),
            }),
            source_selection_criteria: None,
            existing_object_replication: self
                .options
                .replicate_existing_objects
                .then_some(ExistingObjectReplication { status: RuleStatus::Enabled }),
        }
    }

    /// Parses a live document rule of `source`.
    ///
    /// Returns `None` for rules outside the mesh-owned id namespace.
    #[must_use]
    pub fn from_config_rule(source: &str, rule: &ConfigRule) -> Option<Self> {
        if !rule.is_mesh_owned() {
            return None;
        }
        let id = rule.id.clone()?;
        let enabled = |status: Option<RuleStatus>| status == Some(RuleStatus::Enabled);

        let mut parsed = Self {
            id,
            source: source.to_string(),
            destination: rule.destination_bucket().to_string(),
            priority: rule.priority.unwrap_or_default(),
            status: rule.status,
            options: RuleOptions {
                replicate_delete_markers: enabled(
                    rule.delete_marker_replication.as_ref().map(|d| d.status),
                ),
                replicate_existing_objects: enabled(
                    rule.existing_object_replication.as_ref().map(|e| e.status),
                ),
                owner_override: rule
                    .destination
                    .access_control_translation
                    .as_ref()
                    .is_some_and(AccessControlTranslation::is_destination),
            },
            destination_account: rule.destination.account.clone(),
            canonical: true,
        };
        parsed.canonical = parsed.to_config_rule() == normalize(rule);
        Some(parsed)
    }
}

/// Folds encodings the backend treats as equivalent onto the rendered form:
/// an absent filter prefix means the whole bucket, and a disabled existing
/// object replication is the same as none.
fn normalize(rule: &ConfigRule) -> ConfigRule {
    let mut rule = rule.clone();
    if let Some(filter) = rule.filter.as_mut() {
        if filter.prefix.is_none() && filter.tag.is_none() && filter.and.is_none() {
            filter.prefix = Some(String::new());
        }
    }
    if rule.existing_object_replication.as_ref().is_some_and(|e| e.status == RuleStatus::Disabled) {
        rule.existing_object_replication = None;
    }
    rule
}
