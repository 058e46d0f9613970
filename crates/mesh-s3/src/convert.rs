// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Conversion between SDK replication types and the document model.
//!
//! Foreign rules are written back exactly as they were read, so every field
//! the SDK exposes is carried in both directions.

use aws_sdk_s3::error::BuildError;
use aws_sdk_s3::types as sdk;
use mesh_core::replication::{
    AccessControlTranslation, ConfigRule, DeleteMarkerReplication, EncryptionConfiguration,
    ExistingObjectReplication, FeatureStatus, ReplicationConfiguration, ReplicationDestination,
    ReplicationFilter, ReplicationFilterAnd, ReplicationMetrics, ReplicationTag, ReplicationTime,
    ReplicationTimeValue, RuleStatus, SourceSelectionCriteria,
};

/// Maps an SDK status string; unknown values read as disabled.
fn status(value: &str) -> RuleStatus {
    RuleStatus::parse(value).unwrap_or(RuleStatus::Disabled)
}

fn minutes(value: &sdk::ReplicationTimeValue) -> ReplicationTimeValue {
    ReplicationTimeValue { minutes: value.minutes().map_or(0, |m| m.max(0) as u32) }
}

fn tag(value: &sdk::Tag) -> ReplicationTag {
    ReplicationTag { key: value.key().to_string(), value: value.value().to_string() }
}

/// Reads an SDK document.
pub fn from_sdk(config: &sdk::ReplicationConfiguration) -> ReplicationConfiguration {
    ReplicationConfiguration::new(config.role(), config.rules().iter().map(rule_from_sdk).collect())
}

#[allow(deprecated)]
fn rule_from_sdk(rule: &sdk::ReplicationRule) -> ConfigRule {
    ConfigRule {
        id: rule.id().map(str::to_string),
        status: status(rule.status().as_str()),
        priority: rule.priority().map(|p| p.max(0) as u32),
        prefix: rule.prefix().map(str::to_string),
        filter: rule.filter().map(|f| ReplicationFilter {
            prefix: f.prefix().map(str::to_string),
            tag: f.tag().map(tag),
            and: f.and().map(|and| ReplicationFilterAnd {
                prefix: and.prefix().map(str::to_string),
                tags: and.tags().iter().map(tag).collect(),
            }),
        }),
        destination: rule.destination().map(destination_from_sdk).unwrap_or_default(),
        delete_marker_replication: rule.delete_marker_replication().map(|d| {
            DeleteMarkerReplication {
                status: d.status().map_or(RuleStatus::Disabled, |s| status(s.as_str())),
            }
        }),
        source_selection_criteria: rule.source_selection_criteria().map(|c| {
            SourceSelectionCriteria {
                sse_kms_encrypted_objects: c
                    .sse_kms_encrypted_objects()
                    .map(|s| FeatureStatus { status: status(s.status().as_str()) }),
                replica_modifications: c
                    .replica_modifications()
                    .map(|s| FeatureStatus { status: status(s.status().as_str()) }),
            }
        }),
        existing_object_replication: rule
            .existing_object_replication()
            .map(|e| ExistingObjectReplication { status: status(e.status().as_str()) }),
    }
}

fn destination_from_sdk(destination: &sdk::Destination) -> ReplicationDestination {
    ReplicationDestination {
        bucket: destination.bucket().to_string(),
        account: destination.account().map(str::to_string),
        storage_class: destination.storage_class().map(|s| s.as_str().to_string()),
        access_control_translation: destination
            .access_control_translation()
            .map(|a| AccessControlTranslation { owner: a.owner().as_str().to_string() }),
        encryption_configuration: destination.encryption_configuration().map(|e| {
            EncryptionConfiguration { replica_kms_key_id: e.replica_kms_key_id().map(str::to_string) }
        }),
        replication_time: destination.replication_time().map(|t| ReplicationTime {
            status: status(t.status().as_str()),
            time: t.time().map(minutes),
        }),
        metrics: destination.metrics().map(|m| ReplicationMetrics {
            status: status(m.status().as_str()),
            event_threshold: m.event_threshold().map(minutes),
        }),
    }
}

fn time_value(value: &ReplicationTimeValue) -> sdk::ReplicationTimeValue {
    sdk::ReplicationTimeValue::builder().minutes(value.minutes as i32).build()
}

fn sdk_tag(value: &ReplicationTag) -> Result<sdk::Tag, BuildError> {
    sdk::Tag::builder().key(&value.key).value(&value.value).build()
}

/// Builds an SDK document.
///
/// # Errors
///
/// Returns the SDK build error if a required field is missing.
pub fn to_sdk(config: &ReplicationConfiguration) -> Result<sdk::ReplicationConfiguration, BuildError> {
    let rules = config.rules.iter().map(rule_to_sdk).collect::<Result<Vec<_>, _>>()?;
    sdk::ReplicationConfiguration::builder().role(&config.role).set_rules(Some(rules)).build()
}

#[allow(deprecated)]
fn rule_to_sdk(rule: &ConfigRule) -> Result<sdk::ReplicationRule, BuildError> {
    let filter = match &rule.filter {
        Some(filter) => {
            let and = match &filter.and {
                Some(and) => Some(
                    sdk::ReplicationRuleAndOperator::builder()
                        .set_prefix(and.prefix.clone())
                        .set_tags(Some(and.tags.iter().map(sdk_tag).collect::<Result<Vec<_>, _>>()?))
                        .build(),
                ),
                None => None,
            };
            Some(
                sdk::ReplicationRuleFilter::builder()
                    .set_prefix(filter.prefix.clone())
                    .set_tag(filter.tag.as_ref().map(sdk_tag).transpose()?)
                    .set_and(and)
                    .build(),
            )
        }
        None => None,
    };

    let criteria = match &rule.source_selection_criteria {
        Some(criteria) => Some(
            sdk::SourceSelectionCriteria::builder()
                .set_sse_kms_encrypted_objects(
                    criteria
                        .sse_kms_encrypted_objects
                        .as_ref()
                        .map(|s| {
                            sdk::SseKmsEncryptedObjects::builder()
                                .status(sdk::SseKmsEncryptedObjectsStatus::from(s.status.as_str()))
                                .build()
                        })
                        .transpose()?,
                )
                .set_replica_modifications(
                    criteria
                        .replica_modifications
                        .as_ref()
                        .map(|s| {
                            sdk::ReplicaModifications::builder()
                                .status(sdk::ReplicaModificationsStatus::from(s.status.as_str()))
                                .build()
                        })
                        .transpose()?,
                )
                .build(),
        ),
        None => None,
    };

    sdk::ReplicationRule::builder()
        .set_id(rule.id.clone())
        .status(sdk::ReplicationRuleStatus::from(rule.status.as_str()))
        .set_priority(rule.priority.map(|p| p as i32))
        .set_prefix(rule.prefix.clone())
        .set_filter(filter)
        .destination(destination_to_sdk(&rule.destination)?)
        .set_delete_marker_replication(rule.delete_marker_replication.as_ref().map(|d| {
            sdk::DeleteMarkerReplication::builder()
                .status(sdk::DeleteMarkerReplicationStatus::from(d.status.as_str()))
                .build()
        }))
        .set_source_selection_criteria(criteria)
        .set_existing_object_replication(
            rule.existing_object_replication
                .as_ref()
                .map(|e| {
                    sdk::ExistingObjectReplication::builder()
                        .status(sdk::ExistingObjectReplicationStatus::from(e.status.as_str()))
                        .build()
                })
                .transpose()?,
        )
        .build()
}

fn destination_to_sdk(destination: &ReplicationDestination) -> Result<sdk::Destination, BuildError> {
    sdk::Destination::builder()
        .bucket(&destination.bucket)
        .set_account(destination.account.clone())
        .set_storage_class(destination.storage_class.as_deref().map(sdk::StorageClass::from))
        .set_access_control_translation(
            destination
                .access_control_translation
                .as_ref()
                .map(|a| {
                    sdk::AccessControlTranslation::builder()
                        .owner(sdk::OwnerOverride::from(a.owner.as_str()))
                        .build()
                })
                .transpose()?,
        )
        .set_encryption_configuration(destination.encryption_configuration.as_ref().map(|e| {
            sdk::EncryptionConfiguration::builder()
                .set_replica_kms_key_id(e.replica_kms_key_id.clone())
                .build()
        }))
        .set_replication_time(
            destination
                .replication_time
                .as_ref()
                .map(|t| {
                    sdk::ReplicationTime::builder()
                        .status(sdk::ReplicationTimeStatus::from(t.status.as_str()))
                        .set_time(t.time.as_ref().map(time_value))
                        .build()
                })
                .transpose()?,
        )
        .set_metrics(
            destination
                .metrics
                .as_ref()
                .map(|m| {
                    sdk::Metrics::builder()
                        .status(sdk::MetricsStatus::from(m.status.as_str()))
                        .set_event_threshold(m.event_threshold.as_ref().map(time_value))
                        .build()
                })
                .transpose()?,
        )
        .build()
}
