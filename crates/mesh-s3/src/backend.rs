// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! [`MeshBackend`] on Amazon S3.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::config::retry::RetryConfig as SdkRetryConfig;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::types::{BucketVersioningStatus, VersioningConfiguration};
use aws_sdk_s3::Client;
use dashmap::DashMap;
use mesh_core::replication::bucket_arn;
use mesh_core::{BackendConfig, BucketRef, ReplicationConfiguration};
use mesh_reconciler::{BackendError, BackendOp, MeshBackend, VersioningStatus};
use tracing::debug;

use crate::convert;
use crate::error::{error_code, from_sdk, REPLICATION_NOT_FOUND};

/// Location constraint the service reports for the legacy EU region.
const LEGACY_EU_LOCATION: &str = "EU";

/// S3 backend with one client per region.
///
/// Replication calls must go to the bucket's own region; clients are built
/// lazily from a shared SDK configuration and cached.
pub struct S3Backend {
    sdk_config: SdkConfig,
    settings: BackendConfig,
    clients: DashMap<String, Client>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("endpoint_url", &self.settings.endpoint_url)
            .field("regions", &self.clients.len())
            .finish()
    }
}

impl S3Backend {
    /// Loads credentials and defaults from the environment.
    pub async fn load(settings: BackendConfig) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::from_sdk_config(sdk_config, settings)
    }

    /// Creates a backend from an existing SDK configuration.
    pub fn from_sdk_config(sdk_config: SdkConfig, settings: BackendConfig) -> Self {
        Self { sdk_config, settings, clients: DashMap::new() }
    }

    /// Returns the client for `region`.
    pub fn client(&self, region: &str) -> Client {
        self.clients
            .entry(region.to_string())
            .or_insert_with(|| {
                debug!(region = %region, "Creating S3 client");
                let mut builder = aws_sdk_s3::config::Builder::from(&self.sdk_config)
                    .region(Region::new(region.to_string()))
                    .force_path_style(self.settings.force_path_style)
                    .retry_config(
                        SdkRetryConfig::standard().with_max_attempts(self.settings.sdk_max_attempts.max(1)),
                    );
                if let Some(endpoint) = &self.settings.endpoint_url {
                    builder = builder.endpoint_url(endpoint);
                }
                Client::from_conf(builder.build())
            })
            .clone()
    }
}

/// Maps a location constraint onto a region name.
pub fn region_from_location(location: Option<&str>) -> String {
    match location {
        None | Some("") => "us-east-1".to_string(),
        Some(LEGACY_EU_LOCATION) => "eu-west-1".to_string(),
        Some(region) => region.to_string(),
    }
}

#[async_trait]
impl MeshBackend for S3Backend {
    fn name(&self) -> &str {
        "s3"
    }

    async fn get_replication(
        &self,
        bucket: &BucketRef,
    ) -> Result<Option<ReplicationConfiguration>, BackendError> {
        let result =
            self.client(&bucket.region).get_bucket_replication().bucket(&bucket.name).send().await;
        match result {
            Ok(output) => Ok(output.replication_configuration().map(convert::from_sdk)),
            Err(e) if error_code(&e) == Some(REPLICATION_NOT_FOUND) => Ok(None),
            Err(e) => Err(from_sdk(e, BackendOp::GetReplication, &bucket_arn(&bucket.name))),
        }
    }

    async fn put_replication(
        &self,
        bucket: &BucketRef,
        config: &ReplicationConfiguration,
    ) -> Result<(), BackendError> {
        let op = BackendOp::PutReplication;
        let document = convert::to_sdk(config).map_err(|e| {
            BackendError::invalid_request(op.action(), bucket_arn(&bucket.name), e.to_string())
        })?;
        self.client(&bucket.region)
            .put_bucket_replication()
            .bucket(&bucket.name)
            .replication_configuration(document)
            .send()
            .await
            .map_err(|e| from_sdk(e, op, &bucket_arn(&bucket.name)))?;
        Ok(())
    }

    async fn delete_replication(&self, bucket: &BucketRef) -> Result<(), BackendError> {
        self.client(&bucket.region)
            .delete_bucket_replication()
            .bucket(&bucket.name)
            .send()
            .await
            .map_err(|e| from_sdk(e, BackendOp::DeleteReplication, &bucket_arn(&bucket.name)))?;
        Ok(())
    }

    async fn get_versioning(&self, bucket: &BucketRef) -> Result<VersioningStatus, BackendError> {
        let output = self
            .client(&bucket.region)
            .get_bucket_versioning()
            .bucket(&bucket.name)
            .send()
            .await
            .map_err(|e| from_sdk(e, BackendOp::GetVersioning, &bucket_arn(&bucket.name)))?;
        Ok(match output.status() {
            Some(BucketVersioningStatus::Enabled) => VersioningStatus::Enabled,
            Some(BucketVersioningStatus::Suspended) => VersioningStatus::Suspended,
            _ => VersioningStatus::Unversioned,
        })
    }

    async fn enable_versioning(&self, bucket: &BucketRef) -> Result<(), BackendError> {
        self.client(&bucket.region)
            .put_bucket_versioning()
            .bucket(&bucket.name)
            .versioning_configuration(
                VersioningConfiguration::builder().status(BucketVersioningStatus::Enabled).build(),
            )
            .send()
            .await
            .map_err(|e| from_sdk(e, BackendOp::EnableVersioning, &bucket_arn(&bucket.name)))?;
        Ok(())
    }

    async fn locate_bucket(&self, name: &str) -> Result<Option<String>, BackendError> {
        let result =
            self.client(&self.settings.locate_region).get_bucket_location().bucket(name).send().await;
        match result {
            Ok(output) => {
                let region =
                    region_from_location(output.location_constraint().map(|l| l.as_str()));
                debug!(bucket = %name, region = %region, "Located bucket");
                Ok(Some(region))
            }
            Err(e) => {
                let err = from_sdk(e, BackendOp::LocateBucket, &bucket_arn(name));
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_from_location() {
        assert_eq!(region_from_location(None), "us-east-1");
        assert_eq!(region_from_location(Some("")), "us-east-1");
        assert_eq!(region_from_location(Some("EU")), "eu-west-1");
        assert_eq!(region_from_location(Some("ap-south-1")), "ap-south-1");
    }
}
