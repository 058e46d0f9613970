//! Declared mesh types: participating buckets and the mesh spec.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::SpecError;
use crate::hash;

/// Minimum bucket name length accepted by the backend.
const MIN_BUCKET_NAME_LEN: usize = 3;

/// Maximum bucket name length accepted by the backend.
const MAX_BUCKET_NAME_LEN: usize = 63;

/// One mesh participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketRef {
    /// Bucket name, unique within the backend.
    pub name: String,
    /// Region hosting the bucket.
    pub region: String,
}

impl BucketRef {
    /// Creates a bucket reference.
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self { name: name.into(), region: region.into() }
    }
}

impl std::fmt::Display for BucketRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.region)
    }
}

/// Per-mesh switches applied to every generated rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuleOptions {
    /// Replicate delete markers to the other buckets.
    pub replicate_delete_markers: bool,
    /// Backfill objects that predate the rule.
    pub replicate_existing_objects: bool,
    /// Hand replica ownership to the destination bucket's account.
    pub owner_override: bool,
}

impl Default for RuleOptions {
    fn default() -> Self {
        Self { replicate_delete_markers: true, replicate_existing_objects: false, owner_override: false }
    }
}

/// The declared desired state of a mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshSpec {
    /// Participating buckets. Order carries no meaning.
    pub buckets: Vec<BucketRef>,
    /// IAM role the backend assumes to replicate.
    pub replication_identity_arn: String,
    /// Options applied to every rule.
    #[serde(flatten)]
    pub options: RuleOptions,
}

impl MeshSpec {
    /// Creates a spec with default rule options.
    pub fn new(buckets: Vec<BucketRef>, replication_identity_arn: impl Into<String>) -> Self {
        Self {
            buckets,
            replication_identity_arn: replication_identity_arn.into(),
            options: RuleOptions::default(),
        }
    }

    /// Sets the rule options.
    #[must_use]
    pub fn with_options(mut self, options: RuleOptions) -> Self {
        self.options = options;
        self
    }

    /// Account id of the replication identity, if the ARN carries one.
    pub fn identity_account(&self) -> Option<&str> {
        self.replication_identity_arn.split(':').nth(4).filter(|account| !account.is_empty())
    }

    /// Checks bucket names, regions, uniqueness and the identity ARN.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), SpecError> {
        let mut seen = HashSet::with_capacity(self.buckets.len());
        for bucket in &self.buckets {
            validate_bucket_name(&bucket.name)?;
            if bucket.region.trim().is_empty() {
                return Err(SpecError::MissingRegion(bucket.name.clone()));
            }
            if !seen.insert(bucket.name.as_str()) {
                return Err(SpecError::DuplicateBucket(bucket.name.clone()));
            }
        }
        validate_identity_arn(&self.replication_identity_arn)
    }

    /// Returns a validated copy with buckets sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if [`MeshSpec::validate`] fails.
    pub fn normalized(&self) -> Result<Self, SpecError> {
        self.validate()?;
        let mut spec = self.clone();
        spec.buckets.sort();
        Ok(spec)
    }

    /// Returns a copy sorted by name with duplicate names dropped.
    ///
    /// Used where the declaration only names buckets to clean up, so nothing that
    /// cleanup does not need is validated.
    #[must_use]
    pub fn normalized_lenient(&self) -> Self {
        let mut spec = self.clone();
        spec.buckets.retain(|b| !b.name.is_empty());
        spec.buckets.sort();
        spec.buckets.dedup_by(|a, b| a.name == b.name);
        spec
    }

    /// Bucket names in declaration order.
    pub fn bucket_names(&self) -> impl Iterator<Item = &str> {
        self.buckets.iter().map(|b| b.name.as_str())
    }

    /// Returns true if a bucket with this name participates.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.buckets.iter().any(|b| b.name == name)
    }

    /// Number of participating buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Returns true if no bucket participates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Durable identity of this mesh, derived from its bucket names.
    #[must_use]
    pub fn physical_id(&self) -> String {
        hash::physical_id(self.bucket_names())
    }
}

/// Checks a bucket name against the backend naming rules.
///
/// # Errors
///
/// Returns [`SpecError::InvalidBucketName`] describing the violated rule.
pub fn validate_bucket_name(name: &str) -> Result<(), SpecError> {
    let invalid = |reason| Err(SpecError::InvalidBucketName { name: name.to_string(), reason });

    if name.len() < MIN_BUCKET_NAME_LEN || name.len() > MAX_BUCKET_NAME_LEN {
        return invalid("must be between 3 and 63 characters");
    }
    if !name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
    {
        return invalid("only lowercase letters, digits, '.' and '-' are allowed");
    }
    let bytes = name.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !bytes.first().is_some_and(alnum) || !bytes.last().is_some_and(alnum) {
        return invalid("must begin and end with a letter or digit");
    }
    if name.contains("..") {
        return invalid("must not contain adjacent periods");
    }
    Ok(())
}

/// Checks that `arn` names an IAM role: `arn:<partition>:iam::<account>:role/<name>`.
///
/// # Errors
///
/// Returns [`SpecError::MalformedIdentity`] describing the problem.
pub fn validate_identity_arn(arn: &str) -> Result<(), SpecError> {
    let malformed = |reason| Err(SpecError::MalformedIdentity { arn: arn.to_string(), reason });

    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    let [scheme, partition, service, region, account, resource] = parts.as_slice() else {
        return malformed("expected arn:<partition>:iam::<account>:role/<name>");
    };
    if *scheme != "arn" || partition.is_empty() {
        return malformed("not an ARN");
    }
    if *service != "iam" || !region.is_empty() {
        return malformed("not an IAM ARN");
    }
    if account.is_empty() || !account.bytes().all(|b| b.is_ascii_digit()) {
        return malformed("account id must be numeric");
    }
    match resource.strip_prefix("role/") {
        Some(name) if !name.is_empty() => Ok(()),
        _ => malformed("resource must be role/<name>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLE: &str = "arn:aws:iam::111:role/repl";

    fn spec(names: &[&str]) -> MeshSpec {
        MeshSpec::new(names.iter().map(|n| BucketRef::new(*n, "us-east-1")).collect(), ROLE)
    }

    #[test]
    fn test_valid_spec() {
        assert!(spec(&["x-1", "x-2"]).validate().is_ok());
        assert!(spec(&[]).validate().is_ok());
    }

    #[test]
    fn test_duplicate_bucket_rejected() {
        let err = spec(&["x-1", "x-2", "x-1"]).validate().unwrap_err();
        assert_eq!(err, SpecError::DuplicateBucket("x-1".to_string()));
    }

    #[test]
    fn test_missing_region_rejected() {
        let mut s = spec(&["x-1"]);
        s.buckets[0].region = " ".to_string();
        assert_eq!(s.validate(), Err(SpecError::MissingRegion("x-1".to_string())));
    }

    #[test]
    fn test_bucket_name_rules() {
        assert!(validate_bucket_name("my.bucket-01").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name(&"a".repeat(64)).is_err());
        assert!(validate_bucket_name("MyBucket").is_err());
        assert!(validate_bucket_name("-bucket").is_err());
        assert!(validate_bucket_name("bucket.").is_err());
        assert!(validate_bucket_name("my..bucket").is_err());
        assert!(validate_bucket_name("my/bucket").is_err());
    }

    #[test]
    fn test_identity_arn_rules() {
        assert!(validate_identity_arn(ROLE).is_ok());
        assert!(validate_identity_arn("arn:aws-cn:iam::123456789012:role/path/repl").is_ok());
        assert!(validate_identity_arn("").is_err());
        assert!(validate_identity_arn("arn:aws:s3:::bucket").is_err());
        assert!(validate_identity_arn("arn:aws:iam::abc:role/repl").is_err());
        assert!(validate_identity_arn("arn:aws:iam::111:user/repl").is_err());
        assert!(validate_identity_arn("arn:aws:iam::111:role/").is_err());
        assert!(validate_identity_arn("arn:aws:iam:us-east-1:111:role/repl").is_err());
    }

    #[test]
    fn test_normalized_sorts_by_name() {
        let s = spec(&["c-3", "a-1", "b-2"]).normalized().unwrap();
        let names: Vec<_> = s.bucket_names().collect();
        assert_eq!(names, vec!["a-1", "b-2", "c-3"]);
    }

    #[test]
    fn test_normalized_lenient_dedupes() {
        let mut s = spec(&["b-2", "a-1", "b-2"]);
        s.replication_identity_arn = "not-an-arn".to_string();
        let s = s.normalized_lenient();
        let names: Vec<_> = s.bucket_names().collect();
        assert_eq!(names, vec!["a-1", "b-2"]);
    }

    #[test]
    fn test_physical_id_ignores_order() {
        assert_eq!(spec(&["x-1", "x-2"]).physical_id(), spec(&["x-2", "x-1"]).physical_id());
        assert_eq!(spec(&["x-1", "x-2"]).physical_id(), hash::physical_id(["x-1", "x-2"]));
    }

    #[test]
    fn test_spec_serde_shape() {
        let json = r#"{
            "buckets": [{"name": "x-1", "region": "us-east-1"}, {"name": "x-2", "region": "eu-west-1"}],
            "replicationIdentityArn": "arn:aws:iam::111:role/repl",
            "replicateExistingObjects": true
        }"#;
        let s: MeshSpec = serde_json::from_str(json).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.buckets[1], BucketRef::new("x-2", "eu-west-1"));
        assert!(s.options.replicate_existing_objects);
        assert!(s.options.replicate_delete_markers);
        assert!(!s.options.owner_override);
    }

    #[test]
    fn test_identity_account() {
        assert_eq!(spec(&["x-1"]).identity_account(), Some("111"));

        let mut s = spec(&["x-1"]);
        s.replication_identity_arn = "repl".to_string();
        assert_eq!(s.identity_account(), None);
    }
}
