// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Stable identifiers derived from bucket names.
//!
//! Rule ids and the mesh physical identity must be pure functions of bucket
//! names so that every reconciliation derives the same values. SHA-256 is
//! used instead of `std::hash` because the output has to stay identical
//! across toolchains and processes.

use sha2::{Digest, Sha256};

/// Prefix marking a replication rule as owned by a mesh.
pub const RULE_ID_PREFIX: &str = "mesh-";

/// Prefix of every mesh physical identity.
pub const PHYSICAL_ID_PREFIX: &str = "bucket-mesh-";

/// Number of hex digits kept from the digest.
const DIGEST_HEX_LEN: usize = 32;

/// Backend limit on replication rule id length.
pub const MAX_RULE_ID_LEN: usize = 255;

fn digest_hex(input: &str) -> String {
    let mut hex = hex::encode(Sha256::digest(input.as_bytes()));
    hex.truncate(DIGEST_HEX_LEN);
    hex
}

/// Derives the rule id for the directed pair `source -> destination`.
///
/// Bucket names cannot contain `/`, so joining on it is unambiguous.
#[must_use]
pub fn rule_id(source: &str, destination: &str) -> String {
    format!("{RULE_ID_PREFIX}{}", digest_hex(&format!("{source}/{destination}")))
}

/// Returns true if `id` falls in the mesh-owned rule id namespace.
#[must_use]
pub fn is_mesh_rule_id(id: &str) -> bool {
    id.strip_prefix(RULE_ID_PREFIX).is_some_and(|digest| {
        digest.len() == DIGEST_HEX_LEN
            && digest.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    })
}

/// Derives the physical identity of a mesh from its bucket names.
///
/// Input order does not matter; names are sorted before hashing.
#[must_use]
pub fn physical_id<'a, I>(names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut names: Vec<&str> = names.into_iter().collect();
    names.sort_unstable();
    format!("{PHYSICAL_ID_PREFIX}{}", digest_hex(&names.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_id_deterministic() {
        assert_eq!(rule_id("x-1", "x-2"), rule_id("x-1", "x-2"));
        assert_ne!(rule_id("x-1", "x-2"), rule_id("x-2", "x-1"));
    }

    #[test]
    fn test_rule_id_shape() {
        let id = rule_id("source-bucket", "destination-bucket");
        assert!(id.starts_with(RULE_ID_PREFIX));
        assert_eq!(id.len(), RULE_ID_PREFIX.len() + DIGEST_HEX_LEN);
        assert!(id.len() <= MAX_RULE_ID_LEN);
        assert!(is_mesh_rule_id(&id));
    }

    #[test]
    fn test_foreign_ids_not_owned() {
        assert!(!is_mesh_rule_id("rule1"));
        assert!(!is_mesh_rule_id("replicate-a-to-b"));
        assert!(!is_mesh_rule_id("mesh-manual"));
        assert!(!is_mesh_rule_id("mesh-0123456789ABCDEF0123456789ABCDEF"));
        assert!(!is_mesh_rule_id(""));
    }

    #[test]
    fn test_physical_id_order_independent() {
        let a = physical_id(["x-2", "x-1", "x-3"]);
        let b = physical_id(["x-1", "x-3", "x-2"]);
        assert_eq!(a, b);
        assert!(a.starts_with(PHYSICAL_ID_PREFIX));
    }

    #[test]
    fn test_physical_id_changes_with_membership() {
        assert_ne!(physical_id(["x-1", "x-2"]), physical_id(["x-1", "x-2", "x-3"]));
    }
}
