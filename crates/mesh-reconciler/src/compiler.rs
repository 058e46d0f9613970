//! Desired rule computation.
//!
//! Compilation is pure: the same spec always yields the same rules, with the
//! same ids and priorities, no matter how the input buckets are ordered.

use std::collections::BTreeMap;

use mesh_core::{MeshSpec, ReplicationRule, SpecError};

/// Desired mesh rules keyed by source bucket name.
///
/// Every declared bucket has an entry, possibly empty.
pub type DesiredRules = BTreeMap<String, Vec<ReplicationRule>>;

/// Turns a [`MeshSpec`] into the rules each bucket must carry.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleCompiler;

impl RuleCompiler {
    /// Validates and compiles `spec`.
    ///
    /// # Errors
    ///
    /// Returns the validation error for duplicate names, invalid bucket
    /// names or regions, or a malformed identity.
    pub fn compile(spec: &MeshSpec) -> Result<DesiredRules, SpecError> {
        let spec = spec.normalized()?;
        Ok(Self::compile_normalized(&spec))
    }

    /// Compiles a spec that is already validated and sorted by name.
    ///
    /// Each source gets one rule per other bucket. Priorities number the
    /// destinations from 0 in name order. A mesh of fewer than two buckets
    /// compiles to empty rule sets. Under an owner override, replicas go to
    /// the identity's account, which owns every member.
    pub fn compile_normalized(spec: &MeshSpec) -> DesiredRules {
        let names: Vec<&str> = spec.bucket_names().collect();
        let owner = spec.options.owner_override.then(|| spec.identity_account()).flatten();

        names
            .iter()
            .map(|source| {
                let rules = names
                    .iter()
                    .filter(|destination| *destination != source)
                    .enumerate()
                    .map(|(priority, destination)| {
                        let rule =
                            ReplicationRule::new(source, destination, priority as u32, spec.options);
                        match owner {
                            Some(account) => rule.with_destination_account(account),
                            None => rule,
                        }
                    })
                    .collect();
                (source.to_string(), rules)
            })
            .collect()
    }
}
