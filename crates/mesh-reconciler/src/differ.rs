//! Desired vs. live comparison for one bucket.

use std::collections::HashMap;

use mesh_core::{is_mesh_rule_id, ReplicationRule};
use serde::{Deserialize, Serialize};

/// Kind of a single rule change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// The rule is missing from the bucket.
    Add,
    /// The rule must go.
    Remove,
    /// The rule exists but differs from the desired one.
    Replace,
}

/// A single rule change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// What to do.
    pub kind: ChangeKind,
    /// The rule to add or replace with, or the live rule to remove.
    pub rule: ReplicationRule,
}

/// Ordered changes for one bucket. Removals come first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeList {
    changes: Vec<Change>,
}

impl ChangeList {
    /// Returns true if nothing needs to change.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Iterates over the changes in application order.
    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    /// Number of changes of `kind`.
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }
}

impl<'a> IntoIterator for &'a ChangeList {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// Computes change lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct Differ;

impl Differ {
    /// Compares `desired` against `live`, matching rules by id.
    ///
    /// Live rules outside the mesh id namespace are ignored. A live rule
    /// that differs from its desired counterpart in any field, including a
    /// hand edit that the mesh would not write, is replaced.
    pub fn diff(desired: &[ReplicationRule], live: &[ReplicationRule]) -> ChangeList {
        let mut live_by_id: HashMap<&str, &ReplicationRule> = HashMap::with_capacity(live.len());
        for rule in live.iter().filter(|r| is_mesh_rule_id(&r.id)) {
            live_by_id.entry(rule.id.as_str()).or_insert(rule);
        }
        let desired_ids: HashMap<&str, &ReplicationRule> =
            desired.iter().map(|r| (r.id.as_str(), r)).collect();

        let mut removals: Vec<&ReplicationRule> =
            live_by_id.values().filter(|r| !desired_ids.contains_key(r.id.as_str())).copied().collect();
        removals.sort_by(|a, b| a.destination.cmp(&b.destination).then_with(|| a.id.cmp(&b.id)));

        let mut changes: Vec<Change> = removals
            .into_iter()
            .map(|rule| Change { kind: ChangeKind::Remove, rule: rule.clone() })
            .collect();

        for rule in desired {
            match live_by_id.get(rule.id.as_str()) {
                None => changes.push(Change { kind: ChangeKind::Add, rule: rule.clone() }),
                Some(current) if *current != rule => {
                    changes.push(Change { kind: ChangeKind::Replace, rule: rule.clone() })
                }
                Some(_) => {}
            }
        }

        ChangeList { changes }
    }
}
