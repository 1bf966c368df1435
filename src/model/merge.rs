//! Merge policies over per-source diffs.
//!
//! `merge` takes the diffs each source produced against the same initial
//! document and partitions their operations into one accepted diff (applied
//! everywhere) and one rejected diff per source (parked for resolution).
//!
//! Two operations on the same path conflict when their intents disagree: two
//! inserts with different values, or an insert against a delete. Identical
//! intents collapse into a single accepted op.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::document::{Document, DocumentPath};
use super::diff::{Diff, DiffOp};
use super::SourceName;

/// Pluggable conflict arbiter. Pure over the diffs and the initial document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergePolicy {
    /// Reject every op on a conflicted path; accept the rest. Total, and the
    /// default.
    IgnoreConflicts,
    /// On conflicted paths, accept the named source's op and reject the
    /// others.
    TrustSource(SourceName),
    /// Never accept ops under the given path prefixes; conflicts among the
    /// remaining ops are rejected as under `IgnoreConflicts`.
    RejectPaths(Vec<DocumentPath>),
}

impl Default for MergePolicy {
    fn default() -> Self {
        MergePolicy::IgnoreConflicts
    }
}

/// Result of a merge: the accepted diff plus per-source rejected diffs,
/// aligned with the input order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub accepted: Diff<()>,
    pub rejected: Vec<Diff<SourceName>>,
}

impl MergeOutcome {
    pub fn has_conflicts(&self) -> bool {
        self.rejected.iter().any(|d| !d.is_empty())
    }
}

/// What an op means for a path, ignoring provenance. Equal intents from
/// different sources never conflict.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Intent {
    Delete,
    Insert(String),
}

fn intent<L>(op: &DiffOp<L>) -> Intent {
    match op {
        DiffOp::Insert { value, .. } => Intent::Insert(value.clone()),
        DiffOp::Delete { .. } => Intent::Delete,
    }
}

pub fn merge(policy: &MergePolicy, initial: &Document, diffs: &[Diff<SourceName>]) -> MergeOutcome {
    let _ = initial;

    let mut intents: BTreeMap<&DocumentPath, BTreeSet<Intent>> = BTreeMap::new();
    for d in diffs {
        for op in &d.ops {
            intents.entry(op.path()).or_default().insert(intent(op));
        }
    }
    let conflicted: BTreeSet<&DocumentPath> = intents
        .iter()
        .filter(|(_, set)| set.len() > 1)
        .map(|(path, _)| *path)
        .collect();

    let mut accepted: BTreeMap<DocumentPath, DiffOp<()>> = BTreeMap::new();
    let mut rejected: Vec<Diff<SourceName>> = diffs
        .iter()
        .map(|d| Diff::new(d.label.clone(), Vec::new()))
        .collect();

    for (idx, d) in diffs.iter().enumerate() {
        for op in &d.ops {
            if accepts(policy, &conflicted, &d.label, op) {
                accepted
                    .entry(op.path().clone())
                    .or_insert_with(|| op.clone().void());
            } else {
                rejected[idx].ops.push(op.clone());
            }
        }
    }

    MergeOutcome {
        accepted: ordered(accepted),
        rejected,
    }
}

fn accepts(
    policy: &MergePolicy,
    conflicted: &BTreeSet<&DocumentPath>,
    source: &SourceName,
    op: &DiffOp<SourceName>,
) -> bool {
    match policy {
        MergePolicy::IgnoreConflicts => !conflicted.contains(op.path()),
        MergePolicy::TrustSource(trusted) => {
            !conflicted.contains(op.path()) || source == trusted
        }
        MergePolicy::RejectPaths(prefixes) => {
            !prefixes.iter().any(|prefix| op.path().starts_with(prefix))
                && !conflicted.contains(op.path())
        }
    }
}

/// Canonical accepted order: deletes then inserts, each in lexicographic
/// path order, matching what `diff` emits.
fn ordered(accepted: BTreeMap<DocumentPath, DiffOp<()>>) -> Diff<()> {
    let (inserts, deletes): (Vec<_>, Vec<_>) = accepted
        .into_values()
        .partition(|op| matches!(op, DiffOp::Insert { .. }));
    let mut ops = deletes;
    ops.extend(inserts);
    Diff::new((), ops)
}
