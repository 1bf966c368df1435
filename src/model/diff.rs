//! Edit scripts over documents.
//!
//! A [`Diff`] is an ordered list of per-path operations; applying one is a
//! left fold over the target document. `diff` emits deletes first, then
//! inserts, each in lexicographic path order, so corresponding operations
//! computed against the same base document line up across sources.

use serde::{Deserialize, Serialize};

use super::document::{Document, DocumentPath};

/// Single per-path edit, tagged with a label `L`.
///
/// Labels carry provenance (e.g. the source a diff came from) through the
/// merge step; the persistence and wire boundaries always use `DiffOp<()>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiffOp<L = ()> {
    Insert {
        label: L,
        path: DocumentPath,
        value: String,
    },
    Delete {
        label: L,
        path: DocumentPath,
    },
}

impl<L> DiffOp<L> {
    pub fn path(&self) -> &DocumentPath {
        match self {
            DiffOp::Insert { path, .. } | DiffOp::Delete { path, .. } => path,
        }
    }

    pub fn label(&self) -> &L {
        match self {
            DiffOp::Insert { label, .. } | DiffOp::Delete { label, .. } => label,
        }
    }

    pub fn map_label<M>(self, f: impl FnOnce(L) -> M) -> DiffOp<M> {
        match self {
            DiffOp::Insert { label, path, value } => DiffOp::Insert {
                label: f(label),
                path,
                value,
            },
            DiffOp::Delete { label, path } => DiffOp::Delete {
                label: f(label),
                path,
            },
        }
    }

    /// Strip the label for persistence or the wire.
    pub fn void(self) -> DiffOp<()> {
        self.map_label(|_| ())
    }
}

/// Ordered edit script with a label `L`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff<L = ()> {
    pub label: L,
    pub ops: Vec<DiffOp<L>>,
}

impl<L> Diff<L> {
    pub fn new(label: L, ops: Vec<DiffOp<L>>) -> Self {
        Self { label, ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn void(self) -> Diff<()> {
        Diff {
            label: (),
            ops: self.ops.into_iter().map(DiffOp::void).collect(),
        }
    }
}

impl Diff<()> {
    pub fn empty() -> Self {
        Diff {
            label: (),
            ops: Vec::new(),
        }
    }

    /// Attach `label` to the diff and every op in it.
    pub fn labelled<L: Clone>(self, label: L) -> Diff<L> {
        Diff {
            ops: self
                .ops
                .into_iter()
                .map(|op| op.map_label(|_| label.clone()))
                .collect(),
            label,
        }
    }
}

/// Minimal deterministic edit script turning `from` into `to`.
///
/// Satisfies `apply(&diff(a, b), a) == b`. Paths only present in `from`
/// become deletes; paths whose value differs (or is new) become inserts.
pub fn diff(from: &Document, to: &Document) -> Diff<()> {
    let mut ops = Vec::new();
    for (path, _) in from.iter() {
        if !to.contains(path) {
            ops.push(DiffOp::Delete {
                label: (),
                path: path.clone(),
            });
        }
    }
    for (path, value) in to.iter() {
        if from.get(path) != Some(value) {
            ops.push(DiffOp::Insert {
                label: (),
                path: path.clone(),
                value: value.to_string(),
            });
        }
    }
    Diff { label: (), ops }
}

/// Left fold of `d` over `doc`. Inserts overwrite; deletes of absent paths
/// are no-ops.
pub fn apply<L>(d: &Diff<L>, doc: &Document) -> Document {
    let mut out = doc.clone();
    for op in &d.ops {
        match op {
            DiffOp::Insert { path, value, .. } => {
                out.insert(path.clone(), value.clone());
            }
            DiffOp::Delete { path, .. } => {
                out.remove(path);
            }
        }
    }
    out
}
