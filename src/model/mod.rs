//! Core domain model: identifiers, documents, diffs, merge policies.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod document;
pub mod diff;
pub mod merge;

pub use document::{Document, DocumentError, DocumentPath};
pub use diff::{apply, diff, Diff, DiffOp};
pub use merge::{merge, MergeOutcome, MergePolicy};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid name {0:?}: expected non-empty ascii [A-Za-z0-9._-]")]
pub struct NameError(pub String);

fn validate_name(raw: &str) -> Result<(), NameError> {
    let ok = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(NameError(raw.to_string()))
    }
}

macro_rules! name_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Result<Self, NameError> {
                let raw = raw.into();
                validate_name(&raw)?;
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = NameError;

            fn try_from(raw: String) -> Result<Self, Self::Error> {
                Self::new(raw)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> Self {
                name.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_type! {
    /// Kind of business object mirrored across sources (e.g. `customer`).
    EntityName
}

name_type! {
    /// A configured external system holding one copy of an entity.
    SourceName
}

impl std::error::Error for SourceName {}

/// Identifier issued by an external source; opaque to retcon.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    pub entity: EntityName,
    pub source: SourceName,
    pub id: String,
}

impl ForeignKey {
    pub fn new(entity: EntityName, source: SourceName, id: impl Into<String>) -> Self {
        Self {
            entity,
            source,
            id: id.into(),
        }
    }
}

impl fmt::Display for ForeignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.entity, self.source, self.id)
    }
}

/// Identifier minted by retcon; stable across sources, unique per entity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    pub entity: EntityName,
    pub id: u64,
}

impl InternalKey {
    pub fn new(entity: EntityName, id: u64) -> Self {
        Self { entity, id }
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Store-assigned identifier of a persisted diff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffId(pub i64);

impl fmt::Display for DiffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned identifier of one operation within a persisted diff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffOpId(pub i64);

impl fmt::Display for DiffOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External "something changed" event for one per-source copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub entity: EntityName,
    pub source: SourceName,
    pub foreign_id: String,
}

impl ChangeNotification {
    pub fn foreign_key(&self) -> ForeignKey {
        ForeignKey::new(self.entity.clone(), self.source.clone(), self.foreign_id.clone())
    }
}

impl fmt::Display for ChangeNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.entity, self.source, self.foreign_id)
    }
}

/// One queued unit of worker activity.
///
/// `Apply` carries the store-assigned ids of the selected ops out-of-band of
/// the diff, so the worker can mark them accepted when it closes the
/// conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    Process(ChangeNotification),
    Apply {
        diff_id: DiffId,
        diff: Diff<()>,
        accepted: Vec<DiffOpId>,
    },
}

/// A parked diff awaiting human resolution.
///
/// `diff` holds the operations the merge accepted; `conflicts` lists the
/// refused operations with their store-assigned ids, which a resolution
/// selects from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub diff_id: DiffId,
    pub key: InternalKey,
    pub initial: Document,
    pub diff: Diff<()>,
    pub conflicts: Vec<(DiffOpId, DiffOp<()>)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_reject_non_ascii_and_empty() {
        assert!(EntityName::new("customer").is_ok());
        assert!(SourceName::new("db-1").is_ok());
        assert_eq!(EntityName::new(""), Err(NameError(String::new())));
        assert_eq!(
            SourceName::new("naïve"),
            Err(NameError("naïve".to_string()))
        );
        assert!(EntityName::new("a b").is_err());
    }

    #[test]
    fn work_item_json_roundtrip() {
        let item = WorkItem::Process(ChangeNotification {
            entity: EntityName::new("customer").unwrap(),
            source: SourceName::new("db1").unwrap(),
            foreign_id: "42".to_string(),
        });
        let json = serde_json::to_string(&item).expect("encode");
        let back: WorkItem = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, item);
    }
}
