//! Ordered, labelled documents.
//!
//! A [`Document`] is a flat mapping from a [`DocumentPath`] (a non-empty
//! sequence of string segments) to a string value. Document equality is
//! pathwise, duplicate paths cannot be represented, and a missing path is
//! distinct from an empty string value.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document path cannot be empty")]
    EmptyPath,
    #[error("document path segment cannot be empty")]
    EmptySegment,
    #[error("duplicate document path: {0}")]
    DuplicatePath(DocumentPath),
}

/// Non-empty ordered sequence of path segments.
///
/// Paths order lexicographically by segment, which is the order the diff
/// algorithm emits operations in.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct DocumentPath(Vec<String>);

impl DocumentPath {
    pub fn new<I, S>(segments: I) -> Result<Self, DocumentError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(DocumentError::EmptyPath);
        }
        if segments.iter().any(String::is_empty) {
            return Err(DocumentError::EmptySegment);
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// True when `prefix` is a leading subsequence of this path.
    pub fn starts_with(&self, prefix: &DocumentPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl TryFrom<Vec<String>> for DocumentPath {
    type Error = DocumentError;

    fn try_from(segments: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(segments)
    }
}

impl From<DocumentPath> for Vec<String> {
    fn from(path: DocumentPath) -> Self {
        path.0
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Flat path-to-value mapping.
///
/// Serialised as an ordered list of `(path, value)` pairs; decoding rejects
/// duplicate paths.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "Vec<(DocumentPath, String)>",
    into = "Vec<(DocumentPath, String)>"
)]
pub struct Document {
    entries: BTreeMap<DocumentPath, String>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pairs, rejecting duplicate paths.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, DocumentError>
    where
        I: IntoIterator<Item = (DocumentPath, String)>,
    {
        let mut entries = BTreeMap::new();
        for (path, value) in pairs {
            if entries.insert(path.clone(), value).is_some() {
                return Err(DocumentError::DuplicatePath(path));
            }
        }
        Ok(Self { entries })
    }

    /// Set `path` to `value`, returning the previous value if any.
    pub fn insert(&mut self, path: DocumentPath, value: String) -> Option<String> {
        self.entries.insert(path, value)
    }

    /// Unset `path`; absent paths are a no-op.
    pub fn remove(&mut self, path: &DocumentPath) -> Option<String> {
        self.entries.remove(path)
    }

    pub fn get(&self, path: &DocumentPath) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &DocumentPath) -> bool {
        self.entries.contains_key(path)
    }

    /// Entries in lexicographic path order.
    pub fn iter(&self) -> impl Iterator<Item = (&DocumentPath, &str)> {
        self.entries.iter().map(|(p, v)| (p, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TryFrom<Vec<(DocumentPath, String)>> for Document {
    type Error = DocumentError;

    fn try_from(pairs: Vec<(DocumentPath, String)>) -> Result<Self, Self::Error> {
        Self::from_pairs(pairs)
    }
}

impl From<Document> for Vec<(DocumentPath, String)> {
    fn from(doc: Document) -> Self {
        doc.entries.into_iter().collect()
    }
}
