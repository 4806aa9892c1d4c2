//! core type-safe names and paths for the collection tree.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a stored document.
///
/// A fresh id is allocated every time a document is created (including the
/// create half of an overwrite). Moving a document keeps its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub u64);

impl DocumentId {
    /// raw numeric value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc-{}", self.0)
    }
}

/// A validated single path segment: a document name or a collection name.
///
/// Valid names:
/// - 1-255 bytes
/// - no `/`, no control characters
/// - not `.` or `..`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentName(String);

impl DocumentName {
    /// create a new DocumentName, validating the input
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        validate_segment(&name)?;
        Ok(Self(name))
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DocumentName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate_segment(name: &str) -> Result<(), InvalidNameError> {
    if name.is_empty() {
        return Err(InvalidNameError::Empty);
    }

    if name.len() > 255 {
        return Err(InvalidNameError::TooLong(name.len()));
    }

    if name == "." || name == ".." {
        return Err(InvalidNameError::Reserved(name.to_string()));
    }

    for (i, c) in name.chars().enumerate() {
        if c == '/' || c.is_control() {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
    }

    Ok(())
}

/// An absolute, normalized collection path such as `/db/apps/data`.
///
/// Every path lives under the root collection `/db`. The parent of a
/// collection is derived from its path on demand; collections never hold a
/// reference to their parent.
///
/// Ordering is component-wise, which puts a parent before all of its
/// descendants and keeps a subtree contiguous in sorted order. The lock
/// manager relies on this for its acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionPath(String);

impl CollectionPath {
    /// the root collection
    pub const ROOT: &'static str = "/db";

    /// the root collection path
    pub fn root() -> Self {
        Self(Self::ROOT.to_string())
    }

    /// `/db/history`, where the history trigger archives by default
    pub fn history() -> Self {
        Self(format!("{}/history", Self::ROOT))
    }

    /// Parse and normalize a collection path.
    ///
    /// A trailing slash is accepted and dropped. Relative paths are rejected.
    pub fn new(path: impl AsRef<str>) -> Result<Self, InvalidNameError> {
        let path = path.as_ref();
        let trimmed = path.strip_suffix('/').unwrap_or(path);

        if trimmed.is_empty() {
            return Err(InvalidNameError::Empty);
        }

        let rest = match trimmed.strip_prefix(Self::ROOT) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => return Err(InvalidNameError::InvalidPath(path.to_string())),
        };

        for segment in rest.split('/').skip(1) {
            validate_segment(segment).map_err(|_| InvalidNameError::InvalidPath(path.to_string()))?;
        }

        Ok(Self(trimmed.to_string()))
    }

    /// get the path as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// check whether this is `/db`
    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }

    /// path segments, starting with `db`
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').skip(1)
    }

    /// last path segment
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// parent collection, `None` for the root
    pub fn parent(&self) -> Option<CollectionPath> {
        if self.is_root() {
            return None;
        }
        self.0.rfind('/').map(|idx| Self(self.0[..idx].to_string()))
    }

    /// child collection path
    pub fn child(&self, name: &str) -> Result<CollectionPath, InvalidNameError> {
        validate_segment(name)?;
        Ok(Self(format!("{}/{}", self.0, name)))
    }

    /// Append every segment of `other` below this path.
    ///
    /// `/db/history` joined with `/db/test` yields `/db/history/db/test`.
    pub fn join(&self, other: &CollectionPath) -> CollectionPath {
        Self(format!("{}{}", self.0, other.0))
    }

    /// true when `self` equals `ancestor` or lies below it
    pub fn is_within(&self, ancestor: &CollectionPath) -> bool {
        self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0) && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/'))
    }

    /// All paths from the root down to and including this one.
    pub fn lineage(&self) -> Vec<CollectionPath> {
        let mut out = Vec::new();
        let mut current = String::new();
        for segment in self.components() {
            current.push('/');
            current.push_str(segment);
            out.push(Self(current.clone()));
        }
        out
    }

    /// Re-root this path from `from` onto `to`, used when a subtree moves.
    ///
    /// Returns `None` when `self` is not within `from`.
    pub fn rebase(&self, from: &CollectionPath, to: &CollectionPath) -> Option<CollectionPath> {
        if !self.is_within(from) {
            return None;
        }
        Some(Self(format!("{}{}", to.0, &self.0[from.0.len()..])))
    }
}

impl Ord for CollectionPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components().cmp(other.components())
    }
}

impl PartialOrd for CollectionPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CollectionPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Full address of a document: its collection plus its name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentPath {
    pub collection: CollectionPath,
    pub name: DocumentName,
}

impl DocumentPath {
    /// create a new DocumentPath
    pub fn new(collection: CollectionPath, name: DocumentName) -> Self {
        Self { collection, name }
    }

    /// Parse `/db/coll/doc.xml` into collection and name.
    pub fn parse(path: &str) -> Result<Self, InvalidNameError> {
        let idx = path
            .rfind('/')
            .ok_or_else(|| InvalidNameError::InvalidPath(path.to_string()))?;
        let collection = CollectionPath::new(&path[..idx])?;
        let name = DocumentName::new(&path[idx + 1..])?;
        Ok(Self { collection, name })
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.name)
    }
}

/// error type for invalid names (collections, documents)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidCharacter { char: char, position: usize },
    Reserved(String),
    InvalidPath(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} bytes", len),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character {:?} at position {}", char, position)
            }
            Self::Reserved(name) => write!(f, "'{}' is a reserved name", name),
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
        }
    }
}

impl std::error::Error for InvalidNameError {}
