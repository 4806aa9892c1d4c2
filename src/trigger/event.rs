//! Operation kinds and the events handed to trigger hooks.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::storage::{CollectionPath, Document, DocumentPath};

/// Structural operation a trigger can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Collection creation.
    Create,
    Store,
    Remove,
    Move,
    Copy,
    /// In-place content replacement produced by an update delta.
    Update,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::Create,
        OperationKind::Store,
        OperationKind::Remove,
        OperationKind::Move,
        OperationKind::Copy,
        OperationKind::Update,
    ];
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Create => "create",
            OperationKind::Store => "store",
            OperationKind::Remove => "remove",
            OperationKind::Move => "move",
            OperationKind::Copy => "copy",
            OperationKind::Update => "update",
        };
        f.write_str(s)
    }
}

/// Resource an operation acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerTarget {
    Collection(CollectionPath),
    Document(DocumentPath),
}

impl TriggerTarget {
    /// The collection that owns the target (a collection owns itself).
    pub fn collection(&self) -> &CollectionPath {
        match self {
            TriggerTarget::Collection(path) => path,
            TriggerTarget::Document(path) => &path.collection,
        }
    }

    pub fn as_document(&self) -> Option<&DocumentPath> {
        match self {
            TriggerTarget::Document(path) => Some(path),
            TriggerTarget::Collection(_) => None,
        }
    }
}

impl fmt::Display for TriggerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerTarget::Collection(path) => write!(f, "collection {}", path),
            TriggerTarget::Document(path) => write!(f, "document {}", path),
        }
    }
}

/// What a hook is told about the operation it brackets.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub kind: OperationKind,
    /// The resource operated on; for move and copy, the source.
    pub target: TriggerTarget,
    /// Where a move or copy lands.
    pub destination: Option<TriggerTarget>,
    /// The document being overwritten, if any.
    pub replaces: Option<Document>,
    /// The document as it will exist after the operation; for a removal,
    /// the document being removed.
    pub document: Option<Document>,
}

impl TriggerEvent {
    pub fn new(kind: OperationKind, target: TriggerTarget) -> Self {
        Self {
            kind,
            target,
            destination: None,
            replaces: None,
            document: None,
        }
    }

    pub fn with_destination(mut self, destination: TriggerTarget) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn replacing(mut self, previous: Option<Document>) -> Self {
        self.replaces = previous;
        self
    }

    pub fn with_document(mut self, document: Document) -> Self {
        self.document = Some(document);
        self
    }

    /// Path whose current document the operation overwrites.
    pub fn overwritten(&self) -> Option<&DocumentPath> {
        self.replaces.as_ref()?;
        self.destination
            .as_ref()
            .unwrap_or(&self.target)
            .as_document()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Content, DocumentId, DocumentName};

    #[test]
    fn test_kind_serde_names() {
        let json = serde_json::to_string(&OperationKind::ALL).unwrap();
        assert_eq!(json, r#"["create","store","remove","move","copy","update"]"#);
    }

    #[test]
    fn test_overwritten_prefers_destination() {
        let src = DocumentPath::parse("/db/a/other.xml").unwrap();
        let dst = DocumentPath::parse("/db/a/hello.xml").unwrap();
        let old = Document::new(DocumentId(1), DocumentName::new("hello.xml").unwrap(), Content::xml("<h/>"));

        let event = TriggerEvent::new(OperationKind::Copy, TriggerTarget::Document(src.clone()))
            .with_destination(TriggerTarget::Document(dst.clone()));
        assert!(event.overwritten().is_none());

        let event = event.replacing(Some(old));
        assert_eq!(event.overwritten(), Some(&dst));
        assert_eq!(event.target.collection().as_str(), "/db/a");
    }
}
