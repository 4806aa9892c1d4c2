//! Documents and their content handles.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::index::xml::{self, XmlError};
use crate::storage::types::{DocumentId, DocumentName};

/// Default mime type for XML documents.
pub const XML_MIME: &str = "application/xml";
/// Default mime type for binary documents.
pub const BINARY_MIME: &str = "application/octet-stream";

/// Document content. Cloning shares the underlying buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Content {
    Xml(Arc<str>),
    Binary(Arc<[u8]>),
}

impl Content {
    /// XML content from a string
    pub fn xml(text: impl Into<String>) -> Self {
        Content::Xml(Arc::from(text.into()))
    }

    /// binary content from raw bytes
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Content::Binary(Arc::from(bytes.into()))
    }

    /// the XML text, if this is XML content
    pub fn as_xml(&self) -> Option<&str> {
        match self {
            Content::Xml(text) => Some(&**text),
            Content::Binary(_) => None,
        }
    }

    /// raw bytes of the content
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Content::Xml(text) => text.as_bytes(),
            Content::Binary(bytes) => &bytes[..],
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_xml(&self) -> bool {
        matches!(self, Content::Xml(_))
    }

    /// mime type used when the caller does not supply one
    pub fn default_mime(&self) -> &'static str {
        match self {
            Content::Xml(_) => XML_MIME,
            Content::Binary(_) => BINARY_MIME,
        }
    }

    /// Check that XML content is well-formed. Binary content always passes.
    pub fn validate(&self) -> Result<(), XmlError> {
        match self {
            Content::Xml(text) => xml::scan(&**text).map(|_| ()),
            Content::Binary(_) => Ok(()),
        }
    }
}

/// A stored document, owned by exactly one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub name: DocumentName,
    pub mime: String,
    pub content: Content,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Incremented on every overwrite of the same name.
    pub version: u64,
}

impl Document {
    /// Create a fresh document with version 1.
    pub fn new(id: DocumentId, name: DocumentName, content: Content) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            mime: content.default_mime().to_string(),
            content,
            created: now,
            modified: now,
            version: 1,
        }
    }

    /// Set an explicit mime type.
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = mime.into();
        self
    }

    /// Carry creation stamp and version forward from the document this one replaces.
    pub(crate) fn succeeding(mut self, previous: &Document) -> Self {
        self.created = previous.created;
        self.version = previous.version + 1;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_kinds() {
        let xml = Content::xml("<a>text</a>");
        assert!(xml.is_xml());
        assert_eq!(xml.as_xml(), Some("<a>text</a>"));
        assert_eq!(xml.default_mime(), XML_MIME);

        let bin = Content::binary(vec![0u8, 1, 2]);
        assert!(!bin.is_xml());
        assert_eq!(bin.as_bytes(), &[0, 1, 2]);
        assert!(bin.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed_xml() {
        assert!(Content::xml("<a><b></a>").validate().is_err());
        assert!(Content::xml("<a/>").validate().is_ok());
    }

    #[test]
    fn test_succeeding_bumps_version() {
        let name = DocumentName::new("a.xml").unwrap();
        let first = Document::new(DocumentId(1), name.clone(), Content::xml("<a/>"));
        let second = Document::new(DocumentId(2), name, Content::xml("<b/>")).succeeding(&first);
        assert_eq!(second.version, 2);
        assert_eq!(second.created, first.created);
    }

    #[test]
    fn test_content_serde() {
        let content = Content::xml("<a/>");
        let json = serde_json::to_string(&content).unwrap();
        let back: Content = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
    }
}
