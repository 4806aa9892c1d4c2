//! Structural index: element paths to the nodes that sit at them.
//!
//! `/PLAY/ACT/SCENE` looks up one absolute path, `//SPEECH` every element
//! named `SPEECH` wherever it occurs.

use crate::index::error::IndexError;
use crate::index::staging::IndexCore;
use crate::index::xml;
use crate::index::{IndexEvent, IndexProvider, NodeRef};
use crate::storage::{CollectionPath, Document, DocumentPath, IndexConfig, StructuralDefinition};
use crate::transaction::TxnId;

pub struct StructuralIndex {
    core: IndexCore<String, StructuralDefinition>,
}

/// Whether `def` covers the element at `path`. No paths means everything.
fn covers(def: &StructuralDefinition, path: &str) -> bool {
    def.paths.is_empty()
        || def.paths.iter().any(|prefix| {
            path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .map_or(false, |rest| rest.starts_with('/'))
        })
}

impl StructuralIndex {
    pub const NAME: &'static str = "structural";

    pub fn new() -> Self {
        Self {
            core: IndexCore::new(Self::NAME),
        }
    }

    fn extract(
        &self,
        def: &StructuralDefinition,
        collection: &CollectionPath,
        document: &Document,
    ) -> Result<Vec<(String, NodeRef)>, IndexError> {
        let Some(text) = document.content.as_xml() else {
            return Ok(Vec::new());
        };
        let elements = xml::scan(text)
            .map_err(|e| IndexError::inconsistency(Self::NAME, format!("{}: {}", document.name, e)))?;
        let path = DocumentPath::new(collection.clone(), document.name.clone());

        Ok(elements
            .into_iter()
            .filter(|e| covers(def, &e.path))
            .map(|e| {
                let node = NodeRef {
                    document: document.id,
                    path: path.clone(),
                    node: e.ordinal,
                };
                (e.path, node)
            })
            .collect())
    }
}

impl Default for StructuralIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexProvider for StructuralIndex {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn observe(
        &self,
        txn: TxnId,
        step: u64,
        collection: &CollectionPath,
        document: &Document,
        event: IndexEvent,
    ) -> Result<(), IndexError> {
        match event {
            IndexEvent::Added => {
                let entries = match self.core.rule_for(txn, collection) {
                    Some(def) => self.extract(&def, collection, document)?,
                    None => Vec::new(),
                };
                self.core.stage_add(txn, step, document.id, entries)
            }
            IndexEvent::Removed => self.core.stage_remove(txn, step, document.id),
        }
    }

    fn query(&self, expr: &str) -> Result<Vec<NodeRef>, IndexError> {
        let expr = expr.trim();
        let nodes = if let Some(name) = expr.strip_prefix("//") {
            if name.is_empty() || name.contains('/') {
                return Err(IndexError::Query(format!("bad descendant step '{}'", expr)));
            }
            let suffix = format!("/{}", name);
            self.core.lookup_where(|path| path.ends_with(&suffix))
        } else if expr.starts_with('/') && expr.len() > 1 && !expr.ends_with('/') {
            self.core.lookup(&expr.to_string())
        } else {
            return Err(IndexError::Query(format!(
                "expected '/path/to/element' or '//element', got '{}'",
                expr
            )));
        };
        Ok(nodes.into_iter().collect())
    }

    fn reconfigure(
        &self,
        txn: TxnId,
        step: u64,
        scope: &CollectionPath,
        config: Option<&IndexConfig>,
    ) -> Result<(), IndexError> {
        self.core
            .stage_rule(txn, step, scope, config.map(|c| c.structural.clone()));
        Ok(())
    }

    fn commit(&self, txn: TxnId) {
        self.core.commit(txn);
    }

    fn rollback(&self, txn: TxnId, from_step: u64) {
        self.core.rollback(txn, from_step);
    }

    fn entry_count(&self) -> usize {
        self.core.entry_count()
    }

    fn document_count(&self) -> usize {
        self.core.document_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Content, DocumentId, DocumentName};

    const PLAY: &str = "<PLAY><ACT><SCENE><SPEECH><LINE>a</LINE></SPEECH><SPEECH><LINE>b</LINE></SPEECH></SCENE></ACT><PERSONAE/></PLAY>";

    fn indexed(paths: &[&str]) -> StructuralIndex {
        let index = StructuralIndex::new();
        let scope = CollectionPath::new("/db/plays").unwrap();
        let config = IndexConfig {
            fulltext: None,
            structural: Some(StructuralDefinition {
                paths: paths.iter().map(|p| p.to_string()).collect(),
            }),
        };
        index.reconfigure(TxnId(1), 1, &scope, Some(&config)).unwrap();
        let doc = Document::new(DocumentId(7), DocumentName::new("r.xml").unwrap(), Content::xml(PLAY));
        index.observe(TxnId(1), 2, &scope, &doc, IndexEvent::Added).unwrap();
        index.commit(TxnId(1));
        index
    }

    #[test]
    fn test_absolute_and_descendant_queries() {
        let index = indexed(&[]);
        assert_eq!(index.query("/PLAY/ACT/SCENE/SPEECH").unwrap().len(), 2);
        assert_eq!(index.query("//LINE").unwrap().len(), 2);
        assert_eq!(index.query("/PLAY").unwrap().len(), 1);
        assert!(index.query("/PLAY/NOPE").unwrap().is_empty());
        // element names match whole steps only
        assert!(index.query("//INE").unwrap().is_empty());
    }

    #[test]
    fn test_configured_prefixes_limit_entries() {
        let index = indexed(&["/PLAY/ACT/SCENE/SPEECH"]);
        assert_eq!(index.query("//SPEECH").unwrap().len(), 2);
        assert_eq!(index.query("//LINE").unwrap().len(), 2);
        assert!(index.query("/PLAY").unwrap().is_empty());
        assert!(index.query("//PERSONAE").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_queries() {
        let index = indexed(&[]);
        for bad in ["", "PLAY", "/", "//", "//A/B", "/PLAY/"] {
            assert!(matches!(index.query(bad), Err(IndexError::Query(_))), "{}", bad);
        }
    }
}
