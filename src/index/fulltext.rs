//! Full-text index over the text of configured elements.
//!
//! Query syntax: `FIELD:term [term ...]` restricts matching to elements named
//! `FIELD`; bare `term [term ...]` matches any indexed element. All terms must
//! occur in the same element.

use std::collections::BTreeSet;

use crate::index::error::IndexError;
use crate::index::staging::IndexCore;
use crate::index::xml::{self, tokenize};
use crate::index::{IndexEvent, IndexProvider, NodeRef};
use crate::storage::{CollectionPath, Document, DocumentPath, FullTextDefinition, IndexConfig};
use crate::transaction::TxnId;

/// Posting key: a term, optionally qualified by the element it occurred in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TermKey {
    field: Option<String>,
    term: String,
}

pub struct FullTextIndex {
    core: IndexCore<TermKey, FullTextDefinition>,
}

impl FullTextIndex {
    pub const NAME: &'static str = "fulltext";

    pub fn new() -> Self {
        Self {
            core: IndexCore::new(Self::NAME),
        }
    }

    fn extract(
        &self,
        def: &FullTextDefinition,
        collection: &CollectionPath,
        document: &Document,
    ) -> Result<Vec<(TermKey, NodeRef)>, IndexError> {
        let Some(text) = document.content.as_xml() else {
            return Ok(Vec::new());
        };
        let elements = xml::scan(text)
            .map_err(|e| IndexError::inconsistency(Self::NAME, format!("{}: {}", document.name, e)))?;
        let path = DocumentPath::new(collection.clone(), document.name.clone());

        let mut entries = Vec::new();
        for element in elements.iter().filter(|e| def.fields.contains(&e.name)) {
            let node = NodeRef {
                document: document.id,
                path: path.clone(),
                node: element.ordinal,
            };
            let terms: BTreeSet<String> = tokenize(&element.text).collect();
            for term in terms {
                entries.push((
                    TermKey {
                        field: Some(element.name.clone()),
                        term: term.clone(),
                    },
                    node.clone(),
                ));
                entries.push((TermKey { field: None, term }, node.clone()));
            }
        }
        Ok(entries)
    }
}

impl Default for FullTextIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexProvider for FullTextIndex {
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
        let (field, terms) = match expr.split_once(':') {
            Some((field, rest)) if !field.is_empty() && !field.contains(char::is_whitespace) => {
                (Some(field.to_string()), rest)
            }
            _ => (None, expr),
        };

        let terms: Vec<String> = tokenize(terms).collect();
        if terms.is_empty() {
            return Err(IndexError::Query(format!("no search terms in '{}'", expr)));
        }

        let mut result: Option<BTreeSet<NodeRef>> = None;
        for term in terms {
            let nodes = self.core.lookup(&TermKey {
                field: field.clone(),
                term,
            });
            result = Some(match result {
                None => nodes,
                Some(acc) => acc.intersection(&nodes).cloned().collect(),
            });
        }
        Ok(result.unwrap_or_default().into_iter().collect())
    }

    fn reconfigure(
        &self,
        txn: TxnId,
        step: u64,
        scope: &CollectionPath,
        config: Option<&IndexConfig>,
    ) -> Result<(), IndexError> {
        let rule = config.map(|c| c.fulltext.clone());
        self.core.stage_rule(txn, step, scope, rule);
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

    fn setup() -> (FullTextIndex, CollectionPath) {
        let index = FullTextIndex::new();
        let scope = CollectionPath::new("/db/plays").unwrap();
        let config = IndexConfig {
            fulltext: Some(FullTextDefinition {
                fields: vec!["LINE".to_string(), "SPEAKER".to_string()],
            }),
            structural: None,
        };
        index.reconfigure(TxnId(1), 1, &scope, Some(&config)).unwrap();
        index.commit(TxnId(1));
        (index, scope)
    }

    fn doc(id: u64, xml: &str) -> Document {
        Document::new(DocumentId(id), DocumentName::new(format!("d{}.xml", id)).unwrap(), Content::xml(xml))
    }

    #[test]
    fn test_field_queries() {
        let (index, scope) = setup();
        let d = doc(
            1,
            "<SPEECH><SPEAKER>JULIET</SPEAKER><LINE>Where is my king</LINE><LINE>the King sleeps</LINE><STAGEDIR>king enters</STAGEDIR></SPEECH>",
        );
        index.observe(TxnId(2), 1, &scope, &d, IndexEvent::Added).unwrap();
        assert!(index.query("LINE:king").unwrap().is_empty());
        index.commit(TxnId(2));

        assert_eq!(index.query("LINE:king").unwrap().len(), 2);
        assert_eq!(index.query("SPEAKER:juliet").unwrap().len(), 1);
        assert_eq!(index.query("LINE:king sleeps").unwrap().len(), 1);
        assert_eq!(index.query("juliet").unwrap().len(), 1);
        // STAGEDIR is not a configured field
        assert_eq!(index.query("king").unwrap().len(), 2);
        assert!(index.query("LINE:").is_err());
    }

    #[test]
    fn test_outside_scope_not_indexed() {
        let (index, _scope) = setup();
        let elsewhere = CollectionPath::new("/db/other").unwrap();
        index
            .observe(TxnId(2), 1, &elsewhere, &doc(1, "<LINE>king</LINE>"), IndexEvent::Added)
            .unwrap();
        index.commit(TxnId(2));
        assert!(index.query("king").unwrap().is_empty());
        assert_eq!(index.document_count(), 1);
    }

    #[test]
    fn test_remove_hides_document() {
        let (index, scope) = setup();
        let d = doc(1, "<LINE>king</LINE>");
        index.observe(TxnId(2), 1, &scope, &d, IndexEvent::Added).unwrap();
        index.commit(TxnId(2));

        index.observe(TxnId(3), 1, &scope, &d, IndexEvent::Removed).unwrap();
        assert_eq!(index.query("LINE:king").unwrap().len(), 1);
        index.commit(TxnId(3));
        assert!(index.query("LINE:king").unwrap().is_empty());
        assert_eq!(index.entry_count(), 0);
    }
}
