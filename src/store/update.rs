//! Update deltas.
//!
//! A delta is a list of edits applied as one atomic store operation. Each
//! edit becomes an ordinary store or remove, so triggers and index
//! providers see the individual document changes, never the delta itself.

use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::index::xml;
use crate::lock::{LockMode, LockTarget};
use crate::storage::{Content, DocumentPath};
use crate::store::engine::CollectionStore;
use crate::transaction::Transaction;
use crate::trigger::OperationKind;

/// One edit of an [`UpdateDelta`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOp {
    /// Add a new document; fails if the name is taken.
    Insert { path: DocumentPath, content: Content },
    /// Replace the content of an existing document.
    Replace { path: DocumentPath, content: Content },
    Remove { path: DocumentPath },
    /// Cut every `element` whose text contains `containing` (every one if
    /// `None`) out of an XML document.
    RemoveElements {
        path: DocumentPath,
        element: String,
        containing: Option<String>,
    },
}

impl UpdateOp {
    pub fn path(&self) -> &DocumentPath {
        match self {
            UpdateOp::Insert { path, .. }
            | UpdateOp::Replace { path, .. }
            | UpdateOp::Remove { path }
            | UpdateOp::RemoveElements { path, .. } => path,
        }
    }
}

/// Ordered list of edits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateDelta {
    ops: Vec<UpdateOp>,
}

impl UpdateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, path: DocumentPath, content: Content) -> Self {
        self.ops.push(UpdateOp::Insert { path, content });
        self
    }

    pub fn replace(mut self, path: DocumentPath, content: Content) -> Self {
        self.ops.push(UpdateOp::Replace { path, content });
        self
    }

    pub fn remove(mut self, path: DocumentPath) -> Self {
        self.ops.push(UpdateOp::Remove { path });
        self
    }

    pub fn remove_elements(mut self, path: DocumentPath, element: impl Into<String>, containing: Option<&str>) -> Self {
        self.ops.push(UpdateOp::RemoveElements {
            path,
            element: element.into(),
            containing: containing.map(str::to_string),
        });
        self
    }

    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// What an applied delta changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub removed: usize,
    /// elements cut by `RemoveElements` edits
    pub elements_removed: usize,
}

impl CollectionStore {
    /// Apply `delta` atomically: if any edit fails, none of them stays.
    pub fn update(&self, tx: &mut Transaction, delta: &UpdateDelta) -> DbResult<UpdateSummary> {
        self.atomically(tx, |tx| {
            // every edit writes its collection; taking it up front avoids a
            // READ to WRITE upgrade after `Replace` has read the document
            tx.lock_all(delta.ops.iter().flat_map(|op| {
                let path = op.path();
                [
                    (LockTarget::collection(&path.collection), LockMode::Write),
                    (LockTarget::document(path), LockMode::Write),
                ]
            }))?;
            let mut summary = UpdateSummary::default();
            for op in &delta.ops {
                self.apply_op(tx, op, &mut summary)?;
            }
            debug!(txn = %tx.id(), ops = delta.ops.len(), ?summary, "update applied");
            Ok(summary)
        })
    }

    fn apply_op(&self, tx: &mut Transaction, op: &UpdateOp, summary: &mut UpdateSummary) -> DbResult<()> {
        match op {
            UpdateOp::Insert { path, content } => {
                if self.tree().has_document(path) {
                    return Err(DbError::invalid_state(format!("document {} already exists", path)));
                }
                let mime = content.default_mime();
                self.put(tx, &path.collection, &path.name, content.clone(), mime, OperationKind::Store)?;
                summary.inserted += 1;
            }
            UpdateOp::Replace { path, content } => {
                let current = self.document(tx, path)?;
                let mime = if content.is_xml() == current.content.is_xml() {
                    current.mime
                } else {
                    content.default_mime().to_string()
                };
                self.put(tx, &path.collection, &path.name, content.clone(), &mime, OperationKind::Update)?;
                summary.replaced += 1;
            }
            UpdateOp::Remove { path } => {
                self.drop_document(tx, path)?;
                summary.removed += 1;
            }
            UpdateOp::RemoveElements {
                path,
                element,
                containing,
            } => {
                let current = self.document(tx, path)?;
                let text = current
                    .content
                    .as_xml()
                    .ok_or_else(|| DbError::invalid_state(format!("{} is not an XML document", path)))?;
                let (edited, count) = xml::remove_elements(text, element, containing.as_deref())?;
                if count > 0 {
                    self.put(
                        tx,
                        &path.collection,
                        &path.name,
                        Content::xml(edited),
                        &current.mime,
                        OperationKind::Update,
                    )?;
                    summary.replaced += 1;
                    summary.elements_removed += count;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::Harness;
    use crate::storage::CollectionPath;

    fn doc(path: &str) -> DocumentPath {
        DocumentPath::parse(path).unwrap()
    }

    #[test]
    fn test_delta_applies_every_edit() {
        let h = Harness::new();
        h.mkcol("/db/u");
        h.put("/db/u/a.xml", "<a><item>keep</item><item>drop me</item></a>");
        h.put("/db/u/b.xml", "<b/>");

        let delta = UpdateDelta::new()
            .insert(doc("/db/u/c.xml"), Content::xml("<c/>"))
            .replace(doc("/db/u/b.xml"), Content::xml("<b>2</b>"))
            .remove_elements(doc("/db/u/a.xml"), "item", Some("drop"));

        let summary = h.run(|tx| h.store.update(tx, &delta)).unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.replaced, 2);
        assert_eq!(summary.elements_removed, 1);

        assert_eq!(h.content("/db/u/a.xml"), "<a><item>keep</item></a>");
        assert_eq!(h.content("/db/u/b.xml"), "<b>2</b>");
        assert_eq!(h.content("/db/u/c.xml"), "<c/>");
    }

    #[test]
    fn test_failing_edit_undoes_the_whole_delta() {
        let h = Harness::new();
        h.mkcol("/db/u");
        h.put("/db/u/a.xml", "<a/>");

        let delta = UpdateDelta::new()
            .replace(doc("/db/u/a.xml"), Content::xml("<a>changed</a>"))
            .remove(doc("/db/u/missing.xml"));

        let mut tx = h.manager.begin().unwrap();
        let err = h.store.update(&mut tx, &delta).unwrap_err();
        assert!(err.is_not_found());
        assert!(tx.is_active());
        tx.commit().unwrap();

        assert_eq!(h.content("/db/u/a.xml"), "<a/>");
    }

    #[test]
    fn test_insert_refuses_existing_document() {
        let h = Harness::new();
        h.mkcol("/db/u");
        h.put("/db/u/a.xml", "<a/>");

        let delta = UpdateDelta::new().insert(doc("/db/u/a.xml"), Content::xml("<x/>"));
        let err = h.run(|tx| h.store.update(tx, &delta)).unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
        assert!(h.store.collection_exists(&CollectionPath::new("/db/u").unwrap()).unwrap());
    }

    #[test]
    fn test_removing_the_root_element_is_invalid_content() {
        let h = Harness::new();
        h.mkcol("/db/u");
        h.put("/db/u/a.xml", "<a/>");

        let delta = UpdateDelta::new().remove_elements(doc("/db/u/a.xml"), "a", None);
        let err = h.run(|tx| h.store.update(tx, &delta)).unwrap_err();
        assert!(matches!(err, DbError::InvalidContent(_)));
    }
}
