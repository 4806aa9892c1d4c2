//! Secondary indexes kept in step with document mutations.
//!
//! Providers are told about every document added to or removed from the
//! tree, inside the mutating transaction. They stage those changes and only
//! publish them when the transaction commits, so a query never sees a
//! document whose transaction has not committed.

mod error;
mod fulltext;
mod staging;
mod structural;
pub mod xml;

pub use error::IndexError;
pub use fulltext::FullTextIndex;
pub use structural::StructuralIndex;

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::DbResult;
use crate::storage::{CollectionPath, CollectionTree, Document, DocumentId, DocumentPath, IndexConfig};
use crate::transaction::{TxnId, TxnParticipant};

/// One indexed element of one document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef {
    pub document: DocumentId,
    pub path: DocumentPath,
    /// element ordinal in document order
    pub node: u32,
}

/// What happened to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEvent {
    Added,
    Removed,
}

/// A pluggable index.
///
/// `observe` and `reconfigure` stage changes under `txn`; nothing they do is
/// visible to `query` until `commit(txn)`.
pub trait IndexProvider: Send + Sync {
    fn name(&self) -> &str;

    fn observe(
        &self,
        txn: TxnId,
        step: u64,
        collection: &CollectionPath,
        document: &Document,
        event: IndexEvent,
    ) -> Result<(), IndexError>;

    fn query(&self, expr: &str) -> Result<Vec<NodeRef>, IndexError>;

    /// Install (`Some`) or clear (`None`) the definition declared at `scope`.
    fn reconfigure(
        &self,
        txn: TxnId,
        step: u64,
        scope: &CollectionPath,
        config: Option<&IndexConfig>,
    ) -> Result<(), IndexError>;

    fn commit(&self, txn: TxnId);

    fn rollback(&self, txn: TxnId, from_step: u64);

    fn entry_count(&self) -> usize;

    fn document_count(&self) -> usize;
}

/// The registered providers, notified in registration order.
pub struct IndexSet {
    providers: Vec<Arc<dyn IndexProvider>>,
}

impl IndexSet {
    /// The built-in full-text and structural providers.
    pub fn new() -> Self {
        let fulltext: Arc<dyn IndexProvider> = Arc::new(FullTextIndex::new());
        let structural: Arc<dyn IndexProvider> = Arc::new(StructuralIndex::new());
        Self::with_providers(vec![fulltext, structural])
    }

    pub fn with_providers(providers: Vec<Arc<dyn IndexProvider>>) -> Self {
        Self { providers }
    }

    pub fn provider(&self, name: &str) -> Option<&Arc<dyn IndexProvider>> {
        self.providers.iter().find(|p| p.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn observe(
        &self,
        txn: TxnId,
        step: u64,
        collection: &CollectionPath,
        document: &Document,
        event: IndexEvent,
    ) -> Result<(), IndexError> {
        for provider in &self.providers {
            provider.observe(txn, step, collection, document, event)?;
        }
        Ok(())
    }

    pub fn reconfigure(
        &self,
        txn: TxnId,
        step: u64,
        scope: &CollectionPath,
        config: Option<&IndexConfig>,
    ) -> Result<(), IndexError> {
        for provider in &self.providers {
            provider.reconfigure(txn, step, scope, config)?;
        }
        Ok(())
    }

    /// Run `expr` against the named provider's committed entries.
    pub fn query(&self, provider: &str, expr: &str) -> Result<Vec<NodeRef>, IndexError> {
        self.provider(provider)
            .ok_or_else(|| IndexError::UnknownProvider(provider.to_string()))?
            .query(expr)
    }

    /// Load every rule and document of `tree` as already committed state.
    /// Used once at startup, before any transaction runs.
    pub fn rebuild(&self, tree: &CollectionTree) -> DbResult<()> {
        let txn = TxnId::BOOTSTRAP;
        let mut step = 1;

        let mut scoped = tree.subtree(&CollectionPath::root());
        scoped.retain(|path| tree.config(path).is_some());
        for scope in &scoped {
            let config = tree.config(scope);
            self.reconfigure(txn, step, scope, config.as_ref().map(|c| &c.index))?;
            step += 1;
        }
        // rules first, so documents see them
        self.commit(txn);

        let documents = tree.all_documents();
        for (collection, document) in &documents {
            self.observe(txn, step, collection, document, IndexEvent::Added)?;
            step += 1;
        }
        self.commit(txn);

        info!(
            scopes = scoped.len(),
            documents = documents.len(),
            "indexes rebuilt"
        );
        Ok(())
    }
}

impl Default for IndexSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IndexSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSet").field("providers", &self.names()).finish()
    }
}

impl TxnParticipant for IndexSet {
    fn name(&self) -> &str {
        "indexes"
    }

    fn commit(&self, txn: TxnId) {
        for provider in &self.providers {
            provider.commit(txn);
        }
    }

    fn rollback(&self, txn: TxnId, from_step: u64) {
        for provider in self.providers.iter().rev() {
            provider.rollback(txn, from_step);
        }
        debug!(%txn, from_step, "index changes rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CollectionConfig, Content, DocumentName, Permissions};

    #[test]
    fn test_unknown_provider() {
        let set = IndexSet::new();
        assert!(matches!(
            set.query("spatial", "x"),
            Err(IndexError::UnknownProvider(_))
        ));
        assert_eq!(set.names(), vec!["fulltext", "structural"]);
    }

    #[test]
    fn test_rebuild_from_tree() {
        let tree = CollectionTree::new();
        let tx = TxnId(1);
        let plays = CollectionPath::new("/db/plays").unwrap();
        tree.create_collection(tx, 1, &plays, Permissions::default()).unwrap();
        tree.set_config(
            tx,
            2,
            &plays,
            Some(CollectionConfig::default().with_fulltext(["LINE"]).with_structural(Vec::<String>::new())),
        )
        .unwrap();
        let doc = Document::new(
            tree.allocate_id(),
            DocumentName::new("r.xml").unwrap(),
            Content::xml("<PLAY><LINE>my kingdom</LINE></PLAY>"),
        );
        tree.put_document(tx, 3, &plays, doc).unwrap();
        TxnParticipant::commit(&tree, tx);

        let set = IndexSet::new();
        set.rebuild(&tree).unwrap();
        assert_eq!(set.query("fulltext", "LINE:kingdom").unwrap().len(), 1);
        assert_eq!(set.query("structural", "//LINE").unwrap().len(), 1);
    }

    #[test]
    fn test_rollback_reaches_every_provider() {
        let set = IndexSet::new();
        let scope = CollectionPath::new("/db/c").unwrap();
        let config = IndexConfig::default();
        set.reconfigure(TxnId(1), 1, &scope, Some(&config)).unwrap();
        let doc = Document::new(DocumentId(1), DocumentName::new("a.xml").unwrap(), Content::xml("<a/>"));
        set.observe(TxnId(1), 2, &scope, &doc, IndexEvent::Added).unwrap();

        TxnParticipant::rollback(&set, TxnId(1), 0);
        TxnParticipant::commit(&set, TxnId(1));
        for name in ["fulltext", "structural"] {
            assert_eq!(set.provider(name).unwrap().document_count(), 0);
        }
    }
}
