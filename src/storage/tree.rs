//! the in-memory collection tree.
//!
//! every collection is a node keyed by its path; a node knows the names of its
//! children and owns its documents. the parent of a node is found by looking
//! up `path.parent()`, never through a stored link.
//!
//! mutations are applied in place by a transaction that holds the WRITE locks
//! covering them, and each one pushes an undo entry tagged with the step that
//! made it. the tree is a transaction participant: commit forgets the undo
//! entries, rollback replays them backwards.
//!
//! the map itself sits behind a short-lived latch. it serializes individual
//! map edits only; isolation between transactions comes from the lock manager.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::journal::JournalRecord;
use crate::storage::config::CollectionConfig;
use crate::storage::document::Document;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::permission::Permissions;
use crate::storage::types::{CollectionPath, DocumentId, DocumentName, DocumentPath};
use crate::transaction::{TxnId, TxnParticipant};

/// One collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionNode {
    pub path: CollectionPath,
    pub permissions: Permissions,
    /// names of child collections, ordered
    pub children: BTreeSet<String>,
    pub documents: BTreeMap<DocumentName, Document>,
    pub config: Option<CollectionConfig>,
    pub created: DateTime<Utc>,
}

impl CollectionNode {
    pub fn new(path: CollectionPath, permissions: Permissions) -> Self {
        Self {
            path,
            permissions,
            children: BTreeSet::new(),
            documents: BTreeMap::new(),
            config: None,
            created: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.documents.is_empty()
    }
}

/// serializable image of the whole tree, written by checkpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub collections: Vec<CollectionNode>,
    pub next_document_id: u64,
}

/// inverse of one staged change
#[derive(Debug, Clone)]
enum Undo {
    Created(CollectionPath),
    Removed(CollectionNode),
    Put {
        collection: CollectionPath,
        name: DocumentName,
        previous: Option<Document>,
    },
    Taken {
        collection: CollectionPath,
        document: Document,
    },
    Configured {
        path: CollectionPath,
        previous: Option<CollectionConfig>,
    },
    Moved {
        from: CollectionPath,
        to: CollectionPath,
    },
}

type NodeMap = BTreeMap<CollectionPath, CollectionNode>;

/// The collection tree, rooted at `/db`.
pub struct CollectionTree {
    nodes: RwLock<NodeMap>,
    next_document_id: AtomicU64,
    undo: Mutex<HashMap<TxnId, Vec<(u64, Undo)>>>,
}

impl CollectionTree {
    /// a tree holding only the root collection
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        let root = CollectionPath::root();
        nodes.insert(root.clone(), CollectionNode::new(root, Permissions::default()));

        Self {
            nodes: RwLock::new(nodes),
            next_document_id: AtomicU64::new(1),
            undo: Mutex::new(HashMap::new()),
        }
    }

    /// rebuild a tree from a checkpoint image
    pub fn from_snapshot(snapshot: TreeSnapshot) -> Self {
        let tree = Self::new();
        {
            let mut nodes = tree.nodes.write();
            for node in snapshot.collections {
                nodes.insert(node.path.clone(), node);
            }
        }
        tree.next_document_id
            .store(snapshot.next_document_id.max(1), Ordering::SeqCst);
        tree
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            collections: self.nodes.read().values().cloned().collect(),
            next_document_id: self.next_document_id.load(Ordering::SeqCst),
        }
    }

    /// allocate a fresh document id
    pub fn allocate_id(&self) -> DocumentId {
        DocumentId(self.next_document_id.fetch_add(1, Ordering::SeqCst))
    }

    // ==================== Reads ====================

    pub fn exists(&self, path: &CollectionPath) -> bool {
        self.nodes.read().contains_key(path)
    }

    pub fn document(&self, collection: &CollectionPath, name: &DocumentName) -> Option<Document> {
        self.nodes
            .read()
            .get(collection)
            .and_then(|node| node.documents.get(name).cloned())
    }

    pub fn has_document(&self, path: &DocumentPath) -> bool {
        self.nodes
            .read()
            .get(&path.collection)
            .map_or(false, |node| node.documents.contains_key(&path.name))
    }

    /// documents of one collection, ordered by name
    pub fn documents(&self, collection: &CollectionPath) -> Option<Vec<Document>> {
        self.nodes
            .read()
            .get(collection)
            .map(|node| node.documents.values().cloned().collect())
    }

    pub fn child_names(&self, collection: &CollectionPath) -> Option<Vec<String>> {
        self.nodes
            .read()
            .get(collection)
            .map(|node| node.children.iter().cloned().collect())
    }

    pub fn permissions(&self, path: &CollectionPath) -> Option<Permissions> {
        self.nodes.read().get(path).map(|node| node.permissions.clone())
    }

    pub fn config(&self, path: &CollectionPath) -> Option<CollectionConfig> {
        self.nodes.read().get(path).and_then(|node| node.config.clone())
    }

    /// configurations declared on `path` and its ancestors, root first
    pub fn configs_along(&self, path: &CollectionPath) -> Vec<(CollectionPath, CollectionConfig)> {
        let nodes = self.nodes.read();
        path.lineage()
            .into_iter()
            .filter_map(|p| {
                let config = nodes.get(&p)?.config.clone()?;
                Some((p, config))
            })
            .collect()
    }

    /// `root` and every collection below it, parents before children
    pub fn subtree(&self, root: &CollectionPath) -> Vec<CollectionPath> {
        self.nodes
            .read()
            .range(root.clone()..)
            .map(|(path, _)| path)
            .take_while(|path| path.is_within(root))
            .cloned()
            .collect()
    }

    /// every stored document with its collection
    pub fn all_documents(&self) -> Vec<(CollectionPath, Document)> {
        self.nodes
            .read()
            .values()
            .flat_map(|node| {
                node.documents
                    .values()
                    .map(move |doc| (node.path.clone(), doc.clone()))
            })
            .collect()
    }

    pub fn collection_count(&self) -> usize {
        self.nodes.read().len()
    }

    // ==================== Staged mutations ====================

    pub fn create_collection(
        &self,
        txn: TxnId,
        step: u64,
        path: &CollectionPath,
        permissions: Permissions,
    ) -> StorageResult<()> {
        raw_create(&mut self.nodes.write(), path, permissions)?;
        self.push_undo(txn, step, Undo::Created(path.clone()));
        Ok(())
    }

    /// remove an empty collection
    pub fn remove_collection(&self, txn: TxnId, step: u64, path: &CollectionPath) -> StorageResult<()> {
        let node = raw_remove(&mut self.nodes.write(), path)?;
        self.push_undo(txn, step, Undo::Removed(node));
        Ok(())
    }

    /// store a document, returning the one it replaced
    pub fn put_document(
        &self,
        txn: TxnId,
        step: u64,
        collection: &CollectionPath,
        document: Document,
    ) -> StorageResult<Option<Document>> {
        let name = document.name.clone();
        let previous = raw_put(&mut self.nodes.write(), collection, document)?;
        self.push_undo(
            txn,
            step,
            Undo::Put {
                collection: collection.clone(),
                name,
                previous: previous.clone(),
            },
        );
        Ok(previous)
    }

    pub fn take_document(
        &self,
        txn: TxnId,
        step: u64,
        collection: &CollectionPath,
        name: &DocumentName,
    ) -> StorageResult<Document> {
        let document = raw_take(&mut self.nodes.write(), collection, name)?;
        self.push_undo(
            txn,
            step,
            Undo::Taken {
                collection: collection.clone(),
                document: document.clone(),
            },
        );
        Ok(document)
    }

    pub fn set_config(
        &self,
        txn: TxnId,
        step: u64,
        path: &CollectionPath,
        config: Option<CollectionConfig>,
    ) -> StorageResult<Option<CollectionConfig>> {
        let previous = raw_configure(&mut self.nodes.write(), path, config)?;
        self.push_undo(
            txn,
            step,
            Undo::Configured {
                path: path.clone(),
                previous: previous.clone(),
            },
        );
        Ok(previous)
    }

    /// relocate the subtree at `from` so that it is rooted at `to`
    pub fn move_collection(
        &self,
        txn: TxnId,
        step: u64,
        from: &CollectionPath,
        to: &CollectionPath,
    ) -> StorageResult<()> {
        raw_move(&mut self.nodes.write(), from, to)?;
        self.push_undo(
            txn,
            step,
            Undo::Moved {
                from: from.clone(),
                to: to.clone(),
            },
        );
        Ok(())
    }

    fn push_undo(&self, txn: TxnId, step: u64, undo: Undo) {
        self.undo.lock().entry(txn).or_default().push((step, undo));
    }

    // ==================== Recovery ====================

    /// Replay one committed journal record.
    pub fn apply(&self, record: &JournalRecord) -> DbResult<()> {
        let mut nodes = self.nodes.write();
        match record {
            JournalRecord::CreateCollection { path, permissions } => {
                raw_create(&mut nodes, path, permissions.clone())?;
            }
            JournalRecord::RemoveCollection { path } => {
                raw_remove(&mut nodes, path)?;
            }
            JournalRecord::StoreDocument { collection, document } => {
                self.next_document_id
                    .fetch_max(document.id.get() + 1, Ordering::SeqCst);
                raw_put(&mut nodes, collection, document.clone())?;
            }
            JournalRecord::RemoveDocument { collection, name } => {
                raw_take(&mut nodes, collection, name)?;
            }
            JournalRecord::MoveCollection { from, to } => {
                raw_move(&mut nodes, from, to)?;
            }
            JournalRecord::Configure { path, config } => {
                raw_configure(&mut nodes, path, config.clone())?;
            }
            other => {
                return Err(DbError::invalid_state(format!(
                    "not a structural record: {:?}",
                    other
                )))
            }
        }
        Ok(())
    }
}

impl Default for CollectionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CollectionTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionTree")
            .field("collections", &self.collection_count())
            .finish()
    }
}

impl TxnParticipant for CollectionTree {
    fn name(&self) -> &str {
        "collection-tree"
    }

    fn commit(&self, txn: TxnId) {
        self.undo.lock().remove(&txn);
    }

    fn rollback(&self, txn: TxnId, from_step: u64) {
        let undone: Vec<Undo> = {
            let mut undo = self.undo.lock();
            let Some(entries) = undo.get_mut(&txn) else {
                return;
            };
            let keep = entries.partition_point(|(step, _)| *step < from_step);
            let tail = entries.split_off(keep);
            if entries.is_empty() {
                undo.remove(&txn);
            }
            tail.into_iter().rev().map(|(_, u)| u).collect()
        };

        let mut nodes = self.nodes.write();
        let count = undone.len();
        for entry in undone {
            revert(&mut nodes, entry);
        }
        debug!(%txn, from_step, count, "collection tree changes rolled back");
    }
}

fn revert(nodes: &mut NodeMap, entry: Undo) {
    // every inverse undoes a change that succeeded, so it cannot fail
    match entry {
        Undo::Created(path) => {
            nodes.remove(&path);
            detach(nodes, &path);
        }
        Undo::Removed(node) => {
            attach(nodes, &node.path);
            nodes.insert(node.path.clone(), node);
        }
        Undo::Put {
            collection,
            name,
            previous,
        } => {
            if let Some(node) = nodes.get_mut(&collection) {
                match previous {
                    Some(doc) => {
                        node.documents.insert(name, doc);
                    }
                    None => {
                        node.documents.remove(&name);
                    }
                }
            }
        }
        Undo::Taken { collection, document } => {
            if let Some(node) = nodes.get_mut(&collection) {
                node.documents.insert(document.name.clone(), document);
            }
        }
        Undo::Configured { path, previous } => {
            if let Some(node) = nodes.get_mut(&path) {
                node.config = previous;
            }
        }
        Undo::Moved { from, to } => {
            let _ = raw_move(nodes, &to, &from);
        }
    }
}

fn attach(nodes: &mut NodeMap, path: &CollectionPath) {
    if let Some(parent) = path.parent().and_then(|p| nodes.get_mut(&p)) {
        parent.children.insert(path.name().to_string());
    }
}

fn detach(nodes: &mut NodeMap, path: &CollectionPath) {
    if let Some(parent) = path.parent().and_then(|p| nodes.get_mut(&p)) {
        parent.children.remove(path.name());
    }
}

fn raw_create(nodes: &mut NodeMap, path: &CollectionPath, permissions: Permissions) -> StorageResult<()> {
    if nodes.contains_key(path) {
        return Err(StorageError::CollectionExists(path.clone()));
    }
    let parent = path.parent().ok_or(StorageError::RootCollection)?;
    if !nodes.contains_key(&parent) {
        return Err(StorageError::CollectionNotFound(parent));
    }
    attach(nodes, path);
    nodes.insert(path.clone(), CollectionNode::new(path.clone(), permissions));
    Ok(())
}

fn raw_remove(nodes: &mut NodeMap, path: &CollectionPath) -> StorageResult<CollectionNode> {
    if path.is_root() {
        return Err(StorageError::RootCollection);
    }
    match nodes.get(path) {
        None => return Err(StorageError::CollectionNotFound(path.clone())),
        Some(node) if !node.is_empty() => return Err(StorageError::NotEmpty(path.clone())),
        Some(_) => {}
    }
    detach(nodes, path);
    nodes
        .remove(path)
        .ok_or_else(|| StorageError::CollectionNotFound(path.clone()))
}

fn raw_put(nodes: &mut NodeMap, collection: &CollectionPath, document: Document) -> StorageResult<Option<Document>> {
    let node = nodes
        .get_mut(collection)
        .ok_or_else(|| StorageError::CollectionNotFound(collection.clone()))?;
    Ok(node.documents.insert(document.name.clone(), document))
}

fn raw_take(nodes: &mut NodeMap, collection: &CollectionPath, name: &DocumentName) -> StorageResult<Document> {
    let node = nodes
        .get_mut(collection)
        .ok_or_else(|| StorageError::CollectionNotFound(collection.clone()))?;
    node.documents
        .remove(name)
        .ok_or_else(|| StorageError::DocumentNotFound(DocumentPath::new(collection.clone(), name.clone())))
}

fn raw_configure(
    nodes: &mut NodeMap,
    path: &CollectionPath,
    config: Option<CollectionConfig>,
) -> StorageResult<Option<CollectionConfig>> {
    let node = nodes
        .get_mut(path)
        .ok_or_else(|| StorageError::CollectionNotFound(path.clone()))?;
    Ok(std::mem::replace(&mut node.config, config))
}

fn raw_move(nodes: &mut NodeMap, from: &CollectionPath, to: &CollectionPath) -> StorageResult<()> {
    if from.is_root() {
        return Err(StorageError::RootCollection);
    }
    if to.is_within(from) {
        return Err(StorageError::MoveIntoSelf {
            from: from.clone(),
            to: to.clone(),
        });
    }
    if !nodes.contains_key(from) {
        return Err(StorageError::CollectionNotFound(from.clone()));
    }
    if nodes.contains_key(to) {
        return Err(StorageError::CollectionExists(to.clone()));
    }
    let parent = to.parent().ok_or(StorageError::RootCollection)?;
    if !nodes.contains_key(&parent) {
        return Err(StorageError::CollectionNotFound(parent));
    }

    let paths: Vec<CollectionPath> = nodes
        .range(from.clone()..)
        .map(|(path, _)| path)
        .take_while(|path| path.is_within(from))
        .cloned()
        .collect();

    detach(nodes, from);
    for path in paths {
        if let (Some(mut node), Some(rebased)) = (nodes.remove(&path), path.rebase(from, to)) {
            node.path = rebased.clone();
            nodes.insert(rebased, node);
        }
    }
    attach(nodes, to);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::document::Content;

    const TX: TxnId = TxnId(1);

    fn path(p: &str) -> CollectionPath {
        CollectionPath::new(p).unwrap()
    }

    fn doc(tree: &CollectionTree, name: &str, xml: &str) -> Document {
        Document::new(tree.allocate_id(), DocumentName::new(name).unwrap(), Content::xml(xml))
    }

    #[test]
    fn test_create_requires_parent() {
        let tree = CollectionTree::new();
        let err = tree
            .create_collection(TX, 1, &path("/db/a/b"), Permissions::default())
            .unwrap_err();
        assert!(err.is_not_found());

        tree.create_collection(TX, 1, &path("/db/a"), Permissions::default()).unwrap();
        tree.create_collection(TX, 2, &path("/db/a/b"), Permissions::default()).unwrap();
        assert_eq!(tree.child_names(&path("/db")).unwrap(), vec!["a"]);
        assert_eq!(tree.child_names(&path("/db/a")).unwrap(), vec!["b"]);
        assert!(tree
            .create_collection(TX, 3, &path("/db/a"), Permissions::default())
            .unwrap_err()
            .is_conflict());
    }

    #[test]
    fn test_remove_requires_empty() {
        let tree = CollectionTree::new();
        tree.create_collection(TX, 1, &path("/db/a"), Permissions::default()).unwrap();
        let d = doc(&tree, "x.xml", "<x/>");
        tree.put_document(TX, 2, &path("/db/a"), d).unwrap();

        assert!(matches!(
            tree.remove_collection(TX, 3, &path("/db/a")),
            Err(StorageError::NotEmpty(_))
        ));
        assert!(matches!(
            tree.remove_collection(TX, 3, &CollectionPath::root()),
            Err(StorageError::RootCollection)
        ));
    }

    #[test]
    fn test_rollback_restores_previous_state() {
        let tree = CollectionTree::new();
        tree.create_collection(TX, 1, &path("/db/a"), Permissions::default()).unwrap();
        let original = doc(&tree, "x.xml", "<x>1</x>");
        tree.put_document(TX, 2, &path("/db/a"), original.clone()).unwrap();
        tree.commit(TX);

        let tx2 = TxnId(2);
        let name = DocumentName::new("x.xml").unwrap();
        tree.put_document(tx2, 1, &path("/db/a"), doc(&tree, "x.xml", "<x>2</x>")).unwrap();
        tree.create_collection(tx2, 2, &path("/db/a/b"), Permissions::default()).unwrap();
        tree.take_document(tx2, 3, &path("/db/a"), &name).unwrap();

        tree.rollback(tx2, 0);
        assert_eq!(tree.document(&path("/db/a"), &name), Some(original));
        assert!(!tree.exists(&path("/db/a/b")));
        assert!(tree.child_names(&path("/db/a")).unwrap().is_empty());
    }

    #[test]
    fn test_partial_rollback_keeps_earlier_steps() {
        let tree = CollectionTree::new();
        tree.create_collection(TX, 1, &path("/db/a"), Permissions::default()).unwrap();
        tree.create_collection(TX, 2, &path("/db/b"), Permissions::default()).unwrap();
        tree.create_collection(TX, 3, &path("/db/c"), Permissions::default()).unwrap();

        tree.rollback(TX, 2);
        assert!(tree.exists(&path("/db/a")));
        assert!(!tree.exists(&path("/db/b")));
        assert!(!tree.exists(&path("/db/c")));
    }

    #[test]
    fn test_move_collection_rebases_subtree() {
        let tree = CollectionTree::new();
        tree.create_collection(TX, 1, &path("/db/a"), Permissions::default()).unwrap();
        tree.create_collection(TX, 2, &path("/db/a/x"), Permissions::default()).unwrap();
        tree.put_document(TX, 3, &path("/db/a/x"), doc(&tree, "d.xml", "<d/>")).unwrap();
        tree.create_collection(TX, 4, &path("/db/t"), Permissions::default()).unwrap();
        tree.commit(TX);

        let tx2 = TxnId(2);
        tree.move_collection(tx2, 1, &path("/db/a"), &path("/db/t/a2")).unwrap();
        let moved: Vec<String> = tree.subtree(&path("/db/t")).iter().map(|p| p.to_string()).collect();
        assert_eq!(moved, vec!["/db/t", "/db/t/a2", "/db/t/a2/x"]);
        assert_eq!(tree.documents(&path("/db/t/a2/x")).unwrap().len(), 1);
        assert!(!tree.exists(&path("/db/a")));

        assert!(matches!(
            tree.move_collection(tx2, 2, &path("/db/t"), &path("/db/t/a2/x/inner")),
            Err(StorageError::MoveIntoSelf { .. })
        ));

        tree.rollback(tx2, 0);
        assert!(tree.exists(&path("/db/a/x")));
        assert!(!tree.exists(&path("/db/t/a2")));
        assert_eq!(tree.child_names(&path("/db/t")).unwrap().len(), 0);
    }

    #[test]
    fn test_configs_along_lineage() {
        let tree = CollectionTree::new();
        tree.create_collection(TX, 1, &path("/db/a"), Permissions::default()).unwrap();
        tree.create_collection(TX, 2, &path("/db/a/b"), Permissions::default()).unwrap();
        tree.set_config(TX, 3, &CollectionPath::root(), Some(CollectionConfig::default()))
            .unwrap();
        tree.set_config(TX, 4, &path("/db/a/b"), Some(CollectionConfig::default().with_fulltext(["LINE"])))
            .unwrap();

        let scopes: Vec<String> = tree
            .configs_along(&path("/db/a/b"))
            .into_iter()
            .map(|(p, _)| p.to_string())
            .collect();
        assert_eq!(scopes, vec!["/db", "/db/a/b"]);
    }

    #[test]
    fn test_snapshot_round_trip_and_replay() {
        let tree = CollectionTree::new();
        tree.create_collection(TX, 1, &path("/db/a"), Permissions::default()).unwrap();
        let d = doc(&tree, "x.xml", "<x/>");
        tree.put_document(TX, 2, &path("/db/a"), d.clone()).unwrap();
        tree.commit(TX);

        let copy = CollectionTree::from_snapshot(tree.snapshot());
        assert_eq!(copy.document(&path("/db/a"), &d.name), Some(d.clone()));
        assert!(copy.allocate_id().get() > d.id.get());

        let replayed = CollectionTree::new();
        replayed
            .apply(&JournalRecord::CreateCollection {
                path: path("/db/a"),
                permissions: Permissions::default(),
            })
            .unwrap();
        replayed
            .apply(&JournalRecord::StoreDocument {
                collection: path("/db/a"),
                document: d.clone(),
            })
            .unwrap();
        assert!(replayed.has_document(&DocumentPath::new(path("/db/a"), d.name.clone())));
        assert!(replayed.apply(&JournalRecord::Abort).is_err());
    }
}
