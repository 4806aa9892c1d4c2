//! Shared bookkeeping for index providers.
//!
//! Each provider keeps its committed postings behind one `RwLock` and stages
//! every transaction's changes separately:
//!
//! - queries read committed postings only, so in-flight changes stay invisible
//! - `observe` touches only the calling transaction's pending list; concurrent
//!   observers contend on a short map latch, never on the postings
//! - `commit` takes the postings write lock once and applies the whole list,
//!   which serializes provider commits (a throughput cost, not needed for
//!   correctness)

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::index::error::IndexError;
use crate::index::NodeRef;
use crate::storage::{CollectionPath, DocumentId};
use crate::transaction::TxnId;

enum Change<K, D> {
    Add {
        document: DocumentId,
        entries: Vec<(K, NodeRef)>,
    },
    Remove {
        document: DocumentId,
    },
    /// `None` clears the rule declared at `scope`.
    Rule {
        scope: CollectionPath,
        rule: Option<Option<D>>,
    },
}

type PendingList<K, D> = Arc<Mutex<Vec<(u64, Change<K, D>)>>>;

struct Committed<K, D> {
    /// Scope -> definition; a `None` definition switches the index off below
    /// that scope.
    rules: BTreeMap<CollectionPath, Option<D>>,
    postings: HashMap<K, BTreeSet<NodeRef>>,
    by_doc: HashMap<DocumentId, Vec<K>>,
}

pub(crate) struct IndexCore<K, D> {
    name: &'static str,
    committed: RwLock<Committed<K, D>>,
    pending: Mutex<HashMap<TxnId, PendingList<K, D>>>,
}

impl<K, D> IndexCore<K, D>
where
    K: Eq + Hash + Clone,
    D: Clone,
{
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            committed: RwLock::new(Committed {
                rules: BTreeMap::new(),
                postings: HashMap::new(),
                by_doc: HashMap::new(),
            }),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending_for(&self, txn: TxnId) -> PendingList<K, D> {
        Arc::clone(self.pending.lock().entry(txn).or_default())
    }

    fn existing_pending(&self, txn: TxnId) -> Option<PendingList<K, D>> {
        self.pending.lock().get(&txn).cloned()
    }

    /// Definition governing `collection` as `txn` sees it: the nearest scope
    /// with a rule, the transaction's own staged rules taking precedence.
    pub(crate) fn rule_for(&self, txn: TxnId, collection: &CollectionPath) -> Option<D> {
        let pending = self.existing_pending(txn);
        let pending = pending.as_ref().map(|p| p.lock());
        let committed = self.committed.read();

        for scope in collection.lineage().iter().rev() {
            let staged = pending.as_ref().and_then(|changes| {
                changes.iter().rev().find_map(|(_, change)| match change {
                    Change::Rule { scope: s, rule } if s == scope => Some(rule.clone()),
                    _ => None,
                })
            });
            match staged {
                Some(Some(rule)) => return rule,
                Some(None) => continue,
                None => {}
            }
            if let Some(rule) = committed.rules.get(scope) {
                return rule.clone();
            }
        }
        None
    }

    fn is_present(&self, changes: &[(u64, Change<K, D>)], document: DocumentId) -> bool {
        let mut present = self.committed.read().by_doc.contains_key(&document);
        for (_, change) in changes {
            match change {
                Change::Add { document: d, .. } if *d == document => present = true,
                Change::Remove { document: d } if *d == document => present = false,
                _ => {}
            }
        }
        present
    }

    pub(crate) fn stage_add(
        &self,
        txn: TxnId,
        step: u64,
        document: DocumentId,
        entries: Vec<(K, NodeRef)>,
    ) -> Result<(), IndexError> {
        let pending = self.pending_for(txn);
        let mut changes = pending.lock();
        if self.is_present(&changes, document) {
            return Err(IndexError::inconsistency(
                self.name,
                format!("{} added twice", document),
            ));
        }
        trace!(index = self.name, %txn, %document, entries = entries.len(), "staged add");
        changes.push((step, Change::Add { document, entries }));
        Ok(())
    }

    pub(crate) fn stage_remove(&self, txn: TxnId, step: u64, document: DocumentId) -> Result<(), IndexError> {
        let pending = self.pending_for(txn);
        let mut changes = pending.lock();
        if !self.is_present(&changes, document) {
            return Err(IndexError::inconsistency(
                self.name,
                format!("{} removed but not indexed", document),
            ));
        }
        changes.push((step, Change::Remove { document }));
        Ok(())
    }

    pub(crate) fn stage_rule(&self, txn: TxnId, step: u64, scope: &CollectionPath, rule: Option<Option<D>>) {
        self.pending_for(txn).lock().push((
            step,
            Change::Rule {
                scope: scope.clone(),
                rule,
            },
        ));
    }

    /// Committed postings for one key.
    pub(crate) fn lookup(&self, key: &K) -> BTreeSet<NodeRef> {
        self.committed
            .read()
            .postings
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Union of committed postings over every key matching `pred`.
    pub(crate) fn lookup_where(&self, pred: impl Fn(&K) -> bool) -> BTreeSet<NodeRef> {
        let committed = self.committed.read();
        committed
            .postings
            .iter()
            .filter(|(key, _)| pred(key))
            .flat_map(|(_, nodes)| nodes.iter().cloned())
            .collect()
    }

    pub(crate) fn commit(&self, txn: TxnId) {
        let Some(pending) = self.pending.lock().remove(&txn) else {
            return;
        };
        let changes = std::mem::take(&mut *pending.lock());
        if changes.is_empty() {
            return;
        }

        let count = changes.len();
        let mut committed = self.committed.write();
        for (_, change) in changes {
            match change {
                Change::Add { document, entries } => {
                    let mut keys = Vec::with_capacity(entries.len());
                    for (key, node) in entries {
                        committed.postings.entry(key.clone()).or_default().insert(node);
                        keys.push(key);
                    }
                    committed.by_doc.insert(document, keys);
                }
                Change::Remove { document } => {
                    let keys = committed.by_doc.remove(&document).unwrap_or_default();
                    for key in keys {
                        let emptied = match committed.postings.get_mut(&key) {
                            Some(nodes) => {
                                nodes.retain(|n| n.document != document);
                                nodes.is_empty()
                            }
                            None => false,
                        };
                        if emptied {
                            committed.postings.remove(&key);
                        }
                    }
                }
                Change::Rule { scope, rule } => match rule {
                    Some(rule) => {
                        committed.rules.insert(scope, rule);
                    }
                    None => {
                        committed.rules.remove(&scope);
                    }
                },
            }
        }
        trace!(index = self.name, %txn, changes = count, "index changes committed");
    }

    pub(crate) fn rollback(&self, txn: TxnId, from_step: u64) {
        let mut pending = self.pending.lock();
        if from_step == 0 {
            pending.remove(&txn);
        } else if let Some(changes) = pending.get(&txn) {
            changes.lock().retain(|(step, _)| *step < from_step);
        }
    }

    /// Number of (key, node) postings committed.
    pub(crate) fn entry_count(&self) -> usize {
        self.committed.read().postings.values().map(BTreeSet::len).sum()
    }

    /// Number of documents the index has seen.
    pub(crate) fn document_count(&self) -> usize {
        self.committed.read().by_doc.len()
    }
}
