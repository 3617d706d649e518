use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, MutableDocument};
use crate::query::{LimitType, Query};
use crate::remote::online_state::OnlineState;
use crate::remote::remote_event::TargetChange;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DocumentChangeType {
    Removed,
    Added,
    Modified,
    /// Only metadata (pending-writes state) changed, not content.
    Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: DocumentChangeType,
    pub document: MutableDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// One emission of a view: the full ordered result set plus the ordered
/// delta since the previous emission.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: Vec<MutableDocument>,
    pub changes: Vec<DocumentViewChange>,
    pub from_cache: bool,
    pub has_pending_writes: bool,
    pub sync_state_changed: bool,
}

/// Accumulates per-document changes, collapsing consecutive changes for the
/// same key into the single change a listener should observe.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn track(&mut self, change: DocumentViewChange) {
        use DocumentChangeType::*;
        let key = change.document.key().clone();
        let merged = match self.changes.remove(&key) {
            None => Some(change),
            Some(old) => match (old.change_type, change.change_type) {
                // Added then modified is still just an add of the newer doc.
                (Added, Modified) | (Added, Metadata) => Some(DocumentViewChange {
                    change_type: Added,
                    document: change.document,
                }),
                (Added, Removed) => None,
                (Removed, Added) => Some(DocumentViewChange {
                    change_type: Modified,
                    document: change.document,
                }),
                (Modified, Removed) | (Metadata, Removed) => Some(DocumentViewChange {
                    change_type: Removed,
                    document: change.document,
                }),
                _ => Some(change),
            },
        };
        if let Some(merged) = merged {
            self.changes.insert(key, merged);
        }
    }

    pub fn take(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// The intermediate result of [`View::compute_doc_changes`]: the next
/// document set, pending change set, and whether the view needs a full
/// requery before it can be applied.
pub struct ViewDocumentChanges {
    document_set: Vec<MutableDocument>,
    change_set: DocumentChangeSet,
    mutated_keys: BTreeSet<DocumentKey>,
    pub needs_refill: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// The outcome of applying computed changes to a view.
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Materialized, query-ordered result set for one listened query.
///
/// The view tracks which of its documents the server has confirmed
/// (`synced_documents`) so it can tell `from_cache` apart from `synced` and
/// surface limbo documents: cached documents the current server view no
/// longer vouches for.
pub struct View {
    query: Query,
    document_set: Vec<MutableDocument>,
    synced_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    current: bool,
    last_sync_state: Option<SyncState>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        Self {
            query,
            document_set: Vec::new(),
            synced_documents,
            mutated_keys: BTreeSet::new(),
            limbo_documents: BTreeSet::new(),
            current: false,
            last_sync_state: None,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    /// Folds a batch of changed documents into a prospective new document
    /// set without mutating the view. `previous` carries forward the state
    /// from an earlier pass when a refill requery was needed.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &BTreeMap<DocumentKey, MutableDocument>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut document_set, mut change_set, mut mutated_keys) = match previous {
            Some(previous) => (
                previous.document_set,
                previous.change_set,
                previous.mutated_keys,
            ),
            None => (
                self.document_set.clone(),
                DocumentChangeSet::default(),
                self.mutated_keys.clone(),
            ),
        };
        let mut needs_refill = false;

        // A full view at its limit means documents outside the view could be
        // promoted by any removal; track the boundary to detect that.
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First
                if self.query.limit().map(|l| l as usize) == Some(document_set.len()) =>
            {
                document_set.last().cloned()
            }
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last
                if self.query.limit().map(|l| l as usize) == Some(document_set.len()) =>
            {
                document_set.first().cloned()
            }
            _ => None,
        };

        for (key, new_doc) in doc_changes {
            let old_index = document_set.iter().position(|doc| doc.key() == key);
            let old_doc = old_index.map(|index| document_set[index].clone());
            let new_doc = if self.query.matches(new_doc) {
                Some(new_doc.clone())
            } else {
                None
            };

            match (old_doc, new_doc) {
                (Some(old), Some(new)) => {
                    let content_changed =
                        old.data() != new.data() || old.version() != new.version();
                    if content_changed {
                        change_set.track(DocumentViewChange {
                            change_type: DocumentChangeType::Modified,
                            document: new.clone(),
                        });
                    } else if old.has_pending_writes() != new.has_pending_writes() {
                        change_set.track(DocumentViewChange {
                            change_type: DocumentChangeType::Metadata,
                            document: new.clone(),
                        });
                    }
                    if let Some(index) = old_index {
                        document_set.remove(index);
                    }
                    Self::insert_sorted(&self.query, &mut document_set, new.clone());
                    Self::note_mutated(&mut mutated_keys, &new);
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange {
                        change_type: DocumentChangeType::Added,
                        document: new.clone(),
                    });
                    Self::insert_sorted(&self.query, &mut document_set, new.clone());
                    Self::note_mutated(&mut mutated_keys, &new);
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: DocumentChangeType::Removed,
                        document: old,
                    });
                    if let Some(index) = old_index {
                        document_set.remove(index);
                    }
                    mutated_keys.remove(key);
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        // The cache may hold the replacement; only a requery
                        // can tell.
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }
        }

        if let Some(limit) = self.query.limit() {
            let limit = limit as usize;
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::Last => document_set.remove(0),
                    _ => match document_set.pop() {
                        Some(doc) => doc,
                        None => break,
                    },
                };
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: DocumentChangeType::Removed,
                    document: evicted,
                });
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// Applies a computed change to the view and produces the snapshot (if
    /// anything observable changed) plus limbo membership deltas.
    ///
    /// Callers must resolve `needs_refill` (by requerying and recomputing)
    /// before applying.
    pub fn apply_changes(
        &mut self,
        changes: ViewDocumentChanges,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        debug_assert!(!changes.needs_refill, "refill before applying changes");

        self.document_set = changes.document_set;
        self.mutated_keys = changes.mutated_keys;

        if let Some(target_change) = target_change {
            for key in target_change
                .added_documents
                .iter()
                .chain(target_change.modified_documents.iter())
            {
                self.synced_documents.insert(key.clone());
            }
            for key in &target_change.removed_documents {
                self.synced_documents.remove(key);
            }
            // The aggregator emits `current` with every dirty target change;
            // resets and re-listens demote the view back to cache mode.
            self.current = target_change.current;
        }

        let limbo_changes = self.update_limbo_documents();

        let sync_state = if self.current && self.limbo_documents.is_empty() {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let from_cache = sync_state == SyncState::Local;
        // The first apply always emits so listeners get an initial snapshot.
        let sync_state_changed = self
            .last_sync_state
            .map_or(true, |previous| previous != sync_state);
        self.last_sync_state = Some(sync_state);

        let mut ordered = changes.change_set.take();
        ordered.sort_by(|left, right| {
            left.change_type
                .cmp(&right.change_type)
                .then_with(|| self.query.compare_documents(&left.document, &right.document))
        });

        let snapshot = if !ordered.is_empty() || sync_state_changed {
            Some(ViewSnapshot {
                query: self.query.clone(),
                documents: self.document_set.clone(),
                changes: ordered,
                from_cache,
                has_pending_writes: !self.mutated_keys.is_empty(),
                sync_state_changed,
            })
        } else {
            None
        };

        ViewChange {
            snapshot,
            limbo_changes,
        }
    }

    /// Re-emits the current state with `from_cache: true` while the client
    /// is offline; `Unknown` and `Online` leave the view untouched.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> Option<ViewSnapshot> {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let changes = self.compute_doc_changes(&BTreeMap::new(), None);
            let change = self.apply_changes(changes, None);
            change.snapshot
        } else {
            None
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }

        let old_limbo = std::mem::take(&mut self.limbo_documents);
        for doc in &self.document_set {
            if doc.has_local_mutations() {
                continue;
            }
            if !self.synced_documents.contains(doc.key()) {
                self.limbo_documents.insert(doc.key().clone());
            }
        }

        let mut changes = Vec::new();
        for key in old_limbo.difference(&self.limbo_documents) {
            changes.push(LimboDocumentChange::Removed(key.clone()));
        }
        for key in self.limbo_documents.difference(&old_limbo) {
            changes.push(LimboDocumentChange::Added(key.clone()));
        }
        changes
    }

    fn insert_sorted(query: &Query, document_set: &mut Vec<MutableDocument>, doc: MutableDocument) {
        let index = document_set
            .binary_search_by(|probe| query.compare_documents(probe, &doc))
            .unwrap_or_else(|index| index);
        document_set.insert(index, doc);
    }

    fn note_mutated(mutated_keys: &mut BTreeSet<DocumentKey>, doc: &MutableDocument) {
        if doc.has_local_mutations() {
            mutated_keys.insert(doc.key().clone());
        } else {
            mutated_keys.remove(doc.key());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourcePath, SnapshotVersion, Timestamp};
    use crate::query::OrderBy;
    use crate::value::{object_from_pairs, FieldValue};

    fn doc(path: &str, score: i64) -> MutableDocument {
        MutableDocument::found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            object_from_pairs([("score", FieldValue::Integer(score))]),
        )
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn score_query() -> Query {
        Query::collection(ResourcePath::from_string("games").unwrap()).with_order_by(
            OrderBy::ascending(crate::model::FieldPath::from_dot_separated("score").unwrap()),
        )
    }

    fn changes_of(docs: Vec<MutableDocument>) -> BTreeMap<DocumentKey, MutableDocument> {
        docs.into_iter().map(|d| (d.key().clone(), d)).collect()
    }

    fn current_change(keys: &[&str]) -> TargetChange {
        TargetChange {
            current: true,
            added_documents: keys.iter().map(|k| key(k)).collect(),
            ..TargetChange::default()
        }
    }

    #[test]
    fn documents_stay_in_query_order() {
        let query = score_query();
        let mut view = View::new(query.clone(), BTreeSet::new());
        let computed = view.compute_doc_changes(
            &changes_of(vec![doc("games/a", 30), doc("games/b", 10), doc("games/c", 20)]),
            None,
        );
        let change = view.apply_changes(computed, None);
        let snapshot = change.snapshot.unwrap();
        let order: Vec<&str> = snapshot
            .documents
            .iter()
            .map(|d| d.key().id())
            .collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert!(snapshot.from_cache);
        assert!(snapshot
            .changes
            .iter()
            .all(|c| c.change_type == DocumentChangeType::Added));
    }

    #[test]
    fn limit_truncation_emits_removed_for_the_evicted_document() {
        let query = score_query().with_limit_to_first(2);
        let mut view = View::new(query, BTreeSet::new());
        let computed = view.compute_doc_changes(
            &changes_of(vec![doc("games/a", 10), doc("games/b", 20)]),
            None,
        );
        view.apply_changes(computed, None);

        // A new document inside the limit boundary pushes "b" out.
        let computed = view.compute_doc_changes(&changes_of(vec![doc("games/c", 15)]), None);
        assert!(!computed.needs_refill);
        let change = view.apply_changes(computed, None);
        let snapshot = change.snapshot.unwrap();
        let order: Vec<&str> = snapshot
            .documents
            .iter()
            .map(|d| d.key().id())
            .collect();
        assert_eq!(order, vec!["a", "c"]);
        assert!(snapshot.changes.contains(&DocumentViewChange {
            change_type: DocumentChangeType::Removed,
            document: doc("games/b", 20),
        }));
    }

    #[test]
    fn removal_from_a_full_limit_view_needs_refill() {
        let query = score_query().with_limit_to_first(2);
        let mut view = View::new(query, BTreeSet::new());
        let computed = view.compute_doc_changes(
            &changes_of(vec![doc("games/a", 10), doc("games/b", 20), doc("games/c", 30)]),
            None,
        );
        view.apply_changes(computed, None);

        // Deleting "a" may promote "c" from the cache; the view cannot know
        // without a requery.
        let mut deleted = doc("games/a", 10);
        deleted.convert_to_no_document(SnapshotVersion::new(Timestamp::new(2, 0)));
        let computed = view.compute_doc_changes(&changes_of(vec![deleted]), None);
        assert!(computed.needs_refill);

        // The refill recomputes from the full cached result.
        let refilled = view.compute_doc_changes(
            &changes_of(vec![doc("games/b", 20), doc("games/c", 30)]),
            Some(computed),
        );
        let change = view.apply_changes(
            ViewDocumentChanges {
                needs_refill: false,
                ..refilled
            },
            None,
        );
        let snapshot = change.snapshot.unwrap();
        let order: Vec<&str> = snapshot
            .documents
            .iter()
            .map(|d| d.key().id())
            .collect();
        assert_eq!(order, vec!["b", "c"]);
    }

    #[test]
    fn unsynced_documents_become_limbo_once_current() {
        let query = score_query();
        let mut view = View::new(query, BTreeSet::new());
        let computed = view.compute_doc_changes(
            &changes_of(vec![doc("games/a", 10), doc("games/b", 20)]),
            None,
        );
        // The server vouches for "a" only.
        let change = view.apply_changes(computed, Some(&current_change(&["games/a"])));
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange::Added(key("games/b"))]
        );
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache, "limbo documents keep the view in cache state");
    }

    #[test]
    fn locally_mutated_documents_are_not_limbo() {
        let query = score_query();
        let mut view = View::new(query, BTreeSet::new());
        let mut mutated = doc("games/b", 20);
        mutated.set_has_local_mutations();
        let computed =
            view.compute_doc_changes(&changes_of(vec![doc("games/a", 10), mutated]), None);
        let change = view.apply_changes(computed, Some(&current_change(&["games/a"])));
        assert!(change.limbo_changes.is_empty());
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.has_pending_writes);
    }

    #[test]
    fn metadata_only_change_surfaces_as_metadata() {
        let query = score_query();
        let mut view = View::new(query.clone(), BTreeSet::new());
        let committed = {
            let mut d = doc("games/a", 10);
            d.set_has_committed_mutations();
            d
        };
        let computed = view.compute_doc_changes(&changes_of(vec![committed]), None);
        view.apply_changes(computed, None);

        // Same content, pending-write flag cleared.
        let computed = view.compute_doc_changes(&changes_of(vec![doc("games/a", 10)]), None);
        let change = view.apply_changes(computed, None);
        let snapshot = change.snapshot.unwrap();
        assert_eq!(snapshot.changes.len(), 1);
        assert_eq!(snapshot.changes[0].change_type, DocumentChangeType::Metadata);
    }

    #[test]
    fn going_offline_re_emits_from_cache() {
        let query = score_query();
        let mut view = View::new(query, BTreeSet::new());
        let computed = view.compute_doc_changes(&changes_of(vec![doc("games/a", 10)]), None);
        let change = view.apply_changes(computed, Some(&current_change(&["games/a"])));
        assert!(!change.snapshot.unwrap().from_cache);

        let snapshot = view.apply_online_state_change(OnlineState::Offline).unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(snapshot.changes.is_empty());
    }
}
