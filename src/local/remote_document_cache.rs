use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::local::persistence::PersistenceTransaction;
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::query::Query;

/// Lower bound for incremental document scans, ordered by read time then
/// key. `largest_batch_id` tags how much local mutation state the consumer
/// had seen; it does not participate in the ordering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub key: Option<DocumentKey>,
    pub largest_batch_id: i32,
}

impl IndexOffset {
    pub fn none() -> Self {
        Self {
            read_time: SnapshotVersion::MIN,
            key: None,
            largest_batch_id: -1,
        }
    }

    pub fn from_document(doc: &MutableDocument, largest_batch_id: i32) -> Self {
        Self {
            read_time: doc.read_time(),
            key: Some(doc.key().clone()),
            largest_batch_id,
        }
    }

    fn comes_before(&self, doc: &MutableDocument) -> bool {
        match self.read_time.cmp(&doc.read_time()) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => match &self.key {
                Some(key) => key < doc.key(),
                None => true,
            },
        }
    }
}

/// Documents as last seen from the backend, keyed by path.
pub struct MemoryRemoteDocumentCache {
    docs: Mutex<BTreeMap<DocumentKey, MutableDocument>>,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the cached entry, or an invalid document when unknown.
    pub fn get(&self, key: &DocumentKey) -> MutableDocument {
        self.docs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::invalid(key.clone()))
    }

    pub fn get_all<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let docs = self.docs.lock().unwrap();
        keys.into_iter()
            .map(|key| {
                (
                    key.clone(),
                    docs.get(key)
                        .cloned()
                        .unwrap_or_else(|| MutableDocument::invalid(key.clone())),
                )
            })
            .collect()
    }

    /// Writes `doc` stamped with `read_time`. Stale updates are dropped:
    /// only a strictly newer version may overwrite an existing valid entry.
    /// Returns whether the write was applied.
    pub fn add(
        &self,
        _txn: &PersistenceTransaction,
        doc: &MutableDocument,
        read_time: SnapshotVersion,
    ) -> bool {
        let mut docs = self.docs.lock().unwrap();
        if let Some(existing) = docs.get(doc.key()) {
            // An entry carrying committed mutations may be replaced by the
            // authoritative watch copy at the same version.
            let replaceable = existing.has_committed_mutations()
                && doc.version() >= existing.version();
            if existing.is_valid_document()
                && !existing.version().is_min()
                && !replaceable
                && doc.version() <= existing.version()
            {
                debug!(
                    "dropping stale cache write for {} at {:?}",
                    doc.key(),
                    doc.version()
                );
                return false;
            }
        }
        let mut stored = doc.clone();
        stored.set_read_time(read_time);
        docs.insert(stored.key().clone(), stored);
        true
    }

    pub fn remove(&self, _txn: &PersistenceTransaction, key: &DocumentKey) {
        self.docs.lock().unwrap().remove(key);
    }

    /// All cached documents in the query's collection (or collection group)
    /// past `offset`, without applying the query's predicate.
    pub fn documents_matching_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let docs = self.docs.lock().unwrap();
        docs.iter()
            .filter(|(key, doc)| {
                let in_scope = match query.collection_group_id() {
                    Some(group) => {
                        key.has_collection_id(group) && query.path().is_prefix_of(key.path())
                    }
                    None => {
                        query.path().is_prefix_of(key.path())
                            && key.path().len() == query.path().len() + 1
                    }
                };
                in_scope && offset.comes_before(doc)
            })
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect()
    }

    /// Valid cached documents whose key names `group` as its collection id.
    pub fn documents_in_collection_group(
        &self,
        group: &str,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let docs = self.docs.lock().unwrap();
        docs.iter()
            .filter(|(key, doc)| key.has_collection_id(group) && doc.is_valid_document())
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn keys(&self) -> Vec<DocumentKey> {
        self.docs.lock().unwrap().keys().cloned().collect()
    }

    /// Rough serialized footprint of the cache, for GC thresholds.
    pub fn approximate_byte_size(&self) -> usize {
        let docs = self.docs.lock().unwrap();
        docs.values()
            .map(|doc| {
                serde_json::to_vec(doc.data())
                    .map(|bytes| bytes.len())
                    .unwrap_or(0)
                    + doc.key().to_string().len()
            })
            .sum()
    }
}

impl Default for MemoryRemoteDocumentCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Staged reads and writes for one apply-remote-event pass, committed
/// atomically at the end of the transaction.
pub struct RemoteDocumentChangeBuffer {
    cache: Arc<MemoryRemoteDocumentCache>,
    read_cache: BTreeMap<DocumentKey, MutableDocument>,
    changes: BTreeMap<DocumentKey, (MutableDocument, SnapshotVersion)>,
}

impl RemoteDocumentChangeBuffer {
    pub fn new(cache: Arc<MemoryRemoteDocumentCache>) -> Self {
        Self {
            cache,
            read_cache: BTreeMap::new(),
            changes: BTreeMap::new(),
        }
    }

    /// Reads through the buffer: staged changes win over cached reads.
    pub fn get(&mut self, key: &DocumentKey) -> MutableDocument {
        if let Some((doc, _)) = self.changes.get(key) {
            return doc.clone();
        }
        if let Some(doc) = self.read_cache.get(key) {
            return doc.clone();
        }
        let doc = self.cache.get(key);
        self.read_cache.insert(key.clone(), doc.clone());
        doc
    }

    pub fn add_entry(&mut self, doc: MutableDocument, read_time: SnapshotVersion) {
        self.changes.insert(doc.key().clone(), (doc, read_time));
    }

    /// Commits all staged entries. Returns the keys whose writes were
    /// applied (not dropped as stale).
    pub fn apply_changes(&mut self, txn: &PersistenceTransaction) -> Vec<DocumentKey> {
        let mut applied = Vec::new();
        for (key, (doc, read_time)) in std::mem::take(&mut self.changes) {
            if self.cache.add(txn, &doc, read_time) {
                applied.push(key);
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::persistence::MemoryPersistence;
    use crate::model::{ResourcePath, Timestamp};
    use crate::value::{object_from_pairs, FieldValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, seconds: i64) -> MutableDocument {
        MutableDocument::found_document(
            key(path),
            version(seconds),
            object_from_pairs([("v", FieldValue::Integer(seconds))]),
        )
    }

    #[tokio::test]
    async fn stale_writes_are_dropped() {
        let persistence = MemoryPersistence::new();
        let cache = MemoryRemoteDocumentCache::new();
        persistence
            .run_transaction("write", |txn| {
                assert!(cache.add(txn, &doc("cities/sf", 5), version(5)));
                assert!(!cache.add(txn, &doc("cities/sf", 4), version(6)));
                assert!(!cache.add(txn, &doc("cities/sf", 5), version(6)));
                assert!(cache.add(txn, &doc("cities/sf", 6), version(6)));
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(cache.get(&key("cities/sf")).version(), version(6));
    }

    #[tokio::test]
    async fn query_scan_honors_offset() {
        let persistence = MemoryPersistence::new();
        let cache = MemoryRemoteDocumentCache::new();
        persistence
            .run_transaction("write", |txn| {
                cache.add(txn, &doc("cities/sf", 1), version(1));
                cache.add(txn, &doc("cities/la", 2), version(2));
                Ok(())
            })
            .await
            .unwrap();
        let query = Query::collection(ResourcePath::from_string("cities").unwrap());
        let all = cache.documents_matching_query(&query, &IndexOffset::none());
        assert_eq!(all.len(), 2);
        let offset = IndexOffset {
            read_time: version(1),
            key: Some(key("cities/zz")),
            largest_batch_id: -1,
        };
        let later = cache.documents_matching_query(&query, &offset);
        assert_eq!(later.len(), 1);
        assert!(later.contains_key(&key("cities/la")));
    }

    #[tokio::test]
    async fn buffered_reads_see_staged_writes() {
        let persistence = MemoryPersistence::new();
        let cache = Arc::new(MemoryRemoteDocumentCache::new());
        let mut buffer = RemoteDocumentChangeBuffer::new(cache.clone());
        assert!(!buffer.get(&key("cities/sf")).is_valid_document());
        buffer.add_entry(doc("cities/sf", 3), version(3));
        assert!(buffer.get(&key("cities/sf")).is_found_document());
        // Not visible in the cache until committed.
        assert!(!cache.get(&key("cities/sf")).is_valid_document());
        persistence
            .run_transaction("commit", |txn| {
                let applied = buffer.apply_changes(txn);
                assert_eq!(applied.len(), 1);
                Ok(())
            })
            .await
            .unwrap();
        assert!(cache.get(&key("cities/sf")).is_found_document());
    }
}
