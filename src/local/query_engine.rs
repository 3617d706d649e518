use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::local::index_manager::{IndexType, MemoryIndexManager};
use crate::local::mutation_queue::MemoryMutationQueue;
use crate::local::overlay_cache::MemoryOverlayCache;
use crate::local::persistence::PersistenceTransaction;
use crate::local::remote_document_cache::{IndexOffset, MemoryRemoteDocumentCache};
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion, Timestamp};
use crate::mutation::{FieldMask, Overlay};
use crate::query::{LimitType, Query};

/// Merges the remote document cache with pending overlays to produce the
/// local view of documents.
pub struct LocalDocumentsView {
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    mutation_queue: Arc<MemoryMutationQueue>,
    overlay_cache: Arc<MemoryOverlayCache>,
    index_manager: Arc<MemoryIndexManager>,
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: Arc<MemoryRemoteDocumentCache>,
        mutation_queue: Arc<MemoryMutationQueue>,
        overlay_cache: Arc<MemoryOverlayCache>,
        index_manager: Arc<MemoryIndexManager>,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlay_cache,
            index_manager,
        }
    }

    pub fn mutation_queue(&self) -> &Arc<MemoryMutationQueue> {
        &self.mutation_queue
    }

    pub fn overlay_cache(&self) -> &Arc<MemoryOverlayCache> {
        &self.overlay_cache
    }

    pub fn remote_documents(&self) -> &Arc<MemoryRemoteDocumentCache> {
        &self.remote_documents
    }

    pub fn get_document(&self, key: &DocumentKey) -> MutableDocument {
        let mut doc = self.remote_documents.get(key);
        if let Some(overlay) = self.overlay_cache.overlay(key) {
            apply_overlay(&overlay, &mut doc);
        }
        doc
    }

    pub fn get_documents<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let mut docs = self.remote_documents.get_all(keys);
        self.apply_overlays(&mut docs);
        docs
    }

    /// Applies pending overlays on top of already fetched cache entries.
    pub fn apply_overlays(&self, docs: &mut BTreeMap<DocumentKey, MutableDocument>) {
        let overlays = self.overlay_cache.overlays(docs.keys().cloned().collect::<Vec<_>>());
        for (key, overlay) in overlays {
            if let Some(doc) = docs.get_mut(&key) {
                apply_overlay(&overlay, doc);
            }
        }
    }

    /// The local view of every document matching `query`, scanning the
    /// cache past `offset` and merging overlays that are not yet reflected
    /// there. Returns the result set plus the number of cache entries
    /// scanned.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
    ) -> (BTreeMap<DocumentKey, MutableDocument>, usize) {
        if query.is_document_query() {
            let mut results = BTreeMap::new();
            if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
                let doc = self.get_document(&key);
                if query.matches(&doc) {
                    results.insert(key, doc);
                }
            }
            return (results, 1);
        }

        let mut docs = self.remote_documents.documents_matching_query(query, offset);
        let scanned = docs.len();

        let overlays = self.collection_overlays(query);
        for (key, _) in &overlays {
            docs.entry(key.clone())
                .or_insert_with(|| self.remote_documents.get(key));
        }
        for (key, overlay) in overlays {
            if let Some(doc) = docs.get_mut(&key) {
                apply_overlay(&overlay, doc);
            }
        }

        docs.retain(|_, doc| query.matches(doc));
        (docs, scanned)
    }

    /// Local views of just the documents with pending overlays in the
    /// query's scope.
    pub fn overlayed_documents(&self, query: &Query) -> BTreeMap<DocumentKey, MutableDocument> {
        let overlays = self.collection_overlays(query);
        let mut docs = self.remote_documents.get_all(overlays.keys());
        for (key, overlay) in overlays {
            if let Some(doc) = docs.get_mut(&key) {
                apply_overlay(&overlay, doc);
            }
        }
        docs
    }

    fn collection_overlays(&self, query: &Query) -> BTreeMap<DocumentKey, Overlay> {
        match query.collection_group_id() {
            None => self.overlay_cache.overlays_for_collection(query.path(), -1),
            Some(group) => {
                let mut all = BTreeMap::new();
                for parent in self.index_manager.get_collection_parents(group) {
                    let collection = parent.child([group]);
                    all.extend(self.overlay_cache.overlays_for_collection(&collection, -1));
                }
                all
            }
        }
    }
}

fn apply_overlay(overlay: &Overlay, doc: &mut MutableDocument) {
    overlay
        .mutation
        .apply_to_local_view(doc, Some(FieldMask::empty()), Timestamp::now());
}

#[derive(Clone, Debug)]
pub struct QueryEngineConfig {
    /// Auto-creation of field indexes from observed scan waste.
    pub auto_index_enabled: bool,
    /// Minimum cache entries scanned before a scan counts as wasteful.
    pub auto_index_min_collection_size: usize,
    /// Scanned-to-returned ratio at which an index pays for itself.
    pub relative_index_read_cost: f64,
}

impl Default for QueryEngineConfig {
    fn default() -> Self {
        Self {
            auto_index_enabled: false,
            auto_index_min_collection_size: 100,
            relative_index_read_cost: 2.0,
        }
    }
}

/// Plans local query execution: index-served, previous-results, or full
/// collection scan, in that order of preference.
pub struct QueryEngine {
    local_documents: Arc<LocalDocumentsView>,
    index_manager: Arc<MemoryIndexManager>,
    config: QueryEngineConfig,
    indexes_created: Mutex<BTreeSet<String>>,
    pending_index_requests: Mutex<Vec<Query>>,
}

impl QueryEngine {
    pub fn new(
        local_documents: Arc<LocalDocumentsView>,
        index_manager: Arc<MemoryIndexManager>,
        config: QueryEngineConfig,
    ) -> Self {
        Self {
            local_documents,
            index_manager,
            config,
            indexes_created: Mutex::new(BTreeSet::new()),
            pending_index_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn execute_query(
        &self,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        if let Some(results) = self.perform_query_using_index(query) {
            return results;
        }
        if let Some(results) = self.perform_query_using_remote_keys(
            query,
            remote_keys,
            last_limbo_free_snapshot_version,
        ) {
            return results;
        }
        self.execute_full_collection_scan(query)
    }

    fn perform_query_using_index(
        &self,
        query: &Query,
    ) -> Option<BTreeMap<DocumentKey, MutableDocument>> {
        let index_type = self.index_manager.get_index_type(query);
        if index_type == IndexType::None {
            return None;
        }
        let keys = self.index_manager.documents_matching_query(query)?;
        debug!(
            "serving {} from index ({} candidate keys)",
            query.canonical_id(),
            keys.len()
        );
        let mut docs = self.local_documents.get_documents(keys.iter());
        // Documents only touched by pending writes may be missing from the
        // index entries; merge them in before filtering.
        docs.extend(self.local_documents.overlayed_documents(query));
        docs.retain(|_, doc| query.matches(doc));
        Some(docs)
    }

    /// Re-runs the query against the documents known to match at the last
    /// limbo-free snapshot, plus anything changed since. Not applicable
    /// until a limbo-free snapshot exists, and unsafe for limit queries
    /// whose previous boundary may have moved.
    fn perform_query_using_remote_keys(
        &self,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> Option<BTreeMap<DocumentKey, MutableDocument>> {
        if last_limbo_free_snapshot_version.is_min() {
            return None;
        }
        let mut previous = self.local_documents.get_documents(remote_keys.iter());
        previous.retain(|_, doc| query.matches(doc));

        if query.has_limit() && self.limit_boundary_moved(query, &previous, last_limbo_free_snapshot_version)
        {
            return None;
        }

        debug!(
            "re-using previous results for {} ({} documents)",
            query.canonical_id(),
            previous.len()
        );
        let offset = IndexOffset {
            read_time: last_limbo_free_snapshot_version,
            key: None,
            largest_batch_id: -1,
        };
        let (updated, _) = self.local_documents.get_documents_matching_query(query, &offset);
        previous.extend(updated);
        previous.retain(|_, doc| query.matches(doc));
        Some(previous)
    }

    /// A limit query's previous results cannot be trusted when the set ran
    /// short of the limit or its boundary document has moved since the
    /// snapshot.
    fn limit_boundary_moved(
        &self,
        query: &Query,
        previous: &BTreeMap<DocumentKey, MutableDocument>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> bool {
        let limit = query.limit().unwrap_or(0) as usize;
        if previous.len() < limit {
            return true;
        }
        let mut sorted: Vec<&MutableDocument> = previous.values().collect();
        sorted.sort_by(|a, b| query.compare_documents(a, b));
        let boundary = match query.limit_type() {
            LimitType::First => sorted.last(),
            LimitType::Last => sorted.first(),
        };
        match boundary {
            Some(doc) => {
                doc.has_pending_writes() || doc.version() > last_limbo_free_snapshot_version
            }
            None => false,
        }
    }

    fn execute_full_collection_scan(&self, query: &Query) -> BTreeMap<DocumentKey, MutableDocument> {
        debug!("full collection scan for {}", query.canonical_id());
        let (results, scanned) = self
            .local_documents
            .get_documents_matching_query(query, &IndexOffset::none());
        self.note_wasteful_scan(query, scanned, results.len());
        results
    }

    /// Records a disproportionately wasteful scan so a matching field index
    /// can be built once the surrounding transaction has completed. Index
    /// creation never runs on the query's own critical path.
    fn note_wasteful_scan(&self, query: &Query, scanned: usize, returned: usize) {
        if !self.config.auto_index_enabled {
            return;
        }
        if scanned < self.config.auto_index_min_collection_size {
            return;
        }
        let wasteful =
            scanned as f64 > self.config.relative_index_read_cost * returned.max(1) as f64;
        if !wasteful {
            return;
        }
        let canonical = query.canonical_id();
        if !self.indexes_created.lock().unwrap().insert(canonical) {
            return;
        }
        debug!(
            "requesting field index for {} after scanning {scanned} for {returned}",
            query.canonical_id()
        );
        self.pending_index_requests.lock().unwrap().push(query.clone());
    }

    pub fn has_pending_index_requests(&self) -> bool {
        !self.pending_index_requests.lock().unwrap().is_empty()
    }

    /// Builds the field indexes requested by earlier wasteful scans and
    /// backfills them from the remote document cache.
    pub fn create_requested_indexes(&self, txn: &PersistenceTransaction) {
        let requests = std::mem::take(&mut *self.pending_index_requests.lock().unwrap());
        for query in requests {
            if let Some(index_id) = self.index_manager.create_target_index(txn, &query) {
                debug!("created field index {index_id} for {}", query.canonical_id());
                let docs = self
                    .local_documents
                    .remote_documents()
                    .documents_matching_query(&query, &IndexOffset::none());
                self.index_manager.update_index_entries(txn, docs.values());
            }
        }
    }
}
