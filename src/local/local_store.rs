use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::{invalid_argument, EngineResult};
use crate::local::index_manager::MemoryIndexManager;
use crate::local::lru_gc::{LruGarbageCollector, LruResults};
use crate::local::mutation_queue::MemoryMutationQueue;
use crate::local::overlay_cache::MemoryOverlayCache;
use crate::local::persistence::{MemoryPersistence, PersistenceTransaction, User};
use crate::local::query_engine::{LocalDocumentsView, QueryEngine, QueryEngineConfig};
use crate::local::remote_document_cache::{MemoryRemoteDocumentCache, RemoteDocumentChangeBuffer};
use crate::local::target_cache::{MemoryTargetCache, TargetData, TargetPurpose};
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion, Timestamp};
use crate::mutation::{
    calculate_overlay_mutation, FieldMask, Mutation, MutationBatch, MutationBatchResult,
};
use crate::query::{Query, Target};
use crate::remote::remote_event::{RemoteEvent, TargetChange};

#[derive(Clone, Debug)]
pub struct LocalStoreConfig {
    /// Age at which a changed resume token is always persisted, even when
    /// its byte length did not change.
    pub resume_token_max_age_seconds: i64,
    pub query_engine: QueryEngineConfig,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            resume_token_max_age_seconds: 30,
            query_engine: QueryEngineConfig::default(),
        }
    }
}

/// The optimistic local view produced by a write.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: i32,
    pub changes: BTreeMap<DocumentKey, MutableDocument>,
}

#[derive(Clone, Debug)]
pub struct LocalQueryResult {
    pub documents: BTreeMap<DocumentKey, MutableDocument>,
    pub remote_keys: BTreeSet<DocumentKey>,
    pub last_limbo_free_snapshot_version: SnapshotVersion,
}

/// What a view computed from a snapshot, fed back for bookkeeping.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub target_id: i32,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

/// Single-writer façade over all local components. Every persisted-state
/// change happens inside one named transaction.
pub struct LocalStore {
    persistence: Arc<MemoryPersistence>,
    mutation_queue: Arc<MemoryMutationQueue>,
    overlay_cache: Arc<MemoryOverlayCache>,
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    target_cache: Arc<MemoryTargetCache>,
    index_manager: Arc<MemoryIndexManager>,
    local_documents: Arc<LocalDocumentsView>,
    query_engine: QueryEngine,
    active_targets: Mutex<BTreeMap<i32, TargetData>>,
    config: LocalStoreConfig,
}

impl LocalStore {
    pub fn new(persistence: Arc<MemoryPersistence>, user: User, config: LocalStoreConfig) -> Self {
        let mutation_queue = persistence.mutation_queue(&user);
        let overlay_cache = persistence.overlay_cache(&user);
        let remote_documents = persistence.remote_document_cache();
        let target_cache = persistence.target_cache();
        let index_manager = persistence.index_manager();
        let local_documents = Arc::new(LocalDocumentsView::new(
            remote_documents.clone(),
            mutation_queue.clone(),
            overlay_cache.clone(),
            index_manager.clone(),
        ));
        let query_engine = QueryEngine::new(
            local_documents.clone(),
            index_manager.clone(),
            config.query_engine.clone(),
        );
        Self {
            persistence,
            mutation_queue,
            overlay_cache,
            remote_documents,
            target_cache,
            index_manager,
            local_documents,
            query_engine,
            active_targets: Mutex::new(BTreeMap::new()),
            config,
        }
    }

    /// Replays the outstanding batch log over the remote document base,
    /// rebuilding any overlays a crash between batch removal and overlay
    /// recompute left stale.
    pub async fn start(&self) -> EngineResult<()> {
        self.persistence
            .run_transaction("Start LocalStore", |txn| {
                let mut keys = BTreeSet::new();
                for batch in self.mutation_queue.all_mutation_batches() {
                    for key in batch.keys() {
                        keys.insert(key);
                    }
                }
                if !keys.is_empty() {
                    self.recalculate_overlays(txn, &keys);
                }
                Ok(())
            })
            .await
    }

    pub fn persistence(&self) -> &Arc<MemoryPersistence> {
        &self.persistence
    }

    pub fn target_cache(&self) -> &Arc<MemoryTargetCache> {
        &self.target_cache
    }

    pub fn mutation_queue(&self) -> &Arc<MemoryMutationQueue> {
        &self.mutation_queue
    }

    pub fn remote_documents(&self) -> &Arc<MemoryRemoteDocumentCache> {
        &self.remote_documents
    }

    pub fn active_target_ids(&self) -> BTreeSet<i32> {
        self.active_targets.lock().unwrap().keys().copied().collect()
    }

    /// Reuses an existing allocation for an equal target, else assigns a
    /// fresh never-recycled target id.
    pub async fn allocate_target(&self, target: Target) -> EngineResult<TargetData> {
        let data = match self.target_cache.get_target_data(&target) {
            Some(existing) => existing,
            None => {
                self.persistence
                    .run_transaction("Allocate target", |txn| {
                        let target_id = self.target_cache.allocate_target_id(txn);
                        let data = TargetData::new(
                            target,
                            target_id,
                            txn.sequence_number(),
                            TargetPurpose::Listen,
                        );
                        self.target_cache.add_target_data(txn, data.clone());
                        Ok(data)
                    })
                    .await?
            }
        };
        self.active_targets
            .lock()
            .unwrap()
            .insert(data.target_id, data.clone());
        Ok(data)
    }

    /// Ends local interest in a target. With `keep_persisted` the target
    /// row stays behind for the garbage collector to expire.
    pub async fn release_target(&self, target_id: i32, keep_persisted: bool) -> EngineResult<()> {
        let data = self
            .active_targets
            .lock()
            .unwrap()
            .remove(&target_id)
            .ok_or_else(|| invalid_argument(format!("released unknown target {target_id}")))?;
        self.persistence
            .run_transaction("Release target", |txn| {
                if keep_persisted {
                    let sequence_number = txn.sequence_number();
                    for key in self.target_cache.matching_keys_for_target(target_id) {
                        self.target_cache
                            .update_document_sequence_number(txn, key, sequence_number);
                    }
                    self.target_cache
                        .update_target_data(txn, data.clone().with_sequence_number(sequence_number));
                } else {
                    self.target_cache.remove_target_data(txn, target_id);
                }
                Ok(())
            })
            .await
    }

    pub fn target_data_for_target(&self, target: &Target) -> Option<TargetData> {
        self.target_cache.get_target_data(target)
    }

    pub async fn execute_query(
        &self,
        query: &Query,
        use_previous_results: bool,
    ) -> EngineResult<LocalQueryResult> {
        let result = self
            .persistence
            .run_transaction("Execute query", |_txn| {
                let target = query.to_target();
                let (remote_keys, last_limbo_free) = match self.target_cache.get_target_data(&target)
                {
                    Some(data) => (
                        self.target_cache.matching_keys_for_target(data.target_id),
                        data.last_limbo_free_snapshot_version,
                    ),
                    None => (BTreeSet::new(), SnapshotVersion::MIN),
                };
                let last_limbo_free = if use_previous_results {
                    last_limbo_free
                } else {
                    SnapshotVersion::MIN
                };
                let documents =
                    self.query_engine
                        .execute_query(query, &remote_keys, last_limbo_free);
                Ok(LocalQueryResult {
                    documents,
                    remote_keys,
                    last_limbo_free_snapshot_version: last_limbo_free,
                })
            })
            .await?;
        // Index builds requested by the scan run after the query transaction
        // so they never delay the caller's results.
        if self.query_engine.has_pending_index_requests() {
            self.persistence
                .run_transaction("Build requested indexes", |txn| {
                    self.query_engine.create_requested_indexes(txn);
                    Ok(())
                })
                .await?;
        }
        Ok(result)
    }

    /// Folds one watch snapshot into persisted state and returns the merged
    /// local views of every document that actually changed.
    pub async fn apply_remote_event(
        &self,
        event: RemoteEvent,
    ) -> EngineResult<BTreeMap<DocumentKey, MutableDocument>> {
        self.persistence
            .run_transaction("Apply remote event", |txn| {
                self.apply_target_changes(txn, &event);

                let mut buffer = RemoteDocumentChangeBuffer::new(self.remote_documents.clone());
                for (key, doc) in &event.document_updates {
                    let existing = buffer.get(key);
                    let applies = !existing.is_valid_document()
                        || doc.version() > existing.version()
                        || (doc.version() == existing.version() && existing.has_pending_writes());
                    if applies {
                        let read_time = if event.snapshot_version.is_min() {
                            doc.version()
                        } else {
                            event.snapshot_version
                        };
                        buffer.add_entry(doc.clone(), read_time);
                        self.index_manager
                            .add_to_collection_parent_index(txn, &key.collection_path());
                    } else {
                        debug!(
                            "ignoring outdated watch update for {key} at {:?}",
                            doc.version()
                        );
                    }
                }

                let last_remote = self.target_cache.last_remote_snapshot_version();
                if !event.snapshot_version.is_min() && event.snapshot_version > last_remote {
                    self.target_cache
                        .set_last_remote_snapshot_version(txn, event.snapshot_version);
                }

                let changed_keys = buffer.apply_changes(txn);
                let changed_docs = self.remote_documents.get_all(changed_keys.iter());
                self.index_manager.update_index_entries(txn, changed_docs.values());
                Ok(self.local_documents.get_documents(changed_keys.iter()))
            })
            .await
    }

    fn apply_target_changes(&self, txn: &PersistenceTransaction, event: &RemoteEvent) {
        let mut active = self.active_targets.lock().unwrap();
        for (target_id, change) in &event.target_changes {
            let old = match active.get(target_id) {
                Some(old) => old.clone(),
                None => continue,
            };
            self.target_cache.remove_matching_keys(
                txn,
                change.removed_documents.iter().cloned(),
                *target_id,
            );
            let sequence_number = txn.sequence_number();
            for key in &change.removed_documents {
                if !self.target_cache.contains_key(key) {
                    self.target_cache
                        .update_document_sequence_number(txn, key.clone(), sequence_number);
                }
            }
            self.target_cache.add_matching_keys(
                txn,
                change.added_documents.iter().cloned(),
                *target_id,
            );

            let mut updated = old.clone().with_sequence_number(sequence_number);
            if event.target_mismatches.contains(target_id) {
                // Membership is suspect; restart the listen from scratch.
                updated = TargetData::new(
                    old.target.clone(),
                    *target_id,
                    sequence_number,
                    TargetPurpose::ExistenceFilterMismatch,
                );
            } else if self.should_persist_resume_token(&old, change, event.snapshot_version) {
                updated =
                    updated.with_resume_token(change.resume_token.clone(), event.snapshot_version);
            }
            if updated != old {
                self.target_cache.update_target_data(txn, updated.clone());
            }
            active.insert(*target_id, updated);
        }
    }

    /// Resume tokens arrive on nearly every watch message; only meaningful
    /// advances are worth a write.
    fn should_persist_resume_token(
        &self,
        old: &TargetData,
        change: &TargetChange,
        snapshot_version: SnapshotVersion,
    ) -> bool {
        if change.resume_token.is_empty() {
            return false;
        }
        if old.resume_token.is_empty() {
            return true;
        }
        let elapsed = snapshot_version.0.seconds - old.snapshot_version.0.seconds;
        if elapsed >= self.config.resume_token_max_age_seconds {
            return true;
        }
        if change.resume_token.len() != old.resume_token.len() {
            return true;
        }
        change.current && change.resume_token != old.resume_token
    }

    /// Persists a batch, recomputes overlays, and returns the optimistic
    /// local view of the written documents.
    pub async fn write_locally(&self, mutations: Vec<Mutation>) -> EngineResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> =
            mutations.iter().map(|mutation| mutation.key().clone()).collect();
        self.persistence
            .run_transaction("Locally write mutations", |txn| {
                let mut overlayed = self.overlayed_documents_with_masks(&keys);

                // Pre-image values keep transforms idempotent on replay.
                let mut base_mutations = Vec::new();
                for mutation in &mutations {
                    if let Some((doc, _)) = overlayed.get(mutation.key()) {
                        if let Some(base) = mutation.extract_base_value(doc) {
                            base_mutations.push(base);
                        }
                    }
                }

                let batch = self.mutation_queue.add_mutation_batch(
                    txn,
                    local_write_time,
                    base_mutations,
                    mutations.clone(),
                )?;

                let mut overlays = BTreeMap::new();
                let mut changes = BTreeMap::new();
                for (key, (mut doc, mask)) in std::mem::take(&mut overlayed) {
                    let mask = batch.apply_to_local_view(&mut doc, mask);
                    let overlay = calculate_overlay_mutation(&doc, mask.as_ref());
                    self.index_manager
                        .add_to_collection_parent_index(txn, &key.collection_path());
                    overlays.insert(key.clone(), overlay);
                    changes.insert(key, doc);
                }
                self.overlay_cache.save_overlays(txn, batch.batch_id, overlays);
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes,
                })
            })
            .await
    }

    /// Applies a backend acknowledgement: documents move to their committed
    /// versions, the batch leaves the queue, and overlays are recomputed
    /// from the batches that remain.
    pub async fn acknowledge_batch(
        &self,
        result: MutationBatchResult,
    ) -> EngineResult<BTreeMap<DocumentKey, MutableDocument>> {
        self.persistence
            .run_transaction("Acknowledge batch", |txn| {
                let batch = &result.batch;
                let keys = batch.keys();

                let mut buffer = RemoteDocumentChangeBuffer::new(self.remote_documents.clone());
                for (mutation, mutation_result) in
                    batch.mutations.iter().zip(result.mutation_results.iter())
                {
                    let mut doc = buffer.get(mutation.key());
                    mutation.apply_to_remote_document(&mut doc, mutation_result);
                    buffer.add_entry(doc, result.commit_version);
                }

                self.mutation_queue.remove_mutation_batch(txn, batch)?;
                self.mutation_queue
                    .set_last_stream_token(result.stream_token.clone());
                buffer.apply_changes(txn);

                self.overlay_cache
                    .remove_overlays_for_batch_id(txn, keys.iter().cloned(), batch.batch_id);
                self.recalculate_overlays(txn, &keys);

                let updated = self.remote_documents.get_all(keys.iter());
                self.index_manager.update_index_entries(txn, updated.values());
                Ok(self.local_documents.get_documents(keys.iter()))
            })
            .await
    }

    /// Drops a permanently rejected batch and rebuilds the local view from
    /// the remaining batches.
    pub async fn reject_batch(
        &self,
        batch_id: i32,
    ) -> EngineResult<BTreeMap<DocumentKey, MutableDocument>> {
        self.persistence
            .run_transaction("Reject batch", |txn| {
                let batch = self
                    .mutation_queue
                    .lookup_mutation_batch(batch_id)
                    .ok_or_else(|| invalid_argument(format!("rejected unknown batch {batch_id}")))?;
                let keys = batch.keys();
                self.mutation_queue.remove_mutation_batch(txn, &batch)?;
                self.overlay_cache
                    .remove_overlays_for_batch_id(txn, keys.iter().cloned(), batch_id);
                self.recalculate_overlays(txn, &keys);
                Ok(self.local_documents.get_documents(keys.iter()))
            })
            .await
    }

    /// Rebuilds overlays for `keys` by replaying the batches still in the
    /// queue over the remote document base. The batch log is authoritative;
    /// a crash between batch removal and this recompute loses nothing.
    fn recalculate_overlays(&self, txn: &PersistenceTransaction, keys: &BTreeSet<DocumentKey>) {
        let mut docs = self.remote_documents.get_all(keys.iter());
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = keys
            .iter()
            .map(|key| (key.clone(), Some(FieldMask::empty())))
            .collect();
        let mut largest_batch: BTreeMap<DocumentKey, i32> = BTreeMap::new();

        let batches: Vec<MutationBatch> = self
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(keys.iter());
        for batch in &batches {
            for key in batch.keys() {
                if !keys.contains(&key) {
                    continue;
                }
                if let Some(doc) = docs.get_mut(&key) {
                    let mask = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                    let mask = batch.apply_to_local_view(doc, mask);
                    masks.insert(key.clone(), mask);
                    largest_batch.insert(key, batch.batch_id);
                }
            }
        }

        let mut by_batch: BTreeMap<i32, BTreeMap<DocumentKey, Option<Mutation>>> = BTreeMap::new();
        for key in keys {
            let batch_id = largest_batch.get(key).copied().unwrap_or(-1);
            let overlay = match (largest_batch.contains_key(key), docs.get(key)) {
                (true, Some(doc)) => calculate_overlay_mutation(
                    doc,
                    masks.get(key).and_then(|mask| mask.as_ref()),
                ),
                _ => None,
            };
            by_batch.entry(batch_id).or_default().insert(key.clone(), overlay);
        }
        for (batch_id, overlays) in by_batch {
            self.overlay_cache.save_overlays(txn, batch_id, overlays);
        }
    }

    fn overlayed_documents_with_masks(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, (MutableDocument, Option<FieldMask>)> {
        let docs = self.remote_documents.get_all(keys.iter());
        docs.into_iter()
            .map(|(key, mut doc)| {
                let mask = match self.overlay_cache.overlay(&key) {
                    Some(overlay) => {
                        let mask = overlay.mutation.field_mask();
                        overlay.mutation.apply_to_local_view(
                            &mut doc,
                            Some(FieldMask::empty()),
                            Timestamp::now(),
                        );
                        mask
                    }
                    None => Some(FieldMask::empty()),
                };
                (key, (doc, mask))
            })
            .collect()
    }

    /// View feedback: advances the limbo-free snapshot for targets whose
    /// snapshots left cache mode, and records orphan candidates for GC.
    pub async fn notify_local_view_changes(
        &self,
        view_changes: Vec<LocalViewChanges>,
    ) -> EngineResult<()> {
        self.persistence
            .run_transaction("Notify local view changes", |txn| {
                let mut active = self.active_targets.lock().unwrap();
                for change in view_changes {
                    for key in &change.removed_keys {
                        if !self.target_cache.contains_key(key) {
                            self.target_cache.update_document_sequence_number(
                                txn,
                                key.clone(),
                                txn.sequence_number(),
                            );
                        }
                    }
                    if change.from_cache {
                        continue;
                    }
                    if let Some(data) = active.get(&change.target_id) {
                        let updated = data.clone().with_last_limbo_free_snapshot_version(
                            self.target_cache.last_remote_snapshot_version(),
                        );
                        self.target_cache.update_target_data(txn, updated.clone());
                        active.insert(change.target_id, updated);
                    }
                }
                Ok(())
            })
            .await
    }

    pub async fn read_document(&self, key: &DocumentKey) -> EngineResult<MutableDocument> {
        self.persistence
            .run_transaction("Read document", |_txn| {
                Ok(self.local_documents.get_document(key))
            })
            .await
    }

    /// Runs one garbage collection pass, shielding targets that are still
    /// allocated. Only the primary instance should call this.
    pub async fn collect_garbage(
        &self,
        collector: &LruGarbageCollector,
    ) -> EngineResult<LruResults> {
        let active = self.active_target_ids();
        self.persistence
            .run_transaction("Collect garbage", |txn| {
                Ok(collector.collect(txn, &active))
            })
            .await
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> i32 {
        self.mutation_queue.highest_unacknowledged_batch_id()
    }

    pub fn next_mutation_batch(&self, after_batch_id: i32) -> Option<MutationBatch> {
        self.mutation_queue
            .next_mutation_batch_after_batch_id(after_batch_id)
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.target_cache.last_remote_snapshot_version()
    }

    pub fn last_stream_token(&self) -> bytes::Bytes {
        self.mutation_queue.last_stream_token()
    }
}
