use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::OnceCell;

use crate::error::{internal_error, invalid_argument, EngineError, EngineResult};
use crate::local::{LocalStore, LocalViewChanges, TargetData, TargetPurpose};
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::mutation::{Mutation, MutationBatch, MutationBatchResult};
use crate::query::{Query, Target};
use crate::remote::{OnlineState, RemoteEvent, RemoteStore, RemoteSyncer};
use crate::sync::view::{
    DocumentChangeType, LimboDocumentChange, View, ViewSnapshot,
};
use crate::tabs::{MutationBatchState, QueryTargetState, SharedClientState};
use crate::util::runtime;

/// Default cap on concurrently listened limbo resolutions. Documents past
/// the cap wait in a queue.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Everything the sync engine pushes out to the application.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    Snapshot(ViewSnapshot),
    ListenError { query: Query, error: EngineError },
    OnlineStateChanged(OnlineState),
}

struct QueryView {
    query: Query,
    target_id: i32,
    view: View,
}

/// Tracks one outstanding single-document listen for a limbo document.
struct LimboResolution {
    key: DocumentKey,
    /// Set once the backend mentioned the document at all; distinguishes
    /// "backend said nothing yet" from "backend says it does not exist".
    received_document: bool,
}

#[derive(Default)]
struct ViewState {
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<i32, Query>,
}

struct LimboState {
    targets_by_key: BTreeMap<DocumentKey, i32>,
    resolutions_by_target: BTreeMap<i32, LimboResolution>,
    enqueued_keys: VecDeque<DocumentKey>,
    /// Limbo target ids are odd and engine-local so they can never collide
    /// with the even ids the target cache allocates.
    next_target_id: i32,
}

impl Default for LimboState {
    fn default() -> Self {
        Self {
            targets_by_key: BTreeMap::new(),
            resolutions_by_target: BTreeMap::new(),
            enqueued_keys: VecDeque::new(),
            next_target_id: -1,
        }
    }
}

impl LimboState {
    fn allocate_target_id(&mut self) -> i32 {
        self.next_target_id += 2;
        self.next_target_id
    }
}

#[derive(Default)]
struct WriteState {
    /// Ack/reject callbacks per batch id, resolved in batch order.
    mutation_callbacks: BTreeMap<i32, Vec<async_channel::Sender<EngineResult<()>>>>,
}

/// Coordinates the local store, the remote store, and all active query
/// views: local writes surface optimistically, remote events fold into the
/// cache and re-emit affected views, and limbo documents get resolved with
/// bounded single-document listens.
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
    events: async_channel::Receiver<SyncEvent>,
}

struct SyncEngineInner {
    local_store: Arc<LocalStore>,
    remote_store: OnceCell<RemoteStore>,
    shared_client_state: OnceCell<Arc<SharedClientState>>,
    views: Mutex<ViewState>,
    limbo: std::sync::Mutex<LimboState>,
    writes: std::sync::Mutex<WriteState>,
    online_state: std::sync::Mutex<OnlineState>,
    events_tx: async_channel::Sender<SyncEvent>,
    max_concurrent_limbo_resolutions: usize,
}

impl SyncEngine {
    /// Builds the engine and wires it to `wire_remote_store` as its
    /// [`RemoteSyncer`]. The closure receives the syncer bridge so callers
    /// control how the remote store is constructed (tests swap transports).
    pub fn new<F>(local_store: Arc<LocalStore>, wire_remote_store: F) -> EngineResult<Self>
    where
        F: FnOnce(Arc<dyn RemoteSyncer>) -> RemoteStore,
    {
        Self::with_limbo_limit(
            local_store,
            DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            wire_remote_store,
        )
    }

    pub fn with_limbo_limit<F>(
        local_store: Arc<LocalStore>,
        max_concurrent_limbo_resolutions: usize,
        wire_remote_store: F,
    ) -> EngineResult<Self>
    where
        F: FnOnce(Arc<dyn RemoteSyncer>) -> RemoteStore,
    {
        let (events_tx, events) = async_channel::unbounded();
        let inner = Arc::new(SyncEngineInner {
            local_store,
            remote_store: OnceCell::new(),
            shared_client_state: OnceCell::new(),
            views: Mutex::new(ViewState::default()),
            limbo: std::sync::Mutex::new(LimboState::default()),
            writes: std::sync::Mutex::new(WriteState::default()),
            online_state: std::sync::Mutex::new(OnlineState::Unknown),
            events_tx,
            max_concurrent_limbo_resolutions,
        });
        let bridge: Arc<dyn RemoteSyncer> = Arc::new(SyncerBridge {
            inner: Arc::downgrade(&inner),
        });
        let remote_store = wire_remote_store(bridge);
        inner
            .remote_store
            .set(remote_store)
            .map_err(|_| internal_error("remote store wired twice"))?;
        Ok(Self { inner, events })
    }

    /// Receiver for view snapshots, listen errors, and online state changes.
    pub fn events(&self) -> async_channel::Receiver<SyncEvent> {
        self.events.clone()
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.inner.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        self.inner.remote_store()
    }

    pub fn online_state(&self) -> OnlineState {
        *self.inner.online_state.lock().unwrap()
    }

    /// Starts listening to `query` and returns the initial snapshot, served
    /// from cache until the backend marks the target current.
    pub async fn listen(&self, query: Query) -> EngineResult<ViewSnapshot> {
        self.inner.listen(query).await
    }

    pub async fn unlisten(&self, query: &Query) -> EngineResult<()> {
        self.inner.unlisten(query).await
    }

    /// Writes `mutations` locally, emits the optimistic snapshots, and
    /// queues the batch for the backend. The returned receiver resolves when
    /// the backend acknowledges or permanently rejects the batch.
    pub async fn write_mutations(
        &self,
        mutations: Vec<Mutation>,
    ) -> EngineResult<async_channel::Receiver<EngineResult<()>>> {
        self.inner.write_mutations(mutations).await
    }

    /// Resolves once every write pending at the time of the call has been
    /// acknowledged or rejected. Resolves immediately when the queue is
    /// empty.
    pub async fn wait_for_pending_writes(
        &self,
    ) -> EngineResult<async_channel::Receiver<EngineResult<()>>> {
        self.inner.wait_for_pending_writes().await
    }

    /// Joins this engine to a shared client state: batch and target
    /// progress is broadcast to sibling instances, and the engine's network
    /// use follows the primary lease (only the primary holds streams).
    pub fn bind_shared_client_state(
        &self,
        shared: Arc<SharedClientState>,
    ) -> EngineResult<()> {
        let weak = Arc::downgrade(&self.inner);
        shared.set_primary_state_callback(Arc::new(move |is_primary| {
            let Some(inner) = weak.upgrade() else { return };
            runtime::spawn_detached(async move {
                let result = if is_primary {
                    inner.remote_store().enable_network().await
                } else {
                    inner.remote_store().disable_network().await
                };
                if let Err(error) = result {
                    warn!("failed to apply primary lease transition: {error}");
                }
            });
        }));
        self.inner
            .shared_client_state
            .set(shared)
            .map_err(|_| internal_error("shared client state bound twice"))
    }
}

impl SyncEngineInner {
    fn remote_store(&self) -> &RemoteStore {
        // Set in the constructor before the engine is handed out.
        self.remote_store.get().unwrap()
    }

    async fn listen(self: &Arc<Self>, query: Query) -> EngineResult<ViewSnapshot> {
        let canonical_id = query.to_target().canonical_id();
        {
            let views = self.views.lock().await;
            if views.query_views.contains_key(&canonical_id) {
                return Err(invalid_argument(format!(
                    "already listening to query {canonical_id}"
                )));
            }
        }

        let target_data = self.local_store.allocate_target(query.to_target()).await?;
        let target_id = target_data.target_id;
        let result = self.local_store.execute_query(&query, true).await?;

        let mut view = View::new(query.clone(), result.remote_keys);
        let computed = view.compute_doc_changes(&result.documents, None);
        let change = view.apply_changes(computed, None);
        let snapshot = change
            .snapshot
            .ok_or_else(|| internal_error("initial view apply produced no snapshot"))?;
        debug!(
            "listen target={} query={} initial_docs={}",
            target_id,
            canonical_id,
            snapshot.documents.len()
        );

        {
            let mut views = self.views.lock().await;
            views.query_views.insert(
                canonical_id,
                QueryView {
                    query: query.clone(),
                    target_id,
                    view,
                },
            );
            views.queries_by_target.insert(target_id, query);
        }
        self.remote_store().listen(&target_data).await?;
        Ok(snapshot)
    }

    async fn unlisten(self: &Arc<Self>, query: &Query) -> EngineResult<()> {
        let canonical_id = query.to_target().canonical_id();
        let removed = {
            let mut views = self.views.lock().await;
            let removed = views.query_views.remove(&canonical_id);
            if let Some(view) = &removed {
                views.queries_by_target.remove(&view.target_id);
            }
            removed
        };
        let query_view = removed
            .ok_or_else(|| invalid_argument(format!("not listening to query {canonical_id}")))?;

        // Limbo listens that only this view justified are torn down with it.
        let limbo_removed: Vec<LimboDocumentChange> = query_view
            .view
            .limbo_documents()
            .iter()
            .map(|key| LimboDocumentChange::Removed(key.clone()))
            .collect();
        self.update_tracked_limbo_documents(limbo_removed).await?;

        self.local_store
            .release_target(query_view.target_id, true)
            .await?;
        self.remote_store().unlisten(query_view.target_id).await
    }

    async fn write_mutations(
        self: &Arc<Self>,
        mutations: Vec<Mutation>,
    ) -> EngineResult<async_channel::Receiver<EngineResult<()>>> {
        let result = self.local_store.write_locally(mutations).await?;
        let (tx, rx) = async_channel::bounded(1);
        self.writes
            .lock()
            .unwrap()
            .mutation_callbacks
            .entry(result.batch_id)
            .or_default()
            .push(tx);

        if let Some(shared) = self.shared_client_state.get() {
            shared.notify_mutation_batch(result.batch_id, MutationBatchState::Pending);
        }
        self.emit_new_snapshots_and_notify(result.changes, None)
            .await?;
        self.remote_store().fill_write_pipeline().await?;
        Ok(rx)
    }

    async fn wait_for_pending_writes(
        self: &Arc<Self>,
    ) -> EngineResult<async_channel::Receiver<EngineResult<()>>> {
        let (tx, rx) = async_channel::bounded(1);
        let highest = self.local_store.get_highest_unacknowledged_batch_id();
        if highest < 0 {
            // try_send on a fresh bounded(1) channel cannot fail.
            let _ = tx.try_send(Ok(()));
            return Ok(rx);
        }
        self.writes
            .lock()
            .unwrap()
            .mutation_callbacks
            .entry(highest)
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn resolve_mutation_callbacks(&self, batch_id: i32, result: &EngineResult<()>) {
        let callbacks = {
            let mut writes = self.writes.lock().unwrap();
            let acked: Vec<i32> = writes
                .mutation_callbacks
                .range(..=batch_id)
                .map(|(id, _)| *id)
                .collect();
            let mut callbacks = Vec::new();
            for id in acked {
                if let Some(mut senders) = writes.mutation_callbacks.remove(&id) {
                    callbacks.append(&mut senders);
                }
            }
            callbacks
        };
        for callback in callbacks {
            let _ = callback.try_send(result.clone());
        }
    }

    /// Recomputes every active view against `changes`, delivers the
    /// resulting snapshots, maintains limbo listens, and feeds view-level
    /// membership back to the local store.
    async fn emit_new_snapshots_and_notify(
        self: &Arc<Self>,
        changes: BTreeMap<DocumentKey, MutableDocument>,
        remote_event: Option<&RemoteEvent>,
    ) -> EngineResult<()> {
        let mut snapshots = Vec::new();
        let mut limbo_changes = Vec::new();
        let mut local_view_changes = Vec::new();

        {
            let mut views = self.views.lock().await;
            for query_view in views.query_views.values_mut() {
                let mut computed = query_view.view.compute_doc_changes(&changes, None);
                if computed.needs_refill {
                    // A limit boundary moved; only a requery knows which
                    // cached document gets promoted.
                    let requeried = self
                        .local_store
                        .execute_query(&query_view.query, false)
                        .await?;
                    computed = query_view
                        .view
                        .compute_doc_changes(&requeried.documents, Some(computed));
                }
                let target_change = remote_event
                    .and_then(|event| event.target_changes.get(&query_view.target_id));
                let view_change = query_view.view.apply_changes(computed, target_change);
                limbo_changes.extend(view_change.limbo_changes);

                if let Some(snapshot) = view_change.snapshot {
                    let mut added_keys = BTreeSet::new();
                    let mut removed_keys = BTreeSet::new();
                    for change in &snapshot.changes {
                        match change.change_type {
                            DocumentChangeType::Added => {
                                added_keys.insert(change.document.key().clone());
                            }
                            DocumentChangeType::Removed => {
                                removed_keys.insert(change.document.key().clone());
                            }
                            _ => {}
                        }
                    }
                    local_view_changes.push(LocalViewChanges {
                        target_id: query_view.target_id,
                        from_cache: snapshot.from_cache,
                        added_keys,
                        removed_keys,
                    });
                    snapshots.push(snapshot);
                }
            }
        }

        self.update_tracked_limbo_documents(limbo_changes).await?;
        if !local_view_changes.is_empty() {
            self.local_store
                .notify_local_view_changes(local_view_changes)
                .await?;
        }
        for snapshot in snapshots {
            let _ = self.events_tx.try_send(SyncEvent::Snapshot(snapshot));
        }
        Ok(())
    }

    async fn update_tracked_limbo_documents(
        self: &Arc<Self>,
        changes: Vec<LimboDocumentChange>,
    ) -> EngineResult<()> {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    let tracked = {
                        let mut limbo = self.limbo.lock().unwrap();
                        if limbo.targets_by_key.contains_key(&key)
                            || limbo.enqueued_keys.contains(&key)
                        {
                            true
                        } else {
                            limbo.enqueued_keys.push_back(key.clone());
                            false
                        }
                    };
                    if !tracked {
                        debug!("limbo document enqueued: {key}");
                    }
                }
                LimboDocumentChange::Removed(key) => {
                    let target_id = {
                        let mut limbo = self.limbo.lock().unwrap();
                        limbo.enqueued_keys.retain(|queued| queued != &key);
                        match limbo.targets_by_key.remove(&key) {
                            Some(target_id) => {
                                limbo.resolutions_by_target.remove(&target_id);
                                Some(target_id)
                            }
                            None => None,
                        }
                    };
                    if let Some(target_id) = target_id {
                        self.remote_store().unlisten(target_id).await?;
                    }
                }
            }
        }
        self.pump_limbo_resolutions().await
    }

    /// Starts listens for queued limbo documents up to the concurrency cap.
    async fn pump_limbo_resolutions(self: &Arc<Self>) -> EngineResult<()> {
        loop {
            let next = {
                let mut limbo = self.limbo.lock().unwrap();
                if limbo.resolutions_by_target.len() >= self.max_concurrent_limbo_resolutions {
                    break;
                }
                match limbo.enqueued_keys.pop_front() {
                    Some(key) => {
                        let target_id = limbo.allocate_target_id();
                        limbo.targets_by_key.insert(key.clone(), target_id);
                        limbo.resolutions_by_target.insert(
                            target_id,
                            LimboResolution {
                                key: key.clone(),
                                received_document: false,
                            },
                        );
                        Some((key, target_id))
                    }
                    None => None,
                }
            };
            let Some((key, target_id)) = next else { break };
            debug!("limbo resolution started: target={target_id} key={key}");
            let target_data = TargetData::new(
                Target::for_document(&key),
                target_id,
                0,
                TargetPurpose::LimboResolution,
            );
            self.remote_store().listen(&target_data).await?;
        }
        Ok(())
    }

    async fn apply_remote_event(self: &Arc<Self>, event: RemoteEvent) -> EngineResult<()> {
        {
            let mut limbo = self.limbo.lock().unwrap();
            for (target_id, change) in &event.target_changes {
                if let Some(resolution) = limbo.resolutions_by_target.get_mut(target_id) {
                    if change.has_changes() {
                        resolution.received_document = true;
                    }
                }
            }
        }
        let changes = self.local_store.apply_remote_event(event.clone()).await?;
        if let Some(shared) = self.shared_client_state.get() {
            for (target_id, change) in &event.target_changes {
                let state = if change.current {
                    QueryTargetState::Current
                } else {
                    QueryTargetState::NotCurrent
                };
                shared.notify_target_state(*target_id, state);
            }
        }
        self.emit_new_snapshots_and_notify(changes, Some(&event))
            .await
    }

    async fn reject_listen(
        self: &Arc<Self>,
        target_id: i32,
        error: EngineError,
    ) -> EngineResult<()> {
        let limbo_key = {
            let mut limbo = self.limbo.lock().unwrap();
            match limbo.resolutions_by_target.remove(&target_id) {
                Some(resolution) => {
                    limbo.targets_by_key.remove(&resolution.key);
                    Some(resolution.key)
                }
                None => None,
            }
        };

        if let Some(key) = limbo_key {
            // The limbo listen itself failed; treat the document as deleted
            // so the view converges instead of waiting forever.
            warn!("limbo resolution for {key} failed: {error}");
            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::MIN,
                ..RemoteEvent::default()
            };
            event.document_updates.insert(
                key.clone(),
                MutableDocument::no_document(key.clone(), SnapshotVersion::MIN),
            );
            event.resolved_limbo_documents.insert(key);
            let changes = self.local_store.apply_remote_event(event.clone()).await?;
            self.emit_new_snapshots_and_notify(changes, Some(&event))
                .await?;
            return self.pump_limbo_resolutions().await;
        }

        let query = {
            let mut views = self.views.lock().await;
            match views.queries_by_target.remove(&target_id) {
                Some(query) => {
                    views
                        .query_views
                        .remove(&query.to_target().canonical_id());
                    Some(query)
                }
                None => None,
            }
        };
        if let Some(query) = query {
            warn!("listen for target {target_id} rejected: {error}");
            self.local_store.release_target(target_id, true).await?;
            if let Some(shared) = self.shared_client_state.get() {
                shared.notify_target_state(target_id, QueryTargetState::Rejected(error.clone()));
            }
            let _ = self
                .events_tx
                .try_send(SyncEvent::ListenError { query, error });
        }
        Ok(())
    }

    async fn apply_successful_write(
        self: &Arc<Self>,
        result: MutationBatchResult,
    ) -> EngineResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(result).await?;
        self.resolve_mutation_callbacks(batch_id, &Ok(()));
        if let Some(shared) = self.shared_client_state.get() {
            shared.notify_mutation_batch(batch_id, MutationBatchState::Acknowledged);
        }
        self.emit_new_snapshots_and_notify(changes, None).await
    }

    async fn reject_failed_write(
        self: &Arc<Self>,
        batch_id: i32,
        error: EngineError,
    ) -> EngineResult<()> {
        let changes = self.local_store.reject_batch(batch_id).await?;
        if let Some(shared) = self.shared_client_state.get() {
            shared.notify_mutation_batch(batch_id, MutationBatchState::Rejected(error.clone()));
        }
        self.resolve_mutation_callbacks(batch_id, &Err(error));
        self.emit_new_snapshots_and_notify(changes, None).await
    }

    async fn handle_online_state_change(self: &Arc<Self>, state: OnlineState) {
        {
            let mut current = self.online_state.lock().unwrap();
            if *current == state {
                return;
            }
            *current = state;
        }
        let snapshots = {
            let mut views = self.views.lock().await;
            let mut snapshots = Vec::new();
            for query_view in views.query_views.values_mut() {
                if let Some(snapshot) = query_view.view.apply_online_state_change(state) {
                    snapshots.push(snapshot);
                }
            }
            snapshots
        };
        for snapshot in snapshots {
            let _ = self.events_tx.try_send(SyncEvent::Snapshot(snapshot));
        }
        let _ = self.events_tx.try_send(SyncEvent::OnlineStateChanged(state));
    }
}

/// [`RemoteSyncer`] implementation handed to the remote store. Holds the
/// engine weakly so shutdown order cannot leak the engine through the
/// remote store's delegate.
struct SyncerBridge {
    inner: Weak<SyncEngineInner>,
}

impl SyncerBridge {
    fn upgrade(&self) -> EngineResult<Arc<SyncEngineInner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| internal_error("sync engine dropped"))
    }
}

#[async_trait]
impl RemoteSyncer for SyncerBridge {
    async fn apply_remote_event(&self, event: RemoteEvent) -> EngineResult<()> {
        self.upgrade()?.apply_remote_event(event).await
    }

    async fn reject_listen(&self, target_id: i32, error: EngineError) -> EngineResult<()> {
        self.upgrade()?.reject_listen(target_id, error).await
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> EngineResult<()> {
        self.upgrade()?.apply_successful_write(result).await
    }

    async fn reject_failed_write(&self, batch_id: i32, error: EngineError) -> EngineResult<()> {
        self.upgrade()?.reject_failed_write(batch_id, error).await
    }

    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        let Some(inner) = self.inner.upgrade() else {
            return BTreeSet::new();
        };
        {
            let limbo = inner.limbo.lock().unwrap();
            if let Some(resolution) = limbo.resolutions_by_target.get(&target_id) {
                let mut keys = BTreeSet::new();
                if resolution.received_document {
                    keys.insert(resolution.key.clone());
                }
                return keys;
            }
        }
        inner
            .local_store
            .target_cache()
            .matching_keys_for_target(target_id)
    }

    fn get_target_data(&self, target_id: i32) -> Option<TargetData> {
        let inner = self.inner.upgrade()?;
        {
            let limbo = inner.limbo.lock().unwrap();
            if let Some(resolution) = limbo.resolutions_by_target.get(&target_id) {
                return Some(TargetData::new(
                    Target::for_document(&resolution.key),
                    target_id,
                    0,
                    TargetPurpose::LimboResolution,
                ));
            }
        }
        inner
            .local_store
            .target_cache()
            .get_target_data_for_id(target_id)
    }

    async fn next_mutation_batch(&self, after_batch_id: i32) -> EngineResult<Option<MutationBatch>> {
        Ok(self.upgrade()?.local_store.next_mutation_batch(after_batch_id))
    }

    async fn handle_online_state_change(&self, state: OnlineState) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_online_state_change(state).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalStoreConfig, MemoryPersistence, User};
    use crate::model::ResourcePath;
    use crate::remote::{Connection, InMemoryTransport, NoopCredentialsProvider, WireDatastore};
    use crate::util::backoff::BackoffConfig;
    use crate::value::{object_from_pairs, FieldValue};

    fn engine() -> (SyncEngine, Arc<Connection>) {
        let (client, server) = InMemoryTransport::pair();
        let server_connection = Arc::new(Connection::new(server));
        let local_store = Arc::new(LocalStore::new(
            Arc::new(MemoryPersistence::new()),
            User::unauthenticated(),
            LocalStoreConfig::default(),
        ));
        let engine = SyncEngine::new(local_store, |syncer| {
            RemoteStore::new(
                Arc::new(WireDatastore::new(Arc::new(Connection::new(client)))),
                Arc::new(NoopCredentialsProvider),
                syncer,
                BackoffConfig::default(),
            )
        })
        .unwrap();
        (engine, server_connection)
    }

    fn cities_query() -> Query {
        Query::collection(ResourcePath::from_string("cities").unwrap())
    }

    fn set_mutation(path: &str, population: i64) -> Mutation {
        Mutation::set(
            DocumentKey::from_string(path).unwrap(),
            object_from_pairs([("population", FieldValue::Integer(population))]),
        )
    }

    #[tokio::test]
    async fn listen_serves_cached_writes_from_cache() {
        let (engine, _server) = engine();
        engine
            .write_mutations(vec![set_mutation("cities/sf", 100)])
            .await
            .unwrap();

        let snapshot = engine.listen(cities_query()).await.unwrap();
        assert_eq!(snapshot.documents.len(), 1);
        assert_eq!(snapshot.documents[0].key().id(), "sf");
        assert!(snapshot.from_cache);
        assert!(snapshot.has_pending_writes);
    }

    #[tokio::test]
    async fn local_writes_emit_snapshots_to_active_views() {
        let (engine, _server) = engine();
        let events = engine.events();
        let initial = engine.listen(cities_query()).await.unwrap();
        assert!(initial.documents.is_empty());

        engine
            .write_mutations(vec![set_mutation("cities/la", 50)])
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        match event {
            SyncEvent::Snapshot(snapshot) => {
                assert_eq!(snapshot.documents.len(), 1);
                assert_eq!(snapshot.changes.len(), 1);
                assert_eq!(
                    snapshot.changes[0].change_type,
                    DocumentChangeType::Added
                );
            }
            other => panic!("expected a snapshot event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_listen_is_rejected() {
        let (engine, _server) = engine();
        engine.listen(cities_query()).await.unwrap();
        let error = engine.listen(cities_query()).await.unwrap_err();
        assert_eq!(error.code, crate::error::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn unlisten_allows_listening_again() {
        let (engine, _server) = engine();
        engine.listen(cities_query()).await.unwrap();
        engine.unlisten(&cities_query()).await.unwrap();
        engine.listen(cities_query()).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_pending_writes_resolves_on_an_empty_queue() {
        let (engine, _server) = engine();
        let done = engine.wait_for_pending_writes().await.unwrap();
        done.recv().await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn mutation_progress_is_broadcast_to_sibling_instances() {
        use crate::tabs::{ClientStateMessage, InMemoryClientStateBus, InMemoryLeaseStore};

        let (engine, _server) = engine();
        let bus = InMemoryClientStateBus::new();
        let shared = SharedClientState::new(bus.clone(), InMemoryLeaseStore::new());
        engine.bind_shared_client_state(Arc::clone(&shared)).unwrap();

        let sibling = SharedClientState::new(bus, InMemoryLeaseStore::new());
        let inbox = sibling.messages();

        engine
            .write_mutations(vec![set_mutation("cities/sf", 100)])
            .await
            .unwrap();

        match inbox.recv().await.unwrap() {
            ClientStateMessage::MutationBatch {
                client_id,
                batch_id,
                state: MutationBatchState::Pending,
            } => {
                assert_eq!(client_id, shared.client_id());
                assert_eq!(batch_id, 1);
            }
            other => panic!("expected a pending batch broadcast, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn losing_the_primary_lease_takes_the_engine_offline() {
        use crate::tabs::{InMemoryClientStateBus, InMemoryLeaseStore};
        use std::time::Duration;

        let (engine, _server) = engine();
        let shared =
            SharedClientState::new(InMemoryClientStateBus::new(), InMemoryLeaseStore::new());
        engine.bind_shared_client_state(Arc::clone(&shared)).unwrap();

        shared.tick();
        assert!(shared.is_primary());

        // Releasing the lease demotes the instance, which drops the
        // engine's network use.
        shared.shutdown();
        let mut state = engine.online_state();
        for _ in 0..100 {
            if state == OnlineState::Offline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = engine.online_state();
        }
        assert_eq!(state, OnlineState::Offline);
    }
}
