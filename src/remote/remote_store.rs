use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::error::{internal_error, EngineError, EngineResult};
use crate::local::TargetData;
use crate::model::{DocumentKey, SnapshotVersion};
use crate::mutation::{MutationBatch, MutationBatchResult};
use crate::remote::aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::remote::datastore::{CredentialsArc, Datastore};
use crate::remote::listen_stream::{ListenStream, ListenStreamDelegate, WatchTarget};
use crate::remote::online_state::{OnlineState, OnlineStateTracker};
use crate::remote::remote_event::RemoteEvent;
use crate::remote::remote_syncer::RemoteSyncer;
use crate::remote::watch_change::{TargetChangeState, WatchChange};
use crate::remote::write_stream::{WriteResponse, WriteStream, WriteStreamDelegate};
use crate::util::backoff::BackoffConfig;
use crate::util::runtime;

/// Upper bound on unacknowledged batches in flight on the write stream.
pub const MAX_PENDING_WRITES: usize = 10;

/// Reasons the remote store keeps its streams down. Network use resumes only
/// once the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    Shutdown,
}

struct SyncerMetadataProvider {
    syncer: Arc<dyn RemoteSyncer>,
}

impl TargetMetadataProvider for SyncerMetadataProvider {
    fn get_remote_keys(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data(&self, target_id: i32) -> Option<TargetData> {
        self.syncer.get_target_data(target_id)
    }
}

struct RemoteStoreState {
    listen_targets: BTreeMap<i32, WatchTarget>,
    watch_stream: Option<Arc<ListenStream<WatchDelegate>>>,
    write_stream: Option<Arc<WriteStream<WriteDelegate>>>,
    aggregator: Option<WatchChangeAggregator<SyncerMetadataProvider>>,
    write_pipeline: VecDeque<MutationBatch>,
    last_batch_id: i32,
    offline_causes: BTreeSet<OfflineCause>,
}

impl Default for RemoteStoreState {
    fn default() -> Self {
        Self {
            listen_targets: BTreeMap::new(),
            watch_stream: None,
            write_stream: None,
            aggregator: None,
            write_pipeline: VecDeque::new(),
            last_batch_id: -1,
            offline_causes: BTreeSet::new(),
        }
    }
}

/// Coordinates the listen and write streams against the sync engine.
///
/// Streams are lazy: the watch stream runs only while there are listen
/// targets, the write stream only while batches wait in the pipeline. Both
/// restart themselves; this type re-registers targets and re-sends
/// unacknowledged batches after every reconnect.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        credentials: CredentialsArc,
        syncer: Arc<dyn RemoteSyncer>,
        backoff: BackoffConfig,
    ) -> Self {
        let tracker_syncer = Arc::clone(&syncer);
        let online_state = OnlineStateTracker::new(Arc::new(move |state| {
            let syncer = Arc::clone(&tracker_syncer);
            runtime::spawn_detached(async move {
                syncer.handle_online_state_change(state).await;
            });
        }));
        let inner = Arc::new(RemoteStoreInner {
            state: Mutex::new(RemoteStoreState::default()),
            datastore,
            credentials,
            backoff,
            syncer,
            online_state,
        });
        Self { inner }
    }

    pub async fn enable_network(&self) -> EngineResult<()> {
        self.inner.enable_network().await
    }

    pub async fn disable_network(&self) -> EngineResult<()> {
        self.inner
            .disable_network(OfflineCause::UserDisabled)
            .await
    }

    pub async fn shutdown(&self) -> EngineResult<()> {
        self.inner.disable_network(OfflineCause::Shutdown).await
    }

    /// Starts (or queues, while offline) a server-side listen.
    pub async fn listen(&self, target_data: &TargetData) -> EngineResult<()> {
        self.inner.listen(WatchTarget::from(target_data)).await
    }

    pub async fn unlisten(&self, target_id: i32) -> EngineResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Polls the mutation queue and pushes pending batches onto the write
    /// stream, up to [`MAX_PENDING_WRITES`] in flight.
    pub async fn fill_write_pipeline(&self) -> EngineResult<()> {
        self.inner.fill_write_pipeline().await
    }

    pub async fn handle_credential_change(&self) -> EngineResult<()> {
        self.inner.handle_credential_change().await
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state.current()
    }
}

struct RemoteStoreInner {
    state: Mutex<RemoteStoreState>,
    datastore: Arc<dyn Datastore>,
    credentials: CredentialsArc,
    backoff: BackoffConfig,
    syncer: Arc<dyn RemoteSyncer>,
    online_state: Arc<OnlineStateTracker>,
}

impl RemoteStoreInner {
    async fn enable_network(self: &Arc<Self>) -> EngineResult<()> {
        {
            let mut state = self.state.lock().await;
            state.offline_causes.remove(&OfflineCause::UserDisabled);
            state.offline_causes.remove(&OfflineCause::CredentialChange);
        }
        self.online_state.set(OnlineState::Unknown);
        self.ensure_streams().await
    }

    async fn disable_network(self: &Arc<Self>, cause: OfflineCause) -> EngineResult<()> {
        {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(cause);
            Self::stop_streams_locked(&mut state);
        }
        self.online_state.set(OnlineState::Offline);
        Ok(())
    }

    async fn listen(self: &Arc<Self>, target: WatchTarget) -> EngineResult<()> {
        let target_id = target.target_id;
        let stream = {
            let mut state = self.state.lock().await;
            if state.listen_targets.contains_key(&target_id) {
                return Ok(());
            }
            state.listen_targets.insert(target_id, target.clone());
            if let Some(aggregator) = state.aggregator.as_mut() {
                aggregator.record_pending_target_request(target_id);
            }
            state.watch_stream.clone()
        };

        if let Some(stream) = stream {
            stream.watch(target).await
        } else {
            self.start_watch_stream().await
        }
    }

    async fn unlisten(self: &Arc<Self>, target_id: i32) -> EngineResult<()> {
        let (stream, now_empty) = {
            let mut state = self.state.lock().await;
            state.listen_targets.remove(&target_id);
            if let Some(aggregator) = state.aggregator.as_mut() {
                aggregator.remove_target(target_id);
            }
            (state.watch_stream.clone(), state.listen_targets.is_empty())
        };

        if let Some(stream) = stream {
            stream.unwatch(target_id).await?;
            if now_empty {
                let mut state = self.state.lock().await;
                if state.listen_targets.is_empty() {
                    if let Some(stream) = state.watch_stream.take() {
                        stream.stop();
                    }
                    state.aggregator = None;
                }
            }
        }
        Ok(())
    }

    async fn handle_credential_change(self: &Arc<Self>) -> EngineResult<()> {
        self.syncer.handle_credential_change().await?;
        self.disable_network(OfflineCause::CredentialChange).await?;
        self.enable_network().await
    }

    async fn ensure_streams(self: &Arc<Self>) -> EngineResult<()> {
        self.start_watch_stream().await?;
        self.fill_write_pipeline().await
    }

    async fn start_watch_stream(self: &Arc<Self>) -> EngineResult<()> {
        let started = {
            let mut state = self.state.lock().await;
            if !Self::can_use_network(&state)
                || state.watch_stream.is_some()
                || state.listen_targets.is_empty()
            {
                None
            } else {
                let delegate = Arc::new(WatchDelegate {
                    inner: Arc::downgrade(self),
                });
                let stream = Arc::new(ListenStream::new(
                    Arc::clone(&self.datastore),
                    Arc::clone(&self.credentials),
                    self.backoff,
                    delegate,
                ));
                state.watch_stream = Some(Arc::clone(&stream));
                let targets: Vec<WatchTarget> = state.listen_targets.values().cloned().collect();
                Some((stream, targets))
            }
        };

        if let Some((stream, targets)) = started {
            self.online_state.handle_watch_stream_start();
            // A new stream knows nothing about the session's targets; every
            // registered listen is replayed over it, resuming from the
            // persisted token where one exists.
            for target in targets {
                let target = match self.syncer.get_target_data(target.target_id) {
                    Some(data) => WatchTarget::from(&data),
                    None => target,
                };
                stream.watch(target).await?;
            }
        }
        Ok(())
    }

    async fn start_write_stream(self: &Arc<Self>) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        if !Self::can_use_network(&state)
            || state.write_stream.is_some()
            || state.write_pipeline.is_empty()
        {
            return Ok(());
        }
        let delegate = Arc::new(WriteDelegate {
            inner: Arc::downgrade(self),
        });
        let stream = Arc::new(WriteStream::new(
            Arc::clone(&self.datastore),
            Arc::clone(&self.credentials),
            self.backoff,
            Vec::new(),
            delegate,
        ));
        state.write_stream = Some(stream);
        Ok(())
    }

    async fn fill_write_pipeline(self: &Arc<Self>) -> EngineResult<()> {
        loop {
            let (should_fetch, last_batch_id) = {
                let state = self.state.lock().await;
                (
                    Self::can_use_network(&state)
                        && state.write_pipeline.len() < MAX_PENDING_WRITES,
                    state.last_batch_id,
                )
            };

            if !should_fetch {
                break;
            }

            let batch = match self.syncer.next_mutation_batch(last_batch_id).await? {
                Some(batch) => batch,
                None => break,
            };

            let writes = batch.mutations.clone();
            let (stream, handshake_complete) = {
                let mut state = self.state.lock().await;
                state.last_batch_id = batch.batch_id;
                state.write_pipeline.push_back(batch);
                let handshake = match state.write_stream.as_ref() {
                    Some(stream) => stream.handshake_complete().await,
                    None => false,
                };
                (state.write_stream.clone(), handshake)
            };

            match stream {
                Some(stream) if handshake_complete => stream.write(writes).await?,
                Some(_) => {}
                None => self.start_write_stream().await?,
            }
        }
        Ok(())
    }

    async fn on_watch_stream_open(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        let provider = Arc::new(SyncerMetadataProvider {
            syncer: Arc::clone(&self.syncer),
        });
        let mut aggregator = WatchChangeAggregator::new(provider);
        for target_id in state.listen_targets.keys() {
            aggregator.record_pending_target_request(*target_id);
        }
        state.aggregator = Some(aggregator);
    }

    async fn on_watch_change(self: &Arc<Self>, change: WatchChange) -> EngineResult<()> {
        self.online_state.handle_watch_stream_message();

        if let WatchChange::TargetChange(target_change) = &change {
            if let Some(status) = target_change.cause.clone() {
                return self
                    .handle_target_error(target_change.target_ids.clone(), status.to_error())
                    .await;
            }
        }

        let snapshot_version = match &change {
            WatchChange::TargetChange(change)
                if change.state == TargetChangeState::NoChange
                    && change.target_ids.is_empty() =>
            {
                change.read_time
            }
            _ => None,
        };

        let event = {
            let mut state = self.state.lock().await;
            let aggregator = match state.aggregator.as_mut() {
                Some(aggregator) => aggregator,
                None => return Ok(()),
            };
            aggregator.handle_watch_change(change)?;
            snapshot_version.map(|version| aggregator.create_remote_event(version))
        };

        if let Some(event) = event {
            self.raise_remote_event(event).await?;
        }
        Ok(())
    }

    async fn raise_remote_event(self: &Arc<Self>, event: RemoteEvent) -> EngineResult<()> {
        // Mismatched targets must re-listen from scratch before the event is
        // applied locally (the local store clears their resume tokens).
        let mismatches: Vec<i32> = event.target_mismatches.iter().copied().collect();
        self.syncer.apply_remote_event(event).await?;

        for target_id in mismatches {
            let target_data = match self.syncer.get_target_data(target_id) {
                Some(data) => data,
                None => continue,
            };
            let stream = {
                let mut state = self.state.lock().await;
                if !state.listen_targets.contains_key(&target_id) {
                    continue;
                }
                let mut target = WatchTarget::from(&target_data);
                target.resume_token = Vec::new();
                state.listen_targets.insert(target_id, target.clone());
                if let Some(aggregator) = state.aggregator.as_mut() {
                    aggregator.remove_target(target_id);
                    aggregator.record_pending_target_request(target_id);
                }
                state.watch_stream.clone()
            };
            if let Some(stream) = stream {
                stream.unwatch(target_id).await?;
                let target = {
                    let state = self.state.lock().await;
                    state.listen_targets.get(&target_id).cloned()
                };
                if let Some(target) = target {
                    stream.watch(target).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_target_error(
        self: &Arc<Self>,
        target_ids: Vec<i32>,
        error: EngineError,
    ) -> EngineResult<()> {
        for target_id in target_ids {
            let known = {
                let mut state = self.state.lock().await;
                let known = state.listen_targets.remove(&target_id).is_some();
                if let Some(aggregator) = state.aggregator.as_mut() {
                    aggregator.remove_target(target_id);
                }
                known
            };
            if known {
                self.syncer.reject_listen(target_id, error.clone()).await?;
            }
        }
        Ok(())
    }

    async fn on_watch_error(self: &Arc<Self>, error: EngineError) {
        let has_targets = {
            let state = self.state.lock().await;
            !state.listen_targets.is_empty()
        };
        if has_targets {
            self.online_state.handle_watch_stream_failure(&error);
        }
    }

    async fn on_write_handshake_complete(self: &Arc<Self>) -> EngineResult<()> {
        let (stream, batches) = {
            let state = self.state.lock().await;
            let batches: Vec<Vec<_>> = state
                .write_pipeline
                .iter()
                .map(|batch| batch.mutations.clone())
                .collect();
            (state.write_stream.clone(), batches)
        };

        if let Some(stream) = stream {
            for writes in batches {
                stream.write(writes).await?;
            }
        }
        Ok(())
    }

    async fn on_write_response(self: &Arc<Self>, response: WriteResponse) -> EngineResult<()> {
        let batch = {
            let mut state = self.state.lock().await;
            state
                .write_pipeline
                .pop_front()
                .ok_or_else(|| internal_error("write response with an empty pipeline"))?
        };

        let commit_version = response
            .commit_version
            .unwrap_or(SnapshotVersion::MIN);
        let result = MutationBatchResult::new(
            batch,
            commit_version,
            response.write_results,
            bytes::Bytes::from(response.stream_token),
        );
        self.syncer.apply_successful_write(result).await?;

        {
            let mut state = self.state.lock().await;
            if state.write_pipeline.is_empty() {
                if let Some(stream) = state.write_stream.take() {
                    stream.stop();
                }
            }
        }
        self.fill_write_pipeline().await
    }

    async fn on_write_error(self: &Arc<Self>, error: EngineError) {
        let rejected = {
            let mut state = self.state.lock().await;
            if error.code.is_permanent_write_error() {
                state.write_pipeline.pop_front()
            } else {
                None
            }
        };

        match rejected {
            Some(batch) => {
                log::warn!(
                    "write batch {} permanently rejected: {error}",
                    batch.batch_id
                );
                if let Err(err) = self.syncer.reject_failed_write(batch.batch_id, error).await {
                    log::warn!("failed to reject write batch: {err}");
                }
                if let Err(err) = self.fill_write_pipeline().await {
                    log::warn!("failed to refill write pipeline: {err}");
                }
            }
            None => {
                log::debug!("transient write stream error: {error}");
            }
        }
    }

    fn can_use_network(state: &RemoteStoreState) -> bool {
        state.offline_causes.is_empty()
    }

    fn stop_streams_locked(state: &mut RemoteStoreState) {
        if let Some(stream) = state.watch_stream.take() {
            stream.stop();
        }
        if let Some(stream) = state.write_stream.take() {
            stream.stop();
        }
        state.aggregator = None;
    }
}

struct WatchDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[async_trait]
impl ListenStreamDelegate for WatchDelegate {
    async fn on_watch_stream_open(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_watch_stream_open().await;
        }
    }

    async fn on_watch_change(&self, change: WatchChange) -> EngineResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_change(change).await,
            None => Ok(()),
        }
    }

    async fn on_watch_stream_error(&self, error: EngineError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_watch_error(error).await;
        }
    }
}

struct WriteDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[async_trait]
impl WriteStreamDelegate for WriteDelegate {
    async fn on_handshake_complete(&self) -> EngineResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_handshake_complete().await,
            None => Ok(()),
        }
    }

    async fn on_write_response(&self, response: WriteResponse) -> EngineResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_response(response).await,
            None => Ok(()),
        }
    }

    async fn on_write_stream_error(&self, error: EngineError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write_error(error).await;
        }
    }
}
