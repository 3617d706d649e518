//! In-process fake backend for integration tests.
//!
//! Implements the [`Datastore`] seam directly: every stream the client opens
//! shows up as a [`ServerStream`] the test drives by hand, speaking the same
//! JSON wire messages as the real streams.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use firestore_offline::error::{unavailable, EngineError, EngineResult};
use firestore_offline::local::{LocalStoreConfig, MemoryPersistence, User};
use firestore_offline::model::{DocumentKey, SnapshotVersion, Timestamp};
use firestore_offline::remote::datastore::{Datastore, StreamHandle, StreamingFuture};
use firestore_offline::remote::watch_change::{
    ListenRequest, TargetChangeState, WatchChange, WatchDocument, WatchTargetChange,
};
use firestore_offline::remote::write_stream::{WriteRequest, WriteResponse};
use firestore_offline::remote::{NoopCredentialsProvider, RemoteStore};
use firestore_offline::sync::SyncEngine;
use firestore_offline::util::backoff::BackoffConfig;
use firestore_offline::value::ObjectValue;
use firestore_offline::LocalStore;

/// One stream as seen from the backend side.
pub struct ServerStream {
    incoming: async_channel::Receiver<Vec<u8>>,
    outgoing: async_channel::Sender<EngineResult<Vec<u8>>>,
}

impl ServerStream {
    pub async fn recv_listen_request(&self) -> ListenRequest {
        let payload = self.recv_raw().await;
        serde_json::from_slice(&payload).expect("malformed listen request")
    }

    pub async fn recv_write_request(&self) -> WriteRequest {
        let payload = self.recv_raw().await;
        serde_json::from_slice(&payload).expect("malformed write request")
    }

    async fn recv_raw(&self) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(5), self.incoming.recv())
            .await
            .expect("timed out waiting for a client request")
            .expect("client closed the stream")
    }

    pub async fn send_watch_change(&self, change: &WatchChange) {
        let payload = serde_json::to_vec(change).unwrap();
        self.outgoing.send(Ok(payload)).await.unwrap();
    }

    pub async fn send_write_response(&self, response: &WriteResponse) {
        let payload = serde_json::to_vec(response).unwrap();
        self.outgoing.send(Ok(payload)).await.unwrap();
    }

    pub async fn fail(&self, error: EngineError) {
        let _ = self.outgoing.send(Err(error)).await;
        self.outgoing.close();
    }

    /// Marks every named target CURRENT and closes the snapshot at `version`
    /// with a global NoChange; the client emits a consistent remote event.
    pub async fn mark_current_and_close_snapshot(&self, target_ids: Vec<i32>, seconds: i64) {
        self.send_watch_change(&WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, target_ids)
                .with_resume_token(format!("rt-{seconds}").into_bytes()),
        ))
        .await;
        self.close_snapshot(seconds).await;
    }

    pub async fn close_snapshot(&self, seconds: i64) {
        self.send_watch_change(&WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, Vec::new())
                .with_resume_token(format!("rt-{seconds}").into_bytes())
                .with_read_time(version(seconds)),
        ))
        .await;
    }

    pub async fn send_document(
        &self,
        target_ids: Vec<i32>,
        path: &str,
        data: ObjectValue,
        seconds: i64,
    ) {
        let key = doc_key(path);
        self.send_watch_change(&WatchChange::DocumentChange(
            firestore_offline::remote::watch_change::DocumentChange {
                updated_target_ids: target_ids,
                removed_target_ids: Vec::new(),
                key: key.clone(),
                document: Some(WatchDocument {
                    key,
                    version: version(seconds),
                    data,
                }),
            },
        ))
        .await;
    }
}

struct FakeStreamHandle {
    outgoing: async_channel::Sender<Vec<u8>>,
    incoming: async_channel::Receiver<EngineResult<Vec<u8>>>,
}

impl StreamHandle for FakeStreamHandle {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, EngineResult<()>> {
        async move {
            self.outgoing
                .send(payload)
                .await
                .map_err(|_| unavailable("stream closed"))
        }
        .boxed()
    }

    fn next(&self) -> StreamingFuture<'_, Option<EngineResult<Vec<u8>>>> {
        async move { self.incoming.recv().await.ok() }.boxed()
    }

    fn close(&self) -> StreamingFuture<'_, EngineResult<()>> {
        async move {
            self.outgoing.close();
            self.incoming.close();
            Ok(())
        }
        .boxed()
    }
}

/// Datastore whose streams surface on the paired [`FakeBackend`].
pub struct FakeDatastore {
    listen_sessions: async_channel::Sender<ServerStream>,
    write_sessions: async_channel::Sender<ServerStream>,
}

/// Test-side handle: one entry per stream the client has opened, in order.
pub struct FakeBackend {
    pub listen_sessions: async_channel::Receiver<ServerStream>,
    pub write_sessions: async_channel::Receiver<ServerStream>,
}

impl FakeBackend {
    pub async fn next_listen_stream(&self) -> ServerStream {
        tokio::time::timeout(Duration::from_secs(5), self.listen_sessions.recv())
            .await
            .expect("timed out waiting for a listen stream")
            .expect("datastore dropped")
    }

    pub async fn next_write_stream(&self) -> ServerStream {
        tokio::time::timeout(Duration::from_secs(5), self.write_sessions.recv())
            .await
            .expect("timed out waiting for a write stream")
            .expect("datastore dropped")
    }
}

pub fn fake_datastore() -> (Arc<FakeDatastore>, FakeBackend) {
    let (listen_tx, listen_rx) = async_channel::unbounded();
    let (write_tx, write_rx) = async_channel::unbounded();
    (
        Arc::new(FakeDatastore {
            listen_sessions: listen_tx,
            write_sessions: write_tx,
        }),
        FakeBackend {
            listen_sessions: listen_rx,
            write_sessions: write_rx,
        },
    )
}

impl FakeDatastore {
    fn open(
        &self,
        sessions: &async_channel::Sender<ServerStream>,
    ) -> EngineResult<Arc<dyn StreamHandle>> {
        let (client_tx, server_rx) = async_channel::unbounded();
        let (server_tx, client_rx) = async_channel::unbounded();
        sessions
            .try_send(ServerStream {
                incoming: server_rx,
                outgoing: server_tx,
            })
            .map_err(|_| unavailable("backend gone"))?;
        Ok(Arc::new(FakeStreamHandle {
            outgoing: client_tx,
            incoming: client_rx,
        }))
    }
}

impl Datastore for FakeDatastore {
    fn open_listen_stream(&self) -> StreamingFuture<'_, EngineResult<Arc<dyn StreamHandle>>> {
        async move { self.open(&self.listen_sessions) }.boxed()
    }

    fn open_write_stream(&self) -> StreamingFuture<'_, EngineResult<Arc<dyn StreamHandle>>> {
        async move { self.open(&self.write_sessions) }.boxed()
    }
}

/// Full client wired to a fake backend.
pub fn client() -> (SyncEngine, FakeBackend) {
    let (datastore, backend) = fake_datastore();
    let local_store = Arc::new(LocalStore::new(
        Arc::new(MemoryPersistence::new()),
        User::unauthenticated(),
        LocalStoreConfig::default(),
    ));
    let engine = SyncEngine::new(local_store, |syncer| {
        RemoteStore::new(
            datastore,
            Arc::new(NoopCredentialsProvider),
            syncer,
            BackoffConfig {
                initial_delay_millis: 10,
                backoff_factor: 1.5,
                max_delay_millis: 100,
            },
        )
    })
    .expect("engine construction");
    (engine, backend)
}

/// Next view snapshot from the engine's event stream, skipping online-state
/// and error events.
pub async fn next_snapshot(
    events: &async_channel::Receiver<firestore_offline::SyncEvent>,
) -> firestore_offline::ViewSnapshot {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a snapshot")
            .expect("engine dropped");
        if let firestore_offline::SyncEvent::Snapshot(snapshot) = event {
            return snapshot;
        }
    }
}

pub fn doc_key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}
