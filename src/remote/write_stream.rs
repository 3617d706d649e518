use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{failed_precondition, internal_error, EngineError, EngineResult};
use crate::model::SnapshotVersion;
use crate::mutation::{Mutation, MutationResult};
use crate::remote::datastore::{
    box_stream_future, CredentialsArc, Datastore, StreamHandle, StreamingFuture,
};
use crate::remote::stream::{
    PersistentStream, PersistentStreamDelegate, PersistentStreamHandle, StreamKind,
};
use crate::util::backoff::BackoffConfig;

/// Client-to-server message on the write stream. The first message after
/// every (re)connect must be the handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WriteRequest {
    Handshake,
    Writes {
        stream_token: Vec<u8>,
        writes: Vec<Mutation>,
    },
}

/// Server response to either the handshake (empty `write_results`, no commit
/// version) or a write request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: Option<SnapshotVersion>,
    pub write_results: Vec<MutationResult>,
}

#[async_trait]
pub trait WriteStreamDelegate: Send + Sync + 'static {
    async fn on_handshake_complete(&self) -> EngineResult<()>;
    async fn on_write_response(&self, response: WriteResponse) -> EngineResult<()>;
    async fn on_write_stream_error(&self, error: EngineError);
}

/// Self-restarting write stream. Redoes the handshake after every reconnect;
/// the delegate is responsible for re-sending unacknowledged batches once
/// `on_handshake_complete` fires.
pub struct WriteStream<D>
where
    D: WriteStreamDelegate,
{
    handler: Arc<WriteStreamHandler<D>>,
    handle: PersistentStreamHandle,
}

impl<D> WriteStream<D>
where
    D: WriteStreamDelegate,
{
    pub fn new(
        datastore: Arc<dyn Datastore>,
        credentials: CredentialsArc,
        backoff: BackoffConfig,
        initial_stream_token: Vec<u8>,
        delegate: Arc<D>,
    ) -> Self {
        let handler = Arc::new(WriteStreamHandler::new(delegate, initial_stream_token));
        let handle = PersistentStream::new(
            datastore,
            credentials,
            Arc::clone(&handler),
            backoff,
            StreamKind::Write,
        )
        .start();
        Self { handler, handle }
    }

    pub async fn handshake_complete(&self) -> bool {
        self.handler.state.lock().await.handshake_complete
    }

    pub async fn write(&self, writes: Vec<Mutation>) -> EngineResult<()> {
        self.handler.write_mutations(writes).await
    }

    pub fn stop(&self) {
        self.handler.stop();
        self.handle.stop();
    }
}

struct WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    delegate: Arc<D>,
    state: Mutex<WriteStreamState>,
    running: AtomicBool,
}

struct WriteStreamState {
    stream: Option<Arc<dyn StreamHandle>>,
    handshake_complete: bool,
    stream_token: Vec<u8>,
}

impl<D> WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    fn new(delegate: Arc<D>, initial_stream_token: Vec<u8>) -> Self {
        Self {
            delegate,
            state: Mutex::new(WriteStreamState {
                stream: None,
                handshake_complete: false,
                stream_token: initial_stream_token,
            }),
            running: AtomicBool::new(true),
        }
    }

    async fn write_mutations(&self, writes: Vec<Mutation>) -> EngineResult<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let (stream, stream_token) = {
            let guard = self.state.lock().await;
            if !guard.handshake_complete {
                return Err(failed_precondition(
                    "cannot write mutations before the handshake completes",
                ));
            }
            let stream = guard
                .stream
                .clone()
                .ok_or_else(|| internal_error("write stream is not open"))?;
            (stream, guard.stream_token.clone())
        };

        let request = WriteRequest::Writes {
            stream_token,
            writes,
        };
        let bytes = serde_json::to_vec(&request)
            .map_err(|err| internal_error(format!("failed to encode write request: {err}")))?;
        stream.send(bytes).await
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn send_handshake(&self, stream: Arc<dyn StreamHandle>) -> EngineResult<()> {
        let bytes = serde_json::to_vec(&WriteRequest::Handshake)
            .map_err(|err| internal_error(format!("failed to encode handshake: {err}")))?;
        stream.send(bytes).await
    }
}

impl<D> PersistentStreamDelegate for WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    fn stream_label(&self) -> &'static str {
        "write"
    }

    fn on_stream_open(
        &self,
        stream: Arc<dyn StreamHandle>,
        _token: Option<String>,
    ) -> StreamingFuture<'_, EngineResult<()>> {
        box_stream_future(async move {
            {
                let mut guard = self.state.lock().await;
                guard.stream = Some(Arc::clone(&stream));
                guard.handshake_complete = false;
            }
            self.send_handshake(stream).await
        })
    }

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, EngineResult<()>> {
        box_stream_future(async move {
            let response: WriteResponse = serde_json::from_slice(&message)
                .map_err(|err| internal_error(format!("malformed write response: {err}")))?;

            let was_handshake = {
                let mut guard = self.state.lock().await;
                guard.stream_token = response.stream_token.clone();
                if guard.handshake_complete {
                    false
                } else {
                    guard.handshake_complete = true;
                    true
                }
            };

            if was_handshake {
                self.delegate.on_handshake_complete().await
            } else {
                self.delegate.on_write_response(response).await
            }
        })
    }

    fn on_stream_close(&self) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            let mut guard = self.state.lock().await;
            guard.stream = None;
            guard.handshake_complete = false;
        })
    }

    fn on_stream_error(&self, error: EngineError) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            {
                let mut guard = self.state.lock().await;
                guard.stream = None;
                guard.handshake_complete = false;
            }
            self.delegate.on_write_stream_error(error).await;
        })
    }

    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
