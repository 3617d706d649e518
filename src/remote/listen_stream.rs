use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;

use crate::error::{internal_error, EngineError, EngineResult};
use crate::local::TargetData;
use crate::query::Target;
use crate::remote::datastore::{
    box_stream_future, CredentialsArc, Datastore, StreamHandle, StreamingFuture,
};
use crate::remote::stream::{
    PersistentStream, PersistentStreamDelegate, PersistentStreamHandle, StreamKind,
};
use crate::remote::watch_change::{
    decode_watch_change, encode_listen_request, ListenRequest, TargetChangeState, WatchChange,
};
use crate::util::backoff::BackoffConfig;

#[async_trait]
pub trait ListenStreamDelegate: Send + Sync + 'static {
    /// Called after every (re)connect, before the active targets are
    /// re-registered with the server.
    async fn on_watch_stream_open(&self);
    async fn on_watch_change(&self, change: WatchChange) -> EngineResult<()>;
    async fn on_watch_stream_error(&self, error: EngineError);
}

/// The target registration the listen stream replays on every reconnect.
#[derive(Clone, Debug)]
pub struct WatchTarget {
    pub target_id: i32,
    pub target: Target,
    pub resume_token: Vec<u8>,
}

impl From<&TargetData> for WatchTarget {
    fn from(data: &TargetData) -> Self {
        Self {
            target_id: data.target_id,
            target: data.target.clone(),
            resume_token: data.resume_token.to_vec(),
        }
    }
}

/// Self-restarting listen stream: keeps the set of watched targets, replays
/// them after reconnects, and forwards decoded watch changes to the
/// delegate.
pub struct ListenStream<D>
where
    D: ListenStreamDelegate,
{
    handler: Arc<ListenStreamHandler<D>>,
    handle: PersistentStreamHandle,
}

impl<D> ListenStream<D>
where
    D: ListenStreamDelegate,
{
    pub fn new(
        datastore: Arc<dyn Datastore>,
        credentials: CredentialsArc,
        backoff: BackoffConfig,
        delegate: Arc<D>,
    ) -> Self {
        let handler = Arc::new(ListenStreamHandler::new(delegate));
        let handle = PersistentStream::new(
            datastore,
            credentials,
            Arc::clone(&handler),
            backoff,
            StreamKind::Listen,
        )
        .start();
        Self { handler, handle }
    }

    pub async fn watch(&self, target: WatchTarget) -> EngineResult<()> {
        self.handler.watch(target).await
    }

    pub async fn unwatch(&self, target_id: i32) -> EngineResult<()> {
        self.handler.unwatch(target_id).await
    }

    pub fn stop(&self) {
        self.handler.stop();
        self.handle.stop();
    }
}

struct ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    delegate: Arc<D>,
    state: Mutex<ListenStreamState>,
    running: AtomicBool,
}

struct ListenStreamState {
    stream: Option<Arc<dyn StreamHandle>>,
    targets: BTreeMap<i32, WatchTarget>,
}

impl<D> ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    fn new(delegate: Arc<D>) -> Self {
        Self {
            delegate,
            state: Mutex::new(ListenStreamState {
                stream: None,
                targets: BTreeMap::new(),
            }),
            running: AtomicBool::new(true),
        }
    }

    async fn watch(&self, target: WatchTarget) -> EngineResult<()> {
        let request = encode_listen_request(&ListenRequest::AddTarget {
            target_id: target.target_id,
            target: target.target.clone(),
            resume_token: target.resume_token.clone(),
        })?;

        let stream = {
            let mut guard = self.state.lock().await;
            guard.targets.insert(target.target_id, target);
            guard.stream.clone()
        };

        if let Some(stream) = stream {
            stream.send(request).await?;
        }
        Ok(())
    }

    async fn unwatch(&self, target_id: i32) -> EngineResult<()> {
        let request = encode_listen_request(&ListenRequest::RemoveTarget { target_id })?;

        let stream = {
            let mut guard = self.state.lock().await;
            guard.targets.remove(&target_id);
            guard.stream.clone()
        };

        if let Some(stream) = stream {
            stream.send(request).await?;
        }
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Keeps stored resume tokens fresh so reconnects pick up where the
    /// stream left off instead of replaying the full result set.
    async fn note_resume_token(&self, change: &WatchChange) {
        let target_change = match change {
            WatchChange::TargetChange(change) => change,
            _ => return,
        };
        if target_change.resume_token.is_empty() {
            return;
        }
        if !matches!(
            target_change.state,
            TargetChangeState::NoChange | TargetChangeState::Current
        ) {
            return;
        }

        let mut guard = self.state.lock().await;
        if target_change.target_ids.is_empty() {
            for target in guard.targets.values_mut() {
                target.resume_token = target_change.resume_token.clone();
            }
        } else {
            for target_id in &target_change.target_ids {
                if let Some(target) = guard.targets.get_mut(target_id) {
                    target.resume_token = target_change.resume_token.clone();
                }
            }
        }
    }
}

impl<D> PersistentStreamDelegate for ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    fn stream_label(&self) -> &'static str {
        "listen"
    }

    fn on_stream_open(
        &self,
        stream: Arc<dyn StreamHandle>,
        _token: Option<String>,
    ) -> StreamingFuture<'_, EngineResult<()>> {
        box_stream_future(async move {
            self.delegate.on_watch_stream_open().await;
            let targets = {
                let mut guard = self.state.lock().await;
                guard.stream = Some(Arc::clone(&stream));
                guard.targets.values().cloned().collect::<Vec<_>>()
            };

            for target in targets {
                let request = encode_listen_request(&ListenRequest::AddTarget {
                    target_id: target.target_id,
                    target: target.target,
                    resume_token: target.resume_token,
                })?;
                stream.send(request).await?;
            }
            Ok(())
        })
    }

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, EngineResult<()>> {
        box_stream_future(async move {
            let change = decode_watch_change(&message)
                .map_err(|err| internal_error(format!("listen stream: {err}")))?;
            self.note_resume_token(&change).await;
            self.delegate.on_watch_change(change).await
        })
    }

    fn on_stream_close(&self) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            let mut guard = self.state.lock().await;
            guard.stream = None;
        })
    }

    fn on_stream_error(&self, error: EngineError) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            {
                let mut guard = self.state.lock().await;
                guard.stream = None;
            }
            self.delegate.on_watch_stream_error(error).await;
        })
    }

    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
