use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Code, EngineError, EngineResult};
use crate::remote::datastore::{
    CredentialsArc, Datastore, StreamHandle, StreamingFuture,
};
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};
use crate::util::runtime;

/// Streams that have seen no traffic for this long are force-closed and
/// reopened through the normal restart path.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug)]
pub enum StreamKind {
    Listen,
    Write,
}

pub trait PersistentStreamDelegate: Send + Sync + 'static {
    fn stream_label(&self) -> &'static str;

    /// Called once per (re)connection with the freshly opened stream and the
    /// auth token that was fetched for it.
    fn on_stream_open(
        &self,
        stream: Arc<dyn StreamHandle>,
        token: Option<String>,
    ) -> StreamingFuture<'_, EngineResult<()>>;

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, EngineResult<()>>;

    fn on_stream_close(&self) -> StreamingFuture<'_, ()>;

    fn on_stream_error(&self, error: EngineError) -> StreamingFuture<'_, ()>;

    fn should_continue(&self) -> bool;
}

/// Self-restarting stream: fetch token, open, pump messages, and on any
/// failure back off exponentially before trying again. Stops when the handle
/// is dropped via [`PersistentStreamHandle::stop`] or the delegate declines to
/// continue.
pub struct PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    datastore: Arc<dyn Datastore>,
    credentials: CredentialsArc,
    delegate: Arc<D>,
    backoff: BackoffConfig,
    idle_timeout: Duration,
    kind: StreamKind,
    running: Arc<AtomicBool>,
}

impl<D> PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    pub fn new(
        datastore: Arc<dyn Datastore>,
        credentials: CredentialsArc,
        delegate: Arc<D>,
        backoff: BackoffConfig,
        kind: StreamKind,
    ) -> Self {
        Self {
            datastore,
            credentials,
            delegate,
            backoff,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            kind,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn start(self) -> PersistentStreamHandle {
        let running = Arc::clone(&self.running);
        runtime::spawn_detached(async move {
            self.run().await;
        });
        PersistentStreamHandle { running }
    }

    async fn run(self) {
        let label = self.delegate.stream_label();
        let mut backoff = ExponentialBackoff::new(self.backoff);

        while self.running.load(Ordering::SeqCst) && self.delegate.should_continue() {
            let token = match self.credentials.get_token().await {
                Ok(token) => token,
                Err(err) => {
                    log::warn!("{label} stream token fetch failed: {err}");
                    self.delegate.on_stream_error(err).await;
                    runtime::sleep(backoff.next_delay()).await;
                    continue;
                }
            };

            let open_result = match self.kind {
                StreamKind::Listen => self.datastore.open_listen_stream().await,
                StreamKind::Write => self.datastore.open_write_stream().await,
            };

            match open_result {
                Ok(stream) => {
                    if !self.running.load(Ordering::SeqCst) || !self.delegate.should_continue() {
                        let _ = stream.close().await;
                        break;
                    }

                    if let Err(err) = self.delegate.on_stream_open(Arc::clone(&stream), token).await
                    {
                        self.handle_error(&err).await;
                        let _ = stream.close().await;
                        runtime::sleep(self.delay_for(&mut backoff, &err)).await;
                        continue;
                    }

                    backoff.reset();
                    match self.process_stream(stream).await {
                        StreamOutcome::Stopped => break,
                        StreamOutcome::Failed(err) => {
                            runtime::sleep(self.delay_for(&mut backoff, &err)).await;
                        }
                        StreamOutcome::Closed | StreamOutcome::Idle => {}
                    }
                }
                Err(err) => {
                    self.handle_error(&err).await;
                    runtime::sleep(self.delay_for(&mut backoff, &err)).await;
                }
            }
        }

        self.delegate.on_stream_close().await;
    }

    async fn process_stream(&self, stream: Arc<dyn StreamHandle>) -> StreamOutcome {
        loop {
            if !self.running.load(Ordering::SeqCst) || !self.delegate.should_continue() {
                let _ = stream.close().await;
                return StreamOutcome::Stopped;
            }

            let next = tokio::time::timeout(self.idle_timeout, stream.next()).await;
            match next {
                Err(_) => {
                    log::debug!(
                        "{} stream idle for {:?}, closing",
                        self.delegate.stream_label(),
                        self.idle_timeout
                    );
                    let _ = stream.close().await;
                    return StreamOutcome::Idle;
                }
                Ok(Some(Ok(payload))) => {
                    if let Err(err) = self.delegate.on_stream_message(payload).await {
                        self.handle_error(&err).await;
                        let _ = stream.close().await;
                        return self.failed_or_stopped(err);
                    }
                }
                Ok(Some(Err(err))) => {
                    self.handle_error(&err).await;
                    let _ = stream.close().await;
                    return self.failed_or_stopped(err);
                }
                Ok(None) => {
                    return if self.running.load(Ordering::SeqCst) {
                        StreamOutcome::Closed
                    } else {
                        StreamOutcome::Stopped
                    };
                }
            }
        }
    }

    async fn handle_error(&self, error: &EngineError) {
        if matches!(error.code, Code::Unauthenticated | Code::PermissionDenied) {
            self.credentials.invalidate_token();
        }
        self.delegate.on_stream_error(error.clone()).await;
    }

    fn delay_for(&self, backoff: &mut ExponentialBackoff, error: &EngineError) -> Duration {
        if error.code == Code::ResourceExhausted {
            backoff.reset_to_max();
        }
        backoff.next_delay()
    }

    fn failed_or_stopped(&self, error: EngineError) -> StreamOutcome {
        if self.running.load(Ordering::SeqCst) {
            StreamOutcome::Failed(error)
        } else {
            StreamOutcome::Stopped
        }
    }
}

enum StreamOutcome {
    /// Handle stopped or delegate declined to continue.
    Stopped,
    /// Peer half-closed cleanly; reconnect without backoff.
    Closed,
    /// Idle watchdog fired; reconnect without backoff.
    Idle,
    Failed(EngineError),
}

pub struct PersistentStreamHandle {
    running: Arc<AtomicBool>,
}

impl PersistentStreamHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
