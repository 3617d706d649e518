use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::EngineResult;
use crate::remote::connection::{Connection, ConnectionStream};

pub type StreamingFuture<'a, T> = BoxFuture<'a, T>;

pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// One open bidirectional stream (listen or write).
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, EngineResult<()>>;
    fn next(&self) -> StreamingFuture<'_, Option<EngineResult<Vec<u8>>>>;
    fn close(&self) -> StreamingFuture<'_, EngineResult<()>>;
}

/// Opens listen and write streams against the backend.
pub trait Datastore: Send + Sync + 'static {
    fn open_listen_stream(&self) -> StreamingFuture<'_, EngineResult<Arc<dyn StreamHandle>>>;
    fn open_write_stream(&self) -> StreamingFuture<'_, EngineResult<Arc<dyn StreamHandle>>>;
}

/// Supplies auth tokens for stream startup.
///
/// `invalidate_token` is called after an `Unauthenticated` or
/// `PermissionDenied` stream error so the next attempt fetches a fresh token
/// instead of replaying the rejected one.
#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    async fn get_token(&self) -> EngineResult<Option<String>>;
    fn invalidate_token(&self);
}

pub type CredentialsArc = Arc<dyn CredentialsProvider>;

/// Provider for unauthenticated use; never yields a token.
#[derive(Default)]
pub struct NoopCredentialsProvider;

#[async_trait]
impl CredentialsProvider for NoopCredentialsProvider {
    async fn get_token(&self) -> EngineResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

/// Production-shaped datastore: every stream is a multiplexed logical stream
/// on one shared [`Connection`].
pub struct WireDatastore {
    connection: Arc<Connection>,
}

impl WireDatastore {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }
}

impl Datastore for WireDatastore {
    fn open_listen_stream(&self) -> StreamingFuture<'_, EngineResult<Arc<dyn StreamHandle>>> {
        let connection = Arc::clone(&self.connection);
        box_stream_future(async move {
            let stream = connection.open_stream().await?;
            Ok(Arc::new(WireStreamHandle::new(stream)) as Arc<dyn StreamHandle>)
        })
    }

    fn open_write_stream(&self) -> StreamingFuture<'_, EngineResult<Arc<dyn StreamHandle>>> {
        let connection = Arc::clone(&self.connection);
        box_stream_future(async move {
            let stream = connection.open_stream().await?;
            Ok(Arc::new(WireStreamHandle::new(stream)) as Arc<dyn StreamHandle>)
        })
    }
}

pub struct WireStreamHandle {
    stream: ConnectionStream,
}

impl WireStreamHandle {
    fn new(stream: ConnectionStream) -> Self {
        Self { stream }
    }
}

impl StreamHandle for WireStreamHandle {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, EngineResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.send(payload).await })
    }

    fn next(&self) -> StreamingFuture<'_, Option<EngineResult<Vec<u8>>>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.next().await })
    }

    fn close(&self) -> StreamingFuture<'_, EngineResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.close().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::connection::InMemoryTransport;

    #[tokio::test]
    async fn datastore_stream_roundtrip() {
        let (left, right) = InMemoryTransport::pair();
        let client = Arc::new(Connection::new(left));
        let server = Arc::new(Connection::new(right));

        let datastore = WireDatastore::new(Arc::clone(&client));
        let handle = datastore.open_listen_stream().await.unwrap();

        let peer_stream = server.open_stream().await.unwrap();
        peer_stream.send(b"hello".to_vec()).await.unwrap();

        let payload = handle.next().await.unwrap().unwrap();
        assert_eq!(payload, b"hello");
        handle.close().await.unwrap();
    }
}
