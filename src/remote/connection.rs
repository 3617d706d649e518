use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::error::{internal_error, EngineError, EngineResult};
use crate::util::runtime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    Open,
    Data(Vec<u8>),
    Close,
    Error(EngineError),
}

/// One unit on the wire: a stream id plus what happened on that stream.
#[derive(Clone, Debug)]
pub struct WireFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl WireFrame {
    pub fn open(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open,
        }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: EngineError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

/// Bidirectional frame pipe. The engine never talks to a socket directly;
/// everything goes through this seam so tests can swap in an in-memory pair.
#[async_trait]
pub trait WireTransport: Send + Sync + 'static {
    async fn send(&self, frame: WireFrame) -> EngineResult<()>;
    async fn next(&self) -> EngineResult<WireFrame>;
}

/// Multiplexes any number of logical streams over one [`WireTransport`].
pub struct Connection {
    transport: Arc<dyn WireTransport>,
    next_stream_id: AtomicU32,
    outbound_tx: Sender<WireFrame>,
    streams: Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>,
}

impl Connection {
    pub fn new(transport: Arc<dyn WireTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let streams = Arc::new(Mutex::new(HashMap::new()));
        let connection = Self {
            transport: Arc::clone(&transport),
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams: Arc::clone(&streams),
        };

        connection.start_outbound_loop(outbound_rx);
        connection.start_inbound_loop(streams);
        connection
    }

    fn start_outbound_loop(&self, outbound_rx: Receiver<WireFrame>) {
        let transport = Arc::clone(&self.transport);
        runtime::spawn_detached(async move {
            while let Ok(frame) = outbound_rx.recv().await {
                if let Err(err) = transport.send(frame).await {
                    log::warn!("connection outbound loop terminated: {err}");
                    break;
                }
            }
        });
    }

    fn start_inbound_loop(&self, streams: Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>) {
        let transport = Arc::clone(&self.transport);
        runtime::spawn_detached(async move {
            loop {
                match transport.next().await {
                    Ok(frame) => {
                        let stream_id = frame.stream_id();
                        let event = frame.kind().clone();
                        let maybe_sender = {
                            let guard = streams.lock().unwrap();
                            guard.get(&stream_id).cloned()
                        };
                        if let Some(sender) = maybe_sender {
                            if matches!(event, FrameKind::Close | FrameKind::Error(_)) {
                                let _ = sender.send(event).await;
                                let mut guard = streams.lock().unwrap();
                                guard.remove(&stream_id);
                            } else if sender.send(event).await.is_err() {
                                log::debug!(
                                    "dropping inbound frame for closed stream {}",
                                    stream_id.value()
                                );
                            }
                        } else {
                            log::debug!("dropping frame for unknown stream {}", stream_id.value());
                        }
                    }
                    Err(err) => {
                        log::warn!("connection inbound loop terminated: {err}");
                        break;
                    }
                }
            }
        });
    }

    pub async fn open_stream(&self) -> EngineResult<ConnectionStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        {
            let mut guard = self.streams.lock().unwrap();
            guard.insert(stream_id, inbound_tx);
        }
        self.outbound_tx
            .send(WireFrame::open(stream_id))
            .await
            .map_err(|err| internal_error(format!("failed to queue open frame: {err}")))?;
        Ok(ConnectionStream {
            id: stream_id,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            registry: ConnectionHandle {
                outbound_tx: self.outbound_tx.clone(),
                streams: Arc::clone(&self.streams),
            },
        })
    }
}

#[derive(Clone)]
struct ConnectionHandle {
    outbound_tx: Sender<WireFrame>,
    streams: Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>,
}

impl ConnectionHandle {
    fn close_stream(&self, stream_id: StreamId) {
        let _ = self.outbound_tx.try_send(WireFrame::close(stream_id));
        let mut guard = self.streams.lock().unwrap();
        guard.remove(&stream_id);
    }
}

pub struct ConnectionStream {
    id: StreamId,
    outbound: Sender<WireFrame>,
    inbound: Receiver<FrameKind>,
    registry: ConnectionHandle,
}

impl ConnectionStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> EngineResult<()> {
        self.outbound
            .send(WireFrame::data(self.id, payload))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue stream frame: {err}")))
    }

    pub async fn next(&self) -> Option<EngineResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open => continue,
            }
        }
        None
    }

    pub async fn close(&self) -> EngineResult<()> {
        self.outbound
            .send(WireFrame::close(self.id))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue close frame: {err}")))
    }

    /// Sends an error frame to the peer, then tears the stream down locally.
    pub async fn fail(&self, error: EngineError) -> EngineResult<()> {
        self.outbound
            .send(WireFrame::error(self.id, error))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue error frame: {err}")))
    }
}

impl Drop for ConnectionStream {
    fn drop(&mut self) {
        self.registry.close_stream(self.id);
    }
}

/// Loopback transport used by tests and the in-process fake backend: frames
/// written to one side pop out of the other.
pub struct InMemoryTransport {
    inbound: Receiver<WireFrame>,
    outbound: Sender<WireFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }
}

#[async_trait]
impl WireTransport for InMemoryTransport {
    async fn send(&self, frame: WireFrame) -> EngineResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| internal_error(format!("transport peer dropped: {err}")))
    }

    async fn next(&self) -> EngineResult<WireFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| internal_error(format!("transport closed: {err}")))
    }
}
