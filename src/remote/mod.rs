pub mod aggregator;
pub mod connection;
pub mod datastore;
pub mod existence_filter;
pub mod listen_stream;
pub mod online_state;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod stream;
pub mod watch_change;
pub mod write_stream;

pub use aggregator::{TargetMetadataProvider, WatchChangeAggregator};
pub use connection::{Connection, InMemoryTransport, WireTransport};
pub use datastore::{
    CredentialsArc, CredentialsProvider, Datastore, NoopCredentialsProvider, StreamHandle,
    WireDatastore,
};
pub use existence_filter::{BloomFilter, BloomFilterBuilder, BloomFilterPayload};
pub use listen_stream::{ListenStream, ListenStreamDelegate, WatchTarget};
pub use online_state::{OnlineState, OnlineStateTracker};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, MAX_PENDING_WRITES};
pub use remote_syncer::RemoteSyncer;
pub use stream::{PersistentStream, PersistentStreamDelegate, PersistentStreamHandle, StreamKind};
pub use watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, ListenRequest,
    TargetChangeState, WatchChange, WatchDocument, WatchTargetChange, WireStatus,
};
pub use write_stream::{WriteRequest, WriteResponse, WriteStream, WriteStreamDelegate};
