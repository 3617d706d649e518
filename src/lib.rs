//! Offline-first document database client engine.
//!
//! The crate keeps a local document cache consistent with a remote backend:
//! writes apply optimistically through a persisted mutation queue and
//! per-document overlays, queries run against the merged local view, and a
//! pair of persistent streams (watch and write) converge the cache with the
//! server. Several instances may share one cache; a lease protocol elects a
//! single primary allowed to hold streams and run garbage collection.

pub mod error;
pub mod local;
pub mod model;
pub mod mutation;
pub mod query;
pub mod remote;
pub mod sync;
pub mod tabs;
pub mod util;
pub mod value;

pub use error::{Code, EngineError, EngineResult};
pub use local::{LocalStore, LocalStoreConfig, MemoryPersistence, User};
pub use model::{DocumentKey, MutableDocument, SnapshotVersion, Timestamp};
pub use mutation::{Mutation, MutationBatch};
pub use query::{Filter, OrderBy, Query};
pub use remote::{OnlineState, RemoteStore};
pub use sync::{SyncEngine, SyncEvent, ViewSnapshot};
pub use tabs::SharedClientState;
pub use value::{FieldValue, ObjectValue};
