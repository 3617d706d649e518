pub mod index_manager;
pub mod local_store;
pub mod lru_gc;
pub mod mutation_queue;
pub mod overlay_cache;
pub mod persistence;
pub mod query_engine;
pub mod remote_document_cache;
pub mod target_cache;

pub use local_store::{
    LocalQueryResult, LocalStore, LocalStoreConfig, LocalViewChanges, LocalWriteResult,
};
pub use lru_gc::{LruGarbageCollector, LruParams, LruResults};
pub use persistence::{MemoryPersistence, User};
pub use target_cache::{TargetData, TargetPurpose};
