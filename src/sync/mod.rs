pub mod sync_engine;
pub mod view;

pub use sync_engine::{SyncEngine, SyncEvent, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS};
pub use view::{
    DocumentChangeType, DocumentViewChange, LimboDocumentChange, SyncState, View, ViewChange,
    ViewDocumentChanges, ViewSnapshot,
};
