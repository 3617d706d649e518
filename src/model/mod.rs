mod document;
mod document_key;
mod field_path;
mod resource_path;
mod timestamp;

pub use document::{DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_path::FieldPath;
pub use resource_path::ResourcePath;
pub use timestamp::{SnapshotVersion, Timestamp};
