use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, SnapshotVersion};
use crate::value::ObjectValue;

/// Existence state of a cached document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    /// Nothing is known about the document at this version.
    Invalid,
    /// The document exists and `data` is its last known contents.
    FoundDocument,
    /// The server confirmed the document does not exist.
    NoDocument,
    /// The document is known to exist but its contents are unknown
    /// (e.g. a patch was committed against unfetched data).
    UnknownDocument,
}

/// A document in the local cache together with everything the engine knows
/// about its synchronization state.
///
/// The local view of a document is always `remote document + overlay`; the
/// `has_local_mutations`/`has_committed_mutations` flags record which side of
/// that equation produced the current contents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    data: ObjectValue,
    has_local_mutations: bool,
    has_committed_mutations: bool,
}

impl MutableDocument {
    pub fn invalid(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::MIN,
            read_time: SnapshotVersion::MIN,
            data: ObjectValue::empty(),
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn found_document(key: DocumentKey, version: SnapshotVersion, data: ObjectValue) -> Self {
        Self {
            key,
            document_type: DocumentType::FoundDocument,
            version,
            read_time: SnapshotVersion::MIN,
            data,
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            document_type: DocumentType::NoDocument,
            version,
            read_time: SnapshotVersion::MIN,
            data: ObjectValue::empty(),
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            document_type: DocumentType::UnknownDocument,
            version,
            read_time: SnapshotVersion::MIN,
            data: ObjectValue::empty(),
            has_local_mutations: false,
            has_committed_mutations: true,
        }
    }

    pub fn convert_to_found_document(
        &mut self,
        version: SnapshotVersion,
        data: ObjectValue,
    ) -> &mut Self {
        self.document_type = DocumentType::FoundDocument;
        self.version = version;
        self.data = data;
        self.has_local_mutations = false;
        self.has_committed_mutations = false;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.document_type = DocumentType::NoDocument;
        self.version = version;
        self.data = ObjectValue::empty();
        self.has_local_mutations = false;
        self.has_committed_mutations = false;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.document_type = DocumentType::UnknownDocument;
        self.version = version;
        self.data = ObjectValue::empty();
        self.has_local_mutations = false;
        self.has_committed_mutations = true;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.has_local_mutations = true;
        self.version = SnapshotVersion::MIN;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.has_committed_mutations = true;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = read_time;
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) {
        self.read_time = read_time;
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ObjectValue {
        &mut self.data
    }

    pub fn set_data(&mut self, data: ObjectValue) {
        self.data = data;
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.has_local_mutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations || self.has_committed_mutations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;

    fn key() -> DocumentKey {
        DocumentKey::from_string("cities/sf").unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn found_document_roundtrip() {
        let doc = MutableDocument::found_document(key(), version(5), ObjectValue::empty());
        assert!(doc.is_found_document());
        assert!(!doc.has_pending_writes());
        assert_eq!(doc.version(), version(5));
    }

    #[test]
    fn local_mutations_clear_version() {
        let mut doc = MutableDocument::found_document(key(), version(5), ObjectValue::empty());
        doc.set_has_local_mutations();
        assert!(doc.has_local_mutations());
        assert!(doc.version().is_min());
    }

    #[test]
    fn conversion_resets_flags() {
        let mut doc = MutableDocument::unknown_document(key(), version(2));
        assert!(doc.has_committed_mutations());
        doc.convert_to_found_document(version(3), ObjectValue::empty());
        assert!(!doc.has_committed_mutations());
        assert!(doc.is_found_document());
    }
}
