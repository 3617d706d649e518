use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// Per-target membership delta carried by one remote event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetChange {
    /// Token to resume the target from this point in the stream.
    pub resume_token: Bytes,
    /// The backend has sent everything it has for this target; the client
    /// is caught up ("CURRENT").
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn has_changes(&self) -> bool {
        !self.added_documents.is_empty()
            || !self.modified_documents.is_empty()
            || !self.removed_documents.is_empty()
    }
}

/// Everything one watch stream snapshot tells us: consistent as of
/// `snapshot_version` across all mentioned targets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<i32, TargetChange>,
    /// Targets whose local membership failed an existence filter; they must
    /// be re-listened to from scratch.
    pub target_mismatches: BTreeSet<i32>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Single-document (limbo) targets the backend reported empty; the
    /// aggregator synthesizes deletions for these.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}
