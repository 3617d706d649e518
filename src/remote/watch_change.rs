use serde::{Deserialize, Serialize};

use crate::error::{Code, EngineError, EngineResult};
use crate::model::{DocumentKey, SnapshotVersion};
use crate::query::Target;
use crate::remote::existence_filter::BloomFilterPayload;
use crate::value::ObjectValue;

/// Client-to-server message on the listen stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ListenRequest {
    AddTarget {
        target_id: i32,
        target: Target,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        resume_token: Vec<u8>,
    },
    RemoveTarget {
        target_id: i32,
    },
}

/// Server-to-client message on the listen stream. The variants match the
/// Firestore watch protocol one to one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means "all active targets".
    pub target_ids: Vec<i32>,
    #[serde(default)]
    pub resume_token: Vec<u8>,
    pub read_time: Option<SnapshotVersion>,
    pub cause: Option<WireStatus>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<i32>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: None,
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, token: Vec<u8>) -> Self {
        self.resume_token = token;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = Some(read_time);
        self
    }

    pub fn with_cause(mut self, cause: WireStatus) -> Self {
        self.cause = Some(cause);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<i32>,
    pub removed_target_ids: Vec<i32>,
    pub key: DocumentKey,
    /// `None` marks the document as no longer matching the updated targets
    /// without asserting deletion.
    pub document: Option<WatchDocument>,
}

/// Snapshot of a document as carried by the watch stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchDocument {
    pub key: DocumentKey,
    pub version: SnapshotVersion,
    pub data: ObjectValue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: Option<SnapshotVersion>,
    pub removed_target_ids: Vec<i32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub read_time: Option<SnapshotVersion>,
    pub removed_target_ids: Vec<i32>,
}

/// Count (and optional bloom filter) of the documents the server still
/// considers part of a target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExistenceFilterChange {
    pub target_id: i32,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterPayload>,
}

/// Status payload carried inside stream messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireStatus {
    pub code: i32,
    pub message: String,
}

impl WireStatus {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code: grpc_code(code),
            message: message.into(),
        }
    }

    pub fn to_error(&self) -> EngineError {
        EngineError::new(Code::from_grpc(self.code), self.message.clone())
    }
}

fn grpc_code(code: Code) -> i32 {
    match code {
        Code::Ok => 0,
        Code::Cancelled => 1,
        Code::Unknown => 2,
        Code::InvalidArgument => 3,
        Code::DeadlineExceeded => 4,
        Code::NotFound => 5,
        Code::AlreadyExists => 6,
        Code::PermissionDenied => 7,
        Code::ResourceExhausted => 8,
        Code::FailedPrecondition => 9,
        Code::Aborted => 10,
        Code::OutOfRange => 11,
        Code::Unimplemented => 12,
        Code::Internal => 13,
        Code::Unavailable => 14,
        Code::DataLoss => 15,
        Code::Unauthenticated => 16,
    }
}

pub fn decode_watch_change(payload: &[u8]) -> EngineResult<WatchChange> {
    serde_json::from_slice(payload)
        .map_err(|err| crate::error::internal_error(format!("malformed watch message: {err}")))
}

pub fn encode_listen_request(request: &ListenRequest) -> EngineResult<Vec<u8>> {
    serde_json::to_vec(request)
        .map_err(|err| crate::error::internal_error(format!("failed to encode listen request: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;

    #[test]
    fn watch_change_roundtrips_through_json() {
        let change = WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, vec![2])
                .with_resume_token(vec![7, 8])
                .with_read_time(SnapshotVersion::new(Timestamp::new(10, 0))),
        );
        let bytes = serde_json::to_vec(&change).unwrap();
        let decoded = decode_watch_change(&bytes).unwrap();
        match decoded {
            WatchChange::TargetChange(decoded) => {
                assert_eq!(decoded.state, TargetChangeState::Current);
                assert_eq!(decoded.target_ids, vec![2]);
                assert_eq!(decoded.resume_token, vec![7, 8]);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn wire_status_converts_to_engine_error() {
        let status = WireStatus::new(Code::PermissionDenied, "denied");
        let error = status.to_error();
        assert_eq!(error.code, Code::PermissionDenied);
        assert!(error.code.is_permanent_error());
    }
}
