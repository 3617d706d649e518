use std::error::Error;
use std::fmt::{Display, Formatter};

/// Canonical error codes shared by the engine and the wire protocol.
///
/// The set mirrors the gRPC status codes Firestore surfaces to clients; the
/// remote store uses [`Code::is_permanent_error`] to decide whether a failed
/// request should be retried or handed back to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid-argument",
            Code::DeadlineExceeded => "deadline-exceeded",
            Code::NotFound => "not-found",
            Code::AlreadyExists => "already-exists",
            Code::PermissionDenied => "permission-denied",
            Code::ResourceExhausted => "resource-exhausted",
            Code::FailedPrecondition => "failed-precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out-of-range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data-loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }

    pub fn from_grpc(code: i32) -> Self {
        match code {
            0 => Code::Ok,
            1 => Code::Cancelled,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    /// Returns `true` when a request that failed with this code will fail in
    /// the same way again and must not be retried.
    ///
    /// `Unauthenticated` is deliberately non-permanent for streams: the token
    /// is refreshed and the stream restarted.
    pub fn is_permanent_error(&self) -> bool {
        match self {
            Code::Ok => false,
            Code::Cancelled
            | Code::Unknown
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Internal
            | Code::Unavailable
            | Code::Unauthenticated => false,
            Code::InvalidArgument
            | Code::NotFound
            | Code::AlreadyExists
            | Code::PermissionDenied
            | Code::FailedPrecondition
            | Code::Aborted
            | Code::OutOfRange
            | Code::Unimplemented
            | Code::DataLoss => true,
        }
    }

    /// Write-stream variant: `Aborted` on a write means the stream token was
    /// stale, which is retryable with a fresh handshake.
    pub fn is_permanent_write_error(&self) -> bool {
        self.is_permanent_error() && *self != Code::Aborted
    }
}

#[derive(Clone, Debug)]
pub struct EngineError {
    pub code: Code,
    message: String,
}

impl EngineError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

pub fn invalid_argument(message: impl Into<String>) -> EngineError {
    EngineError::new(Code::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> EngineError {
    EngineError::new(Code::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> EngineError {
    EngineError::new(Code::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> EngineError {
    EngineError::new(Code::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> EngineError {
    EngineError::new(Code::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> EngineError {
    EngineError::new(Code::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> EngineError {
    EngineError::new(Code::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> EngineError {
    EngineError::new(Code::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> EngineError {
    EngineError::new(Code::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> EngineError {
    EngineError::new(Code::Aborted, message)
}

/// Raised when an instance touches persisted state after losing the primary
/// lease. The owning operation becomes a no-op and is retried once primary
/// status is regained.
pub fn primary_lease_lost() -> EngineError {
    EngineError::new(
        Code::FailedPrecondition,
        "The current instance no longer holds the primary lease",
    )
}

pub fn is_primary_lease_lost(error: &EngineError) -> bool {
    error.code == Code::FailedPrecondition && error.message.contains("primary lease")
}
