use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The error kinds that cross the wire. Every non-2xx response from the
/// server carries one of these in its JSON envelope, and the client folds
/// everything it sees back into the same set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiErrorKind {
    Unauthorized,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    HashMismatch,
    BadRequest,
    Internal,
}

/// JSON body of a non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_kind: ApiErrorKind,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The server answered with an error envelope.
    #[error("server returned {kind:?}: {message}")]
    Api { kind: ApiErrorKind, message: String },

    /// The request never produced a well-formed answer (timeout, connection
    /// reset, unparseable response). Always worth retrying.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid path: {0}")]
    Path(String),

    #[error("permission file {file}: {message}")]
    PermissionParse { file: String, message: String },

    #[error("delta error: {0}")]
    Delta(String),

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("config error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> SyncError {
        SyncError::Io { path: path.into(), source }
    }

    /// Whether retrying the same operation can reasonably succeed.
    /// Permission, not-found and validation failures are terminal for an
    /// item; transport glitches and server 5xx are not.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transport(_) => true,
            SyncError::Api { kind: ApiErrorKind::Internal, .. } => true,
            _ => false,
        }
    }

    /// The wire kind, if this error originated from (or maps onto) the
    /// protocol envelope.
    pub fn api_kind(&self) -> Option<ApiErrorKind> {
        match self {
            SyncError::Api { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> SyncError {
        SyncError::Transport(e.to_string())
    }
}
