//! Crate-wide error types.
//!
//! `RemoteError` classifies failures from the remote service so callers can
//! decide between retry-next-cycle, go-offline, and treat-as-deleted without
//! string matching. `SyncError` is the crate-level error surfaced to
//! embedders.

use thiserror::Error;

/// Classification of remote-service failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Retriable (network timeout, 5xx, connection reset). Dirty state is
    /// preserved and the next poll retries.
    Transient,
    /// Credentials rejected or revoked. Sync goes offline until the user
    /// re-authenticates.
    Auth,
    /// The file does not exist remotely. Treated as "cloud deleted" where a
    /// file was expected.
    NotFound,
    /// Storage quota exhausted or permission denied. Sync is disabled until
    /// resolved.
    Quota,
    /// Not retriable (malformed request, unsupported operation).
    Permanent,
}

/// Error from the remote service, surfaced unchanged through the queue.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Auth, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == RemoteErrorKind::NotFound
    }
}

/// Crate-level error type.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The operation was superseded, or the queue was shut down, before the
    /// operation executed. Not an error to the user; callers consume it
    /// silently.
    #[error("operation cancelled")]
    OperationCancelled,

    /// The queue worker is gone and can no longer accept work.
    #[error("operations queue closed")]
    QueueClosed,

    /// A sync entry point was called before `connect` finished.
    #[error("drive not connected")]
    NotConnected,

    #[error("note not found: {0}")]
    NoteNotFound(String),

    #[error("sync state persistence failed: {0}")]
    StatePersist(String),

    /// The local manifest could not be recovered from any of its on-disk
    /// copies and rebuild was not possible.
    #[error("manifest unrecoverable: {0}")]
    ManifestUnrecoverable(String),

    #[error("migration aborted: {0}")]
    MigrationAborted(String),
}

impl SyncError {
    /// True when this error came from the remote side with the given kind.
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            SyncError::Remote(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::OperationCancelled)
    }

    pub fn is_not_found(&self) -> bool {
        self.remote_kind() == Some(RemoteErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
