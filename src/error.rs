use crate::protocol::ProtoError;
use crate::store::StoreError;
use thiserror::Error;

/// Failure of [`ensure_ready`](crate::session::InitializationCoordinator::ensure_ready).
///
/// Cloneable because one build outcome is handed to every caller attached to it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("instance not found")]
    NotFound,
    #[error("timed out waiting for the instance to become ready")]
    Timeout,
    #[error("failed to create protocol client: {0}")]
    ClientCreationFailed(String),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("gateway is shutting down")]
    ShuttingDown,
}

/// Error kinds returned to callers of the instance manager.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Unknown instance, or an instance owned by another account.
    #[error("instance not found")]
    NotFound,
    #[error("instance is not connected")]
    NotConnected,
    #[error("failed to create protocol client: {0}")]
    ClientCreationFailed(String),
    #[error("timed out waiting for the instance to become ready")]
    Timeout,
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("gateway is shutting down")]
    ShuttingDown,
}

impl SessionError {
    /// Whether repeating the request may succeed without outside intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::ClientCreationFailed(_) | SessionError::Timeout
        )
    }
}

impl From<InitError> for SessionError {
    fn from(err: InitError) -> Self {
        match err {
            InitError::NotFound => SessionError::NotFound,
            InitError::Timeout => SessionError::Timeout,
            InitError::ClientCreationFailed(msg) => SessionError::ClientCreationFailed(msg),
            InitError::Proto(e) => SessionError::Proto(e),
            InitError::Store(e) => SessionError::Store(e),
            InitError::ShuttingDown => SessionError::ShuttingDown,
        }
    }
}
