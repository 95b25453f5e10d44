use thiserror::Error;

/// Errors produced by the remote store boundary.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Network-level failure (timeout, dropped connection). Reads retry
    /// these once; writes surface them to the caller.
    #[error("transient store i/o: {0}")]
    Transient(String),

    /// Identity missing or revoked. Callers must not retry.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Malformed request or row (unknown table, non-object row, bad patch).
    #[error("invalid store request: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Errors surfaced by the sync core's public operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No authenticated identity; all core operations fail fast.
    #[error("no authenticated identity")]
    NoIdentity,

    #[error("message text is empty")]
    EmptyMessage,

    #[error("unknown chat: {0}")]
    UnknownChat(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
