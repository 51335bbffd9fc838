use std::path::PathBuf;
use thiserror::Error;

/// Hard failures that abort a sync cycle.
///
/// Per-file problems (one read, one transfer) are soft: they are collected as
/// strings in [`crate::SyncStats::errors`] and the cycle keeps going.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The request never produced a server response.
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// The server answered with a non-success status.
    #[error("server returned status {status}: {message}")]
    Api { status: u16, message: String },

    /// A response arrived but could not be understood.
    #[error("{0}")]
    Protocol(String),

    #[error("no sync directory configured")]
    NotConfigured,

    #[error("sync directory does not exist: {0}")]
    MissingSyncDir(PathBuf),

    #[error("state file unusable: {0}")]
    State(String),
}

impl SyncError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Whether the next cycle is likely to succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Io(_) => true,
            _ => false,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::transport("connection reset").is_retryable());
        assert!(SyncError::Api {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Api {
            status: 404,
            message: String::new()
        }
        .is_retryable());
        assert!(!SyncError::NotConfigured.is_retryable());
    }
}
