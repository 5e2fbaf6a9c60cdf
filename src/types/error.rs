use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Sink submission failed: {0}")]
    Sink(String),

    #[error("Host {0} at capacity")]
    Busy(String),

    #[error("Task queue full")]
    QueueFull,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Mailbox not found: {0}")]
    MailboxNotFound(String),

    #[error("No live session for mailbox {0}")]
    NoSession(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl IngestError {
    /// Whether the session that produced this error should be discarded
    /// rather than returned to the pool.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            Self::Imap(_)
                | Self::Auth(_)
                | Self::Network(_)
                | Self::Timeout(_)
                | Self::Cancelled
                | Self::Io(_)
                | Self::NoSession(_)
        )
    }

    /// Whether the caller may retry the operation on a fresh attempt.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::Auth(_) | Self::Config(_) | Self::Parse(_))
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Io(err.to_string())
    }
}

impl From<r2d2::Error> for IngestError {
    fn from(err: r2d2::Error) -> Self {
        IngestError::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        IngestError::Database(err.to_string())
    }
}

impl From<async_imap::error::Error> for IngestError {
    fn from(err: async_imap::error::Error) -> Self {
        IngestError::Imap(err.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::Network(err.to_string())
    }
}
