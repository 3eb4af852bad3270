use crate::operation::{PayloadKind, QueueKind};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {id}")]
    NotFound { id: String },
    #[error("{queue} queue does not accept {payload} payloads")]
    InvalidPayload { queue: QueueKind, payload: PayloadKind },
    #[error("invalid state: {0}")]
    InvalidState(String),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a syncer's transport. Always treated as transient.
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;
