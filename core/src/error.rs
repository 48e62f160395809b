use crate::backend::{BackendError, Key};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the event model, the stores and the load generator.
#[derive(Debug, Error)]
pub enum Error {
    /// An event could not be constructed from the given fields.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// A stored `campaign:action` value could not be decoded.
    #[error("malformed event {value:?} at {timestamp}: {reason}")]
    MalformedEvent {
        timestamp: i64,
        value: String,
        reason: &'static str,
    },

    /// The server-side aggregation module is missing or the backend cannot run one.
    #[error("aggregation module `{module}` unavailable: {source}")]
    CapabilityUnavailable {
        module: String,
        #[source]
        source: BackendError,
    },

    /// A backend round trip failed.
    #[error("backend unavailable during {operation} (user {user}, key {key}): {source}")]
    BackendUnavailable {
        operation: &'static str,
        user: String,
        key: String,
        #[source]
        source: BackendError,
    },

    #[error("invalid workload: {0}")]
    InvalidWorkload(String),
}

impl Error {
    pub(crate) fn backend(
        operation: &'static str,
        user: &str,
        key: &Key,
        source: BackendError,
    ) -> Self {
        Error::BackendUnavailable {
            operation,
            user: user.to_string(),
            key: key.to_string(),
            source,
        }
    }
}
