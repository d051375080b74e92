use serde::{Deserialize, Serialize};

/// Errors surfaced synchronously at engine call sites.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Too many unconfirmed optimistic updates. Callers should back off
    /// rather than keep piling work onto an unreachable server.
    #[error("too many pending optimistic updates (limit {limit})")]
    CapacityExceeded { limit: usize },

    /// The component was destroyed and then used again. Explicit rather than
    /// a silent no-op so use-after-destroy bugs surface early.
    #[error("{component} has been destroyed")]
    Destroyed { component: &'static str },
}

/// A classified failure from the remote mutation API.
///
/// `retryable` is the one bit the rest of the engine cares about:
/// network/timeout failures are retryable, validation-style rejections are
/// not. Serializable because it rides along in rollback broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct SyncError {
    pub message: String,
    pub retryable: bool,
    /// HTTP-ish status, when the remote got far enough to produce one.
    pub status: Option<u16>,
}

impl SyncError {
    /// A transport-level failure: the request may never have reached the
    /// server, so trying again is sound.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            status: None,
        }
    }

    /// The server understood the request and said no. Retrying the same
    /// payload would produce the same answer.
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            status: Some(status),
        }
    }

    pub fn timeout() -> Self {
        Self {
            message: "request timed out".to_string(),
            retryable: true,
            status: None,
        }
    }

    /// Strip retryability, keeping the message. Used when a retry budget is
    /// exhausted and the failure becomes terminal.
    pub(crate) fn into_terminal(mut self, attempts: u32) -> Self {
        self.message = format!("{} (after {attempts} attempts)", self.message);
        self.retryable = false;
        self
    }
}

/// Failures from the injected platform capabilities. Callers inside the
/// engine absorb these at the point of use and degrade to in-memory
/// operation; they never escalate out of a business-level method.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("broadcast transport unavailable: {0}")]
    TransportUnavailable(String),
}
