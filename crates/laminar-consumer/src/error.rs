//! Consumer error types.
//!
//! - `ConsumerError`: top-level error for subscription, position and fetch operations
//! - `RemoteError`: an error code reported by the remote stream service

use thiserror::Error;

use crate::partition::PartitionKey;

/// Errors that can occur while driving the consumer.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Illegal subscription, assignment or position transition.
    ///
    /// Signals a programming error in the caller; never retried.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An argument was rejected (negative offset, partition outside the subscription).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid consumer configuration.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Required configuration key is missing.
    #[error("missing required config: {0}")]
    MissingConfig(String),

    /// No committed offset and the reset strategy is `none`.
    #[error("no offset for partition {0} and no reset strategy configured")]
    NoOffsetForPartition(PartitionKey),

    /// The remote stream service rejected a call.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The consumer has been closed.
    #[error("consumer closed")]
    Closed,

    /// An internal error that doesn't fit other categories.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConsumerError {
    pub(crate) fn not_assigned(partition: &PartitionKey) -> Self {
        ConsumerError::InvalidState(format!("no current assignment for partition {partition}"))
    }
}

/// How a [`RemoteError`] affects the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Cursor or group session is no longer valid; the group must rebalance.
    SessionInvalid,
    /// Anything else; the partition is retried on the next cycle.
    Transient,
}

/// An error returned by the remote stream service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct RemoteError {
    /// Service error code, e.g. `DIS.4319`.
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}

impl RemoteError {
    /// Creates a remote error from a code and message.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Classifies this error against a list of session-invalid codes.
    ///
    /// The code matches either exactly or as a substring of the message,
    /// since some service responses only embed it in the text.
    #[must_use]
    pub fn kind(&self, session_invalid_codes: &[String]) -> RemoteErrorKind {
        let invalid = session_invalid_codes
            .iter()
            .any(|c| self.code == *c || self.message.contains(c.as_str()));
        if invalid {
            RemoteErrorKind::SessionInvalid
        } else {
            RemoteErrorKind::Transient
        }
    }
}
