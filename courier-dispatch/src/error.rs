//! Typed failures for one dispatch run.
//!
//! Transport failures never abort a run on their own; the dispatcher maps
//! them through [`TransportError::class`] onto a queue update. Only
//! [`DispatchError`] escapes a run.

use courier_queue::QueueError;
use thiserror::Error;

/// How a failed send affects the rest of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Credentials are bad. Nothing else in the batch can succeed.
    Authentication,
    /// The provider is pushing back. Stop and leave the rest for later.
    Throttle,
    /// Only this message is affected.
    Individual,
}

/// A failed transport operation, with the SMTP reply code where there was one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Throttled ({code}): {message}")]
    Throttled { code: u16, message: String },

    #[error("Rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid message: {0}")]
    Message(String),
}

impl TransportError {
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::Authentication(_) => FailureClass::Authentication,
            Self::Throttled { .. } => FailureClass::Throttle,
            _ => FailureClass::Individual,
        }
    }

    /// The SMTP reply code behind this failure, if the server sent one.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::Throttled { code, .. } | Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// A run that could not complete.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The queue store failed. The run may have left entries `locked`; the
    /// next stale release recovers them.
    #[error("Queue store error: {0}")]
    Store(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}
