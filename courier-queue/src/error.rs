//! Error types for the queue store.

use courier_common::address::EmailAddress;
use thiserror::Error;

/// Errors raised by a [`QueueStore`](crate::QueueStore).
#[derive(Debug, Error)]
pub enum QueueError {
    /// The recipient already has a pending or locked entry.
    #[error("Recipient already queued: {0}")]
    AlreadyQueued(EmailAddress),

    /// The entry was rejected before reaching the store.
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// A stored row could not be mapped back onto a queue entry.
    #[error("Corrupt queue row: {0}")]
    CorruptRow(String),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "postgres")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specialized `Result` type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

impl<T> From<std::sync::PoisonError<T>> for QueueError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn poisoned_lock_becomes_internal() {
        let lock = Arc::new(Mutex::new(0));
        let poisoner = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock();
            panic!("poison");
        })
        .join();

        let err: QueueError = lock.lock().map(|_| ()).unwrap_err().into();
        assert!(matches!(err, QueueError::Internal(_)));
        assert!(err.to_string().starts_with("Internal error: Lock poisoned"));
    }
}
