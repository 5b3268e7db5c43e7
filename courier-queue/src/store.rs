use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::address::EmailAddress;
use serde::Deserialize;

use crate::{
    Result,
    types::{EntryId, NewEntry, QueueCounts, QueueEntry, QueueStatus},
};

const fn default_stale_after() -> u64 {
    600 // 10 minutes
}

/// Store-level tuning shared by every backend.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// How long an entry may stay `locked` before another run may reclaim it
    /// (in seconds).
    ///
    /// Must comfortably exceed the longest possible run. A run that outlives
    /// it can have its remaining entries reclaimed and sent twice.
    ///
    /// Default: 600 seconds (10 minutes)
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl QueueConfig {
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
        }
    }
}

/// Durable home of every queue entry.
///
/// Implementations must make [`release_stale_claims`](Self::release_stale_claims)
/// and [`claim_batch`](Self::claim_batch) atomic with respect to each other
/// and to concurrent callers in other processes. The outcome operations only
/// touch entries that are still `locked`, and clear `locked_at` as they move
/// them out of that state; each returns the number of entries it changed.
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug {
    /// Return every entry locked for longer than the staleness threshold to
    /// `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached or updated.
    async fn release_stale_claims(&self) -> Result<u64>;

    /// Lock up to `limit` pending entries, oldest first, and return them in
    /// id order.
    ///
    /// Two concurrent callers never receive the same entry. An empty queue
    /// yields an empty batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached or updated.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueEntry>>;

    /// `locked -> sent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached or updated.
    async fn mark_sent(&self, id: EntryId, sent_at: DateTime<Utc>) -> Result<u64>;

    /// `locked -> failed`, recording `error`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached or updated.
    async fn mark_failed(&self, id: EntryId, error: &str) -> Result<u64>;

    /// `locked -> auth_failed` for every id in `ids`, recording `error`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached or updated.
    async fn mark_auth_failed(&self, ids: &[EntryId], error: &str) -> Result<u64>;

    /// `locked -> pending` for every id in `ids`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached or updated.
    async fn release(&self, ids: &[EntryId]) -> Result<u64>;

    /// Insert a new `pending` entry.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AlreadyQueued`](crate::QueueError::AlreadyQueued)
    /// if the recipient already has a pending or locked entry, or
    /// [`QueueError::InvalidEntry`](crate::QueueError::InvalidEntry) if the
    /// entry fails validation.
    async fn enqueue(&self, entry: NewEntry) -> Result<EntryId>;

    /// Whether `email` has ever been queued, in any status.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn contains_recipient(&self, email: &EmailAddress) -> Result<bool>;

    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn get(&self, id: EntryId) -> Result<Option<QueueEntry>>;

    /// Entries in id order, optionally restricted to one status.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>>;

    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn counts(&self) -> Result<QueueCounts>;
}
