//! The email queue: entries, their state machine, and the stores that hold
//! them.
//!
//! Every entry moves `pending -> locked` only through
//! [`QueueStore::claim_batch`], and out of `locked` only through the outcome
//! operations. [`QueueStore::release_stale_claims`] recovers entries whose
//! claimer died mid-run.

pub mod backends;
pub mod enroll;
mod error;
pub mod store;
pub mod types;

pub use backends::MemoryQueueStore;
#[cfg(feature = "postgres")]
pub use backends::PostgresQueueStore;
pub use error::{QueueError, Result};
pub use store::{QueueConfig, QueueStore};
pub use types::{EntryId, NewEntry, QueueCounts, QueueEntry, QueueStatus};
