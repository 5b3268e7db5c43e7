use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{address::EmailAddress, clock::Clock, tracing};

use crate::{
    QueueError, Result,
    store::QueueStore,
    types::{EntryId, NewEntry, QueueCounts, QueueEntry, QueueStatus},
};

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<EntryId, QueueEntry>,
    next_id: i64,
}

impl State {
    /// Apply `f` to every listed entry that is still `locked`.
    fn transition(&mut self, ids: &[EntryId], mut f: impl FnMut(&mut QueueEntry)) -> u64 {
        let mut changed = 0;
        for id in ids {
            if let Some(entry) = self.entries.get_mut(id)
                && entry.status == QueueStatus::Locked
            {
                f(entry);
                entry.locked_at = None;
                changed += 1;
            }
        }
        changed
    }
}

/// In-memory queue store.
///
/// All entries live in a `BTreeMap` keyed by id behind a single `RwLock`, so
/// iteration is oldest-first and every mutating operation is one critical
/// section. Claims from concurrent tasks therefore never overlap. Intended for
/// tests and single-process deployments; nothing survives a restart.
#[derive(Debug, Clone)]
pub struct MemoryQueueStore {
    state: Arc<RwLock<State>>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, stale_after: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                entries: BTreeMap::new(),
                next_id: 1,
            })),
            clock,
            stale_after,
        }
    }

    /// Number of entries in any status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entries
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stale_cutoff(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn release_stale_claims(&self) -> Result<u64> {
        let cutoff = self.stale_cutoff();
        let mut state = self.state.write()?;

        let mut released = 0;
        for entry in state.entries.values_mut() {
            if entry.status == QueueStatus::Locked
                && entry.locked_at.is_none_or(|locked_at| locked_at < cutoff)
            {
                tracing::debug!(entry_id = %entry.id, "Releasing stale claim");
                entry.status = QueueStatus::Pending;
                entry.locked_at = None;
                released += 1;
            }
        }

        Ok(released)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let now = self.clock.now();
        let mut state = self.state.write()?;

        let claimed = state
            .entries
            .values_mut()
            .filter(|entry| entry.status == QueueStatus::Pending)
            .take(limit)
            .map(|entry| {
                entry.status = QueueStatus::Locked;
                entry.locked_at = Some(now);
                entry.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn mark_sent(&self, id: EntryId, sent_at: DateTime<Utc>) -> Result<u64> {
        Ok(self.state.write()?.transition(&[id], |entry| {
            entry.status = QueueStatus::Sent;
            entry.sent_at = Some(sent_at);
            entry.error = None;
        }))
    }

    async fn mark_failed(&self, id: EntryId, error: &str) -> Result<u64> {
        Ok(self.state.write()?.transition(&[id], |entry| {
            entry.status = QueueStatus::Failed;
            entry.error = Some(error.to_string());
        }))
    }

    async fn mark_auth_failed(&self, ids: &[EntryId], error: &str) -> Result<u64> {
        Ok(self.state.write()?.transition(ids, |entry| {
            entry.status = QueueStatus::AuthFailed;
            entry.error = Some(error.to_string());
        }))
    }

    async fn release(&self, ids: &[EntryId]) -> Result<u64> {
        Ok(self.state.write()?.transition(ids, |entry| {
            entry.status = QueueStatus::Pending;
        }))
    }

    async fn enqueue(&self, entry: NewEntry) -> Result<EntryId> {
        entry.validate()?;

        let created_at = self.clock.now();
        let mut state = self.state.write()?;

        if state.entries.values().any(|existing| {
            existing.status.is_active() && existing.recipient_email == entry.recipient_email
        }) {
            return Err(QueueError::AlreadyQueued(entry.recipient_email));
        }

        let id = EntryId(state.next_id);
        state.next_id += 1;
        state.entries.insert(
            id,
            QueueEntry {
                id,
                recipient_email: entry.recipient_email,
                recipient_name: entry.recipient_name,
                unsubscribe_token: entry.unsubscribe_token,
                subject: entry.subject,
                language: entry.language,
                status: QueueStatus::Pending,
                locked_at: None,
                error: None,
                sent_at: None,
                created_at,
            },
        );

        Ok(id)
    }

    async fn contains_recipient(&self, email: &EmailAddress) -> Result<bool> {
        Ok(self
            .state
            .read()?
            .entries
            .values()
            .any(|entry| &entry.recipient_email == email))
    }

    async fn get(&self, id: EntryId) -> Result<Option<QueueEntry>> {
        Ok(self.state.read()?.entries.get(&id).cloned())
    }

    async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>> {
        Ok(self
            .state
            .read()?
            .entries
            .values()
            .filter(|entry| status.is_none_or(|status| entry.status == status))
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let state = self.state.read()?;
        let mut counts = QueueCounts::default();
        for entry in state.entries.values() {
            counts.add(entry.status, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use courier_common::clock::ManualClock;
    use pretty_assertions::assert_eq;

    use super::*;

    fn store() -> (MemoryQueueStore, ManualClock) {
        let clock = ManualClock::default();
        let store = MemoryQueueStore::new(Arc::new(clock.clone()), Duration::from_secs(600));
        (store, clock)
    }

    fn entry(email: &str) -> NewEntry {
        NewEntry::new(EmailAddress::parse(email).unwrap(), "Hello")
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Calls an unsupported method")]
    async fn claim_locks_oldest_first() {
        let (store, clock) = store();
        let a = store.enqueue(entry("a@example.com")).await.unwrap();
        let b = store.enqueue(entry("b@example.com")).await.unwrap();
        let c = store.enqueue(entry("c@example.com")).await.unwrap();

        let batch = store.claim_batch(2).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(batch.iter().all(|e| e.status == QueueStatus::Locked));
        assert!(batch.iter().all(|e| e.locked_at == Some(clock.now())));

        let rest = store.claim_batch(10).await.unwrap();
        assert_eq!(rest.iter().map(|e| e.id).collect::<Vec<_>>(), vec![c]);

        assert!(store.claim_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_zero_is_empty() {
        let (store, _) = store();
        store.enqueue(entry("a@example.com")).await.unwrap();
        assert!(store.claim_batch(0).await.unwrap().is_empty());
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn stale_claims_are_released_only_after_threshold() {
        let (store, clock) = store();
        let id = store.enqueue(entry("a@example.com")).await.unwrap();
        store.claim_batch(1).await.unwrap();

        clock.advance(Duration::from_secs(600));
        assert_eq!(store.release_stale_claims().await.unwrap(), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.release_stale_claims().await.unwrap(), 1);

        let released = store.get(id).await.unwrap().unwrap();
        assert_eq!(released.status, QueueStatus::Pending);
        assert_eq!(released.locked_at, None);
    }

    #[tokio::test]
    async fn outcomes_only_apply_to_locked_entries() {
        let (store, clock) = store();
        let id = store.enqueue(entry("a@example.com")).await.unwrap();

        // Still pending: nothing may move it but a claim.
        assert_eq!(store.mark_sent(id, clock.now()).await.unwrap(), 0);
        assert_eq!(store.mark_failed(id, "x").await.unwrap(), 0);
        assert_eq!(store.release(&[id]).await.unwrap(), 0);

        store.claim_batch(1).await.unwrap();
        assert_eq!(store.mark_sent(id, clock.now()).await.unwrap(), 1);

        // Terminal states are never revisited.
        assert_eq!(store.mark_failed(id, "late").await.unwrap(), 0);
        assert_eq!(store.release(&[id]).await.unwrap(), 0);

        let sent = store.get(id).await.unwrap().unwrap();
        assert_eq!(sent.status, QueueStatus::Sent);
        assert_eq!(sent.sent_at, Some(clock.now()));
        assert_eq!(sent.locked_at, None);
        assert_eq!(sent.error, None);
    }

    #[tokio::test]
    async fn bulk_outcomes_clear_the_lock() {
        let (store, _) = store();
        let a = store.enqueue(entry("a@example.com")).await.unwrap();
        let b = store.enqueue(entry("b@example.com")).await.unwrap();
        let c = store.enqueue(entry("c@example.com")).await.unwrap();
        store.claim_batch(3).await.unwrap();

        assert_eq!(store.mark_auth_failed(&[a, b], "535 bad creds").await.unwrap(), 2);
        assert_eq!(store.release(&[c]).await.unwrap(), 1);

        let auth_failed = store.list(Some(QueueStatus::AuthFailed)).await.unwrap();
        assert_eq!(auth_failed.len(), 2);
        assert!(auth_failed.iter().all(|e| e.locked_at.is_none()
            && e.error.as_deref() == Some("535 bad creds")));

        let pending = store.get(c).await.unwrap().unwrap();
        assert_eq!(pending.status, QueueStatus::Pending);
        assert_eq!(pending.locked_at, None);
    }

    #[tokio::test]
    async fn recipient_is_unique_while_active() {
        let (store, clock) = store();
        let id = store.enqueue(entry("a@example.com")).await.unwrap();

        assert!(matches!(
            store.enqueue(entry("A@Example.com")).await,
            Err(QueueError::AlreadyQueued(_))
        ));

        store.claim_batch(1).await.unwrap();
        assert!(matches!(
            store.enqueue(entry("a@example.com")).await,
            Err(QueueError::AlreadyQueued(_))
        ));

        store.mark_sent(id, clock.now()).await.unwrap();
        store.enqueue(entry("a@example.com")).await.unwrap();

        let email = EmailAddress::parse("a@example.com").unwrap();
        assert!(store.contains_recipient(&email).await.unwrap());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn counts_by_status() {
        let (store, _) = store();
        for email in ["a@example.com", "b@example.com", "c@example.com"] {
            store.enqueue(entry(email)).await.unwrap();
        }
        let batch = store.claim_batch(2).await.unwrap();
        store.mark_failed(batch[0].id, "boom").await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(
            counts,
            QueueCounts {
                pending: 1,
                locked: 1,
                failed: 1,
                ..QueueCounts::default()
            }
        );
        assert_eq!(counts.total(), 3);
    }
}
