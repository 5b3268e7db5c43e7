//! Claim protocol tests against a real PostgreSQL.
//!
//! Set `DATABASE_URL` to run them. Each test works in its own schema so they
//! can share one database.

#![cfg(feature = "postgres")]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{collections::HashSet, str::FromStr, time::Duration};

use courier_common::address::EmailAddress;
use courier_queue::{EntryId, NewEntry, PostgresQueueStore, QueueError, QueueStatus, QueueStore};
use pretty_assertions::assert_eq;
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};

struct TestDb {
    store: PostgresQueueStore,
    pool: PgPool,
    admin: PgPool,
    schema: String,
}

impl TestDb {
    async fn open(stale_after: Duration) -> Option<Self> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("skipping: DATABASE_URL not set");
            return None;
        };

        let admin = match PgPool::connect(&url).await {
            Ok(pool) => pool,
            Err(err) => {
                eprintln!("skipping: failed to connect to DATABASE_URL ({err})");
                return None;
            }
        };

        let schema = format!("courier_test_{:08x}", rand::random::<u32>());
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin)
            .await
            .unwrap();

        let options = PgConnectOptions::from_str(&url)
            .unwrap()
            .options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .unwrap();

        let store = PostgresQueueStore::new(pool.clone(), stale_after);
        store.migrate().await.unwrap();

        Some(Self {
            store,
            pool,
            admin,
            schema,
        })
    }

    async fn enqueue(&self, n: usize) -> Vec<EntryId> {
        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            ids.push(self.store.enqueue(entry(&format!("user{i}@example.com"))).await.unwrap());
        }
        ids
    }

    async fn backdate_lock(&self, id: EntryId) {
        sqlx::query("UPDATE email_queue SET locked_at = now() - interval '1 hour' WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    async fn teardown(self) {
        self.pool.close().await;
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await
            .unwrap();
    }
}

fn entry(email: &str) -> NewEntry {
    NewEntry::new(EmailAddress::parse(email).unwrap(), "Hello")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() {
    let Some(db) = TestDb::open(Duration::from_secs(600)).await else {
        return;
    };
    db.enqueue(100).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = db.store.clone();
        tasks.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = store.claim_batch(5).await.unwrap();
                if batch.is_empty() {
                    break mine;
                }
                assert!(batch.iter().all(|e| e.status == QueueStatus::Locked));
                assert!(batch.iter().all(|e| e.locked_at.is_some()));
                mine.extend(batch.into_iter().map(|e| e.id));
            }
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }

    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 100);
    assert_eq!(unique.len(), 100);

    let counts = db.store.counts().await.unwrap();
    assert_eq!(counts.locked, 100);
    assert_eq!(counts.pending, 0);

    db.teardown().await;
}

#[tokio::test]
async fn claims_oldest_first_up_to_the_limit() {
    let Some(db) = TestDb::open(Duration::from_secs(600)).await else {
        return;
    };
    let ids = db.enqueue(3).await;

    let batch = db.store.claim_batch(2).await.unwrap();
    assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), ids[..2].to_vec());

    assert!(db.store.claim_batch(0).await.unwrap().is_empty());
    assert_eq!(db.store.counts().await.unwrap().pending, 1);

    db.teardown().await;
}

#[tokio::test]
async fn stale_release_only_touches_expired_locks() {
    let Some(db) = TestDb::open(Duration::from_secs(600)).await else {
        return;
    };
    let ids = db.enqueue(2).await;
    db.store.claim_batch(10).await.unwrap();

    // Both claims are fresh by the database clock.
    assert_eq!(db.store.release_stale_claims().await.unwrap(), 0);

    db.backdate_lock(ids[0]).await;
    assert_eq!(db.store.release_stale_claims().await.unwrap(), 1);

    let released = db.store.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(released.status, QueueStatus::Pending);
    assert_eq!(released.locked_at, None);

    let held = db.store.get(ids[1]).await.unwrap().unwrap();
    assert_eq!(held.status, QueueStatus::Locked);

    // The released entry is claimable again.
    let reclaimed = db.store.claim_batch(10).await.unwrap();
    assert_eq!(reclaimed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![ids[0]]);

    db.teardown().await;
}

#[tokio::test]
async fn outcomes_only_apply_to_locked_entries() {
    let Some(db) = TestDb::open(Duration::from_secs(600)).await else {
        return;
    };
    let ids = db.enqueue(3).await;
    let now = chrono::Utc::now();

    // Nothing is claimed yet.
    assert_eq!(db.store.mark_sent(ids[0], now).await.unwrap(), 0);
    assert_eq!(db.store.mark_failed(ids[0], "boom").await.unwrap(), 0);
    assert_eq!(db.store.mark_auth_failed(&ids, "bad login").await.unwrap(), 0);
    assert_eq!(db.store.release(&ids).await.unwrap(), 0);

    db.store.claim_batch(10).await.unwrap();

    assert_eq!(db.store.mark_sent(ids[0], now).await.unwrap(), 1);
    assert_eq!(db.store.mark_failed(ids[1], "550 no such user").await.unwrap(), 1);

    // Terminal entries stay terminal.
    assert_eq!(db.store.mark_failed(ids[0], "late").await.unwrap(), 0);
    assert_eq!(db.store.release(&ids[..2]).await.unwrap(), 0);
    assert_eq!(db.store.mark_auth_failed(&ids, "bad login").await.unwrap(), 1);

    let sent = db.store.get(ids[0]).await.unwrap().unwrap();
    assert_eq!(sent.status, QueueStatus::Sent);
    assert!(sent.sent_at.is_some());
    assert_eq!(sent.error, None);

    let failed = db.store.get(ids[1]).await.unwrap().unwrap();
    assert_eq!(failed.status, QueueStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("550 no such user"));

    let auth = db.store.get(ids[2]).await.unwrap().unwrap();
    assert_eq!(auth.status, QueueStatus::AuthFailed);
    assert_eq!(auth.locked_at, None);

    db.teardown().await;
}

#[tokio::test]
async fn one_active_entry_per_recipient() {
    let Some(db) = TestDb::open(Duration::from_secs(600)).await else {
        return;
    };
    let first = db.store.enqueue(entry("a@example.com")).await.unwrap();

    let err = db.store.enqueue(entry("a@example.com")).await.unwrap_err();
    assert!(matches!(err, QueueError::AlreadyQueued(ref email) if email.as_str() == "a@example.com"));

    // Still blocked while locked.
    db.store.claim_batch(1).await.unwrap();
    assert!(matches!(
        db.store.enqueue(entry("a@example.com")).await,
        Err(QueueError::AlreadyQueued(_))
    ));

    // A terminal entry no longer counts as active.
    db.store.mark_failed(first, "550").await.unwrap();
    db.store.enqueue(entry("a@example.com")).await.unwrap();
    assert!(db.store.contains_recipient(&EmailAddress::parse("a@example.com").unwrap()).await.unwrap());
    assert_eq!(db.store.counts().await.unwrap().pending, 1);

    db.teardown().await;
}
