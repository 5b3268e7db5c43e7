//! PostgreSQL queue store.
//!
//! Every state change is a single SQL statement. Claims select candidate rows
//! with `FOR UPDATE SKIP LOCKED` inside the `UPDATE`, so concurrent claimers
//! skip rows another transaction is already taking instead of blocking on
//! them, and each row is handed to exactly one caller. Times come from the
//! database clock so that workers on different hosts agree on staleness.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{address::EmailAddress, internal};
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::{
    QueueError, Result,
    store::QueueStore,
    types::{EntryId, NewEntry, QueueCounts, QueueEntry, QueueStatus},
};

const COLUMNS: &str = "id, recipient_email, recipient_name, unsubscribe_token, subject, \
                       language, status, locked_at, error, sent_at, created_at";

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: i64,
    recipient_email: String,
    recipient_name: Option<String>,
    unsubscribe_token: Option<String>,
    subject: String,
    language: Option<String>,
    status: String,
    locked_at: Option<DateTime<Utc>>,
    error: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<QueueRow> for QueueEntry {
    type Error = QueueError;

    fn try_from(row: QueueRow) -> Result<Self> {
        let recipient_email = EmailAddress::parse(&row.recipient_email)
            .map_err(|e| QueueError::CorruptRow(format!("entry {}: {e}", row.id)))?;

        Ok(Self {
            id: EntryId(row.id),
            recipient_email,
            recipient_name: row.recipient_name,
            unsubscribe_token: row.unsubscribe_token,
            subject: row.subject,
            language: row.language,
            status: row.status.parse()?,
            locked_at: row.locked_at,
            error: row.error,
            sent_at: row.sent_at,
            created_at: row.created_at,
        })
    }
}

fn raw_ids(ids: &[EntryId]) -> Vec<i64> {
    ids.iter().map(|id| id.0).collect()
}

/// Queue store backed by the `email_queue` table.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
    stale_after: Duration,
}

impl PostgresQueueStore {
    #[must_use]
    pub const fn new(pool: PgPool, stale_after: Duration) -> Self {
        Self { pool, stale_after }
    }

    /// Open a pool against `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be established.
    pub async fn connect(url: &str, max_connections: u32, stale_after: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        internal!("Connected to queue database");
        Ok(Self::new(pool, stale_after))
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails to apply.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn stale_after_secs(&self) -> f64 {
        self.stale_after.as_secs_f64()
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    async fn release_stale_claims(&self) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE email_queue
            SET status = 'pending', locked_at = NULL
            WHERE status = 'locked'
              AND locked_at < now() - make_interval(secs => $1)
            ",
        )
        .bind(self.stale_after_secs())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            r"
            UPDATE email_queue
            SET status = 'locked', locked_at = now()
            WHERE id IN (
                SELECT id FROM email_queue
                WHERE status = 'pending'
                ORDER BY id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        // RETURNING carries no ordering guarantee.
        let mut entries = rows
            .into_iter()
            .map(QueueEntry::try_from)
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.id);

        Ok(entries)
    }

    async fn mark_sent(&self, id: EntryId, sent_at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE email_queue
            SET status = 'sent', sent_at = $2, locked_at = NULL, error = NULL
            WHERE id = $1 AND status = 'locked'
            ",
        )
        .bind(id.0)
        .bind(sent_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_failed(&self, id: EntryId, error: &str) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE email_queue
            SET status = 'failed', error = $2, locked_at = NULL
            WHERE id = $1 AND status = 'locked'
            ",
        )
        .bind(id.0)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_auth_failed(&self, ids: &[EntryId], error: &str) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r"
            UPDATE email_queue
            SET status = 'auth_failed', error = $2, locked_at = NULL
            WHERE id = ANY($1) AND status = 'locked'
            ",
        )
        .bind(raw_ids(ids))
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn release(&self, ids: &[EntryId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r"
            UPDATE email_queue
            SET status = 'pending', locked_at = NULL
            WHERE id = ANY($1) AND status = 'locked'
            ",
        )
        .bind(raw_ids(ids))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn enqueue(&self, entry: NewEntry) -> Result<EntryId> {
        entry.validate()?;

        let inserted = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO email_queue
                (recipient_email, recipient_name, unsubscribe_token, subject, language)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            ",
        )
        .bind(entry.recipient_email.as_str())
        .bind(entry.recipient_name.as_deref())
        .bind(entry.unsubscribe_token.as_deref())
        .bind(&entry.subject)
        .bind(entry.language.as_deref())
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(id) => Ok(EntryId(id)),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(QueueError::AlreadyQueued(entry.recipient_email))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn contains_recipient(&self, email: &EmailAddress) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM email_queue WHERE recipient_email = $1)",
        )
        .bind(email.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn get(&self, id: EntryId) -> Result<Option<QueueEntry>> {
        let row: Option<QueueRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM email_queue WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(QueueEntry::try_from).transpose()
    }

    async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM email_queue \
             WHERE $1::text IS NULL OR status = $1 \
             ORDER BY id ASC"
        ))
        .bind(status.map(QueueStatus::as_str))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, count(*) FROM email_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (status, n) in rows {
            counts.add(status.parse()?, u64::try_from(n).unwrap_or_default());
        }

        Ok(counts)
    }
}
