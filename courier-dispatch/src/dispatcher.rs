//! One dispatch run: recover, claim, verify, send, record.

use std::sync::Arc;

use courier_common::{clock::Clock, content::ContentResolver, internal, tracing};
use courier_queue::{EntryId, QueueEntry, QueueStore};
use serde::Serialize;

use crate::{
    error::{DispatchError, FailureClass, TransportError},
    pacing::PacingPolicy,
    render::Renderer,
    transport::{Transport, TransportFactory},
};

/// Why a run stopped before the end of its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    Authentication,
    RateLimited,
}

/// The outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub sent: usize,
    /// Includes the entry that triggered a throttle halt.
    pub failed: usize,
    pub auth_failed: usize,
    /// Entries claimed by this run.
    pub total: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub auth_error: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub rate_limited: bool,
    /// Stale claims returned to `pending` before claiming.
    #[serde(skip)]
    pub released: u64,
}

impl DispatchReport {
    #[must_use]
    pub const fn halt(&self) -> Option<Halt> {
        if self.auth_error {
            Some(Halt::Authentication)
        } else if self.rate_limited {
            Some(Halt::RateLimited)
        } else {
            None
        }
    }

    /// Entries left `pending` by a throttle halt.
    #[must_use]
    pub const fn deferred(&self) -> usize {
        self.total
            .saturating_sub(self.sent + self.failed + self.auth_failed)
    }
}

/// Runs batches from a [`QueueStore`] through a [`Transport`].
///
/// A run never holds state between invocations; any number of dispatchers
/// may share one store.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    content: Arc<dyn ContentResolver>,
    transports: Arc<dyn TransportFactory>,
    renderer: Arc<Renderer>,
    clock: Arc<dyn Clock>,
    pacing: PacingPolicy,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn QueueStore>,
        content: Arc<dyn ContentResolver>,
        transports: Arc<dyn TransportFactory>,
        renderer: Renderer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            content,
            transports,
            renderer: Arc::new(renderer),
            clock,
            pacing: PacingPolicy::default(),
        }
    }

    #[must_use]
    pub const fn with_pacing(mut self, pacing: PacingPolicy) -> Self {
        self.pacing = pacing;
        self
    }

    #[must_use]
    pub const fn pacing(&self) -> PacingPolicy {
        self.pacing
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Execute one run.
    ///
    /// # Errors
    ///
    /// Only queue store failures are returned. Transport failures end up as
    /// entry outcomes and flags on the report.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn run(&self) -> Result<DispatchReport, DispatchError> {
        let released = self.store.release_stale_claims().await?;
        if released > 0 {
            tracing::warn!(released, "Released stale claims");
        }

        let batch = self.store.claim_batch(self.pacing.batch_size).await?;
        if batch.is_empty() {
            tracing::debug!("Queue empty, nothing to dispatch");
            return Ok(DispatchReport {
                released,
                ..DispatchReport::default()
            });
        }
        internal!(level = INFO, "Claimed {} entries", batch.len());

        let mut report = DispatchReport {
            total: batch.len(),
            released,
            ..DispatchReport::default()
        };

        let mut transport = self.transports.create();
        let outcome = self.process(transport.as_mut(), &batch, &mut report).await;
        transport.close().await;
        outcome?;

        internal!(
            level = INFO,
            "Dispatch finished: sent={} failed={} auth_failed={} deferred={}",
            report.sent,
            report.failed,
            report.auth_failed,
            report.deferred()
        );
        Ok(report)
    }

    async fn process(
        &self,
        transport: &mut dyn Transport,
        batch: &[QueueEntry],
        report: &mut DispatchReport,
    ) -> Result<(), DispatchError> {
        if let Err(e) = transport.verify().await {
            tracing::error!(error = %e, "Transport verification failed, abandoning batch");
            let ids: Vec<EntryId> = batch.iter().map(|entry| entry.id).collect();
            self.store.mark_auth_failed(&ids, &e.to_string()).await?;
            report.auth_failed = ids.len();
            report.auth_error = true;
            return Ok(());
        }

        for (index, entry) in batch.iter().enumerate() {
            let content = self.content.resolve(entry.language.as_deref());
            let message = self.renderer.render(entry, &content);

            match transport.send(&message).await {
                Ok(()) => {
                    let changed = self.store.mark_sent(entry.id, self.clock.now()).await?;
                    warn_if_unlocked(entry, changed);
                    tracing::info!(entry_id = %entry.id, recipient = %entry.recipient_email, "Sent");
                    report.sent += 1;

                    if let Some(wait) = self.pacing.after_success(index, batch.len()) {
                        self.clock.sleep(wait).await;
                    }
                }
                Err(e) => {
                    if self.handle_failure(&batch[index..], &e, report).await? {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }

    /// Record a failed send for `remaining[0]`. Returns whether the batch
    /// must stop.
    async fn handle_failure(
        &self,
        remaining: &[QueueEntry],
        error: &TransportError,
        report: &mut DispatchReport,
    ) -> Result<bool, DispatchError> {
        let Some((current, rest)) = remaining.split_first() else {
            return Ok(false);
        };
        let detail = error.to_string();

        match error.class() {
            FailureClass::Authentication => {
                tracing::error!(
                    entry_id = %current.id,
                    error = %error,
                    "Authentication failed, halting batch"
                );
                let ids: Vec<EntryId> = remaining.iter().map(|entry| entry.id).collect();
                self.store.mark_auth_failed(&ids, &detail).await?;
                report.auth_failed += ids.len();
                report.auth_error = true;
                Ok(true)
            }
            FailureClass::Throttle => {
                tracing::warn!(
                    entry_id = %current.id,
                    code = ?error.code(),
                    deferred = rest.len(),
                    "Provider is throttling, halting batch"
                );
                let changed = self.store.mark_failed(current.id, &detail).await?;
                warn_if_unlocked(current, changed);
                report.failed += 1;

                let ids: Vec<EntryId> = rest.iter().map(|entry| entry.id).collect();
                self.store.release(&ids).await?;
                report.rate_limited = true;
                Ok(true)
            }
            FailureClass::Individual => {
                tracing::warn!(
                    entry_id = %current.id,
                    recipient = %current.recipient_email,
                    code = ?error.code(),
                    error = %error,
                    "Send failed"
                );
                let changed = self.store.mark_failed(current.id, &detail).await?;
                warn_if_unlocked(current, changed);
                report.failed += 1;
                Ok(false)
            }
        }
    }
}

/// An outcome update that changed nothing means someone released our claim.
fn warn_if_unlocked(entry: &QueueEntry, changed: u64) {
    if changed == 0 {
        tracing::warn!(
            entry_id = %entry.id,
            "Entry was no longer locked by this run; outcome not recorded"
        );
    }
}
