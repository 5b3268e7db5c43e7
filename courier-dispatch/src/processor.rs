use std::{sync::Arc, time::Duration};

use courier_common::{Signal, internal, tracing};
use tokio::sync::broadcast;

use crate::{dispatcher::Dispatcher, error::DispatchError};

/// Runs the dispatcher on a fixed interval until shutdown.
///
/// A run in progress is never interrupted: the shutdown signal is only
/// observed between runs.
#[derive(Debug, Clone)]
pub struct DispatchProcessor {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl DispatchProcessor {
    #[must_use]
    pub const fn new(dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }

    /// # Errors
    ///
    /// Currently never; failed runs are logged and retried on the next tick.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(
        &self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DispatchError> {
        internal!(
            level = INFO,
            "Dispatch processor starting, running every {:?}",
            self.interval
        );

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Skip the first tick to avoid immediate execution
        timer.tick().await;

        loop {
            tokio::select! {
                biased;

                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Dispatch processor received shutdown signal");
                        }
                        Err(e) => {
                            tracing::error!("Dispatch processor shutdown channel error: {e}");
                        }
                    }
                    break;
                }
                _ = timer.tick() => {
                    match self.dispatcher.run().await {
                        Ok(report) if report.halt().is_some() => {
                            tracing::warn!(?report, "Scheduled dispatch halted early");
                        }
                        Ok(report) => {
                            tracing::debug!(?report, "Scheduled dispatch complete");
                        }
                        Err(e) => {
                            tracing::error!("Scheduled dispatch failed: {e}");
                        }
                    }
                }
            }
        }

        internal!(level = INFO, "Dispatch processor shutdown complete");
        Ok(())
    }
}
