use std::sync::{Arc, LazyLock};

use courier_common::{
    Signal,
    clock::{Clock, SystemClock},
    content::ContentCatalog,
    internal, tracing,
};
use courier_dispatch::{
    DispatchError, DispatchProcessor, DispatchReport, Dispatcher, Renderer, SmtpTransportFactory,
};
use courier_queue::{
    MemoryQueueStore, QueueConfig, QueueCounts, QueueStore,
    enroll::{self, Candidate, EnrollReport},
};
use tokio::sync::broadcast;

use crate::{
    config::{Config, StoreConfig},
    http::HttpServer,
};

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Wait for SIGINT or SIGTERM, then tell everything to stop.
#[tracing::instrument(level = "trace")]
async fn shutdown_on_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, finishing the current run");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, finishing the current run");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| anyhow::anyhow!("Unable to broadcast shutdown: {e}"))?;

    Ok(())
}

async fn open_store(
    store: &StoreConfig,
    queue: &QueueConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn QueueStore>> {
    match store {
        StoreConfig::Memory => {
            tracing::warn!("Using the in-memory queue; entries do not outlive this process");
            Ok(Arc::new(MemoryQueueStore::new(clock, queue.stale_after())))
        }
        #[cfg(feature = "postgres")]
        StoreConfig::Postgres {
            url,
            max_connections,
            migrate,
        } => {
            let store = courier_queue::PostgresQueueStore::connect(
                url,
                *max_connections,
                queue.stale_after(),
            )
            .await?;
            if *migrate {
                store.migrate().await?;
                internal!(level = INFO, "Queue schema is up to date");
            }
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StoreConfig::Postgres { .. } => {
            anyhow::bail!("This build has no postgres support; rebuild with `--features postgres`")
        }
    }
}

/// Everything a configured process needs, wired together.
#[derive(Debug)]
pub struct Courier {
    config: Config,
    store: Arc<dyn QueueStore>,
    content: Arc<ContentCatalog>,
    dispatcher: Arc<Dispatcher>,
}

impl Courier {
    /// Open the store and build the dispatcher. Nothing talks to the mail
    /// relay until a run has work.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or the message template
    /// cannot be read.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = open_store(&config.store, &config.queue, Arc::clone(&clock)).await?;
        let content = Arc::new(config.content.clone());

        let renderer = Renderer::new(config.dispatch.render.clone())?
            .with_unsubscribe_mailbox(config.smtp.from_address.clone());
        let transports = Arc::new(SmtpTransportFactory::new(config.smtp.clone()));

        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            content.clone(),
            transports,
            renderer,
            clock,
        )
        .with_pacing(config.dispatch.pacing());

        Ok(Self {
            config,
            store,
            content,
            dispatcher: Arc::new(dispatcher),
        })
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// One dispatch run.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue store fails.
    pub async fn dispatch(&self) -> Result<DispatchReport, DispatchError> {
        self.dispatcher.run().await
    }

    /// # Errors
    ///
    /// Returns an error if the queue store fails.
    pub async fn enroll(&self, candidates: Vec<Candidate>) -> anyhow::Result<EnrollReport> {
        let report = enroll::enroll(
            self.store.as_ref(),
            self.content.as_ref(),
            &self.config.enroll,
            candidates,
        )
        .await?;

        internal!(
            level = INFO,
            "Enrollment finished: enqueued={} skipped={} invalid={}",
            report.enqueued,
            report.skipped,
            report.invalid
        );
        Ok(report)
    }

    /// # Errors
    ///
    /// Returns an error if the queue store fails.
    pub async fn counts(&self) -> anyhow::Result<QueueCounts> {
        Ok(self.store.counts().await?)
    }

    /// Serve HTTP triggers, and scheduled runs when an interval is
    /// configured, until SIGINT or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP listener cannot be bound or fails.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn serve(self) -> anyhow::Result<()> {
        let http = HttpServer::bind(&self.config.http, Arc::clone(&self.dispatcher)).await?;
        let processor = self
            .config
            .dispatch
            .run_interval()
            .map(|interval| DispatchProcessor::new(Arc::clone(&self.dispatcher), interval));

        internal!(level = INFO, "Courier running");

        let http_shutdown = SHUTDOWN_BROADCAST.subscribe();
        let processor_shutdown = SHUTDOWN_BROADCAST.subscribe();
        let signals = tokio::spawn(shutdown_on_signal());

        let served = async move {
            let served = http.serve(http_shutdown).await;
            if served.is_err() {
                // Take the scheduler down with us.
                let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);
            }
            served
        };
        let scheduled = async move {
            match processor {
                Some(processor) => processor.serve(processor_shutdown).await,
                None => Ok(()),
            }
        };

        let (served, scheduled) = tokio::join!(served, scheduled);
        signals.abort();

        internal!(level = INFO, "Shutting down...");
        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);

        served?;
        scheduled?;
        Ok(())
    }
}
