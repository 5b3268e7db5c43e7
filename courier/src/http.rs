//! HTTP trigger for dispatch runs

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use courier_common::{Signal, internal, tracing};
use courier_dispatch::{DispatchError, DispatchReport, Dispatcher, Halt};
use serde::Deserialize;
use thiserror::Error;
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::timeout::TimeoutLayer;

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Default: `127.0.0.1:8080`
    #[serde(default = "defaults::listen_address")]
    pub listen_address: String,

    /// Upper bound on one request, in seconds. A dispatch run paces its
    /// sends, so this must exceed `batch_size * pacing_interval`.
    ///
    /// Default: 300
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_address: defaults::listen_address(),
            request_timeout_secs: defaults::request_timeout_secs(),
        }
    }
}

mod defaults {
    pub fn listen_address() -> String {
        "127.0.0.1:8080".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        300
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server error: {0}")]
    Server(String),
}

/// The routes, without a listener.
pub fn router(dispatcher: Arc<Dispatcher>, timeout: Duration) -> Router {
    Router::new()
        .route("/dispatch", post(dispatch_handler))
        .route("/health/live", get(liveness_handler))
        .with_state(dispatcher)
        .layer(TimeoutLayer::new(timeout))
}

pub struct HttpServer {
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    /// # Errors
    ///
    /// Returns an error if binding to the configured address fails.
    pub async fn bind(config: &HttpConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, HttpError> {
        let listener = TcpListener::bind(&config.listen_address)
            .await
            .map_err(|e| HttpError::Bind {
                address: config.listen_address.clone(),
                source: e,
            })?;

        tracing::info!(address = %config.listen_address, "HTTP server bound");

        Ok(Self {
            listener,
            router: router(
                dispatcher,
                Duration::from_secs(config.request_timeout_secs),
            ),
        })
    }

    /// Serve until a shutdown signal arrives. Requests in flight are allowed
    /// to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails at runtime.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), HttpError> {
        internal!(level = INFO, "HTTP server starting");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                internal!(level = INFO, "HTTP server received shutdown signal");
            })
            .await
            .map_err(|e| HttpError::Server(e.to_string()))?;

        internal!(level = INFO, "HTTP server stopped");
        Ok(())
    }
}

/// Run the dispatcher once.
///
/// The run is spawned so that it finishes its batch even when the request
/// times out or the caller goes away.
async fn dispatch_handler(State(dispatcher): State<Arc<Dispatcher>>) -> Response {
    let run = tokio::spawn(async move { dispatcher.run().await });

    match run.await {
        Ok(outcome) => report_response(outcome),
        Err(e) => {
            tracing::error!("Dispatch run aborted: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("Dispatch run aborted: {e}") })),
            )
                .into_response()
        }
    }
}

async fn liveness_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

/// 200 for a complete run, 500 for an authentication halt, 429 for a
/// throttle halt.
pub const fn status_for(report: &DispatchReport) -> StatusCode {
    match report.halt() {
        None => StatusCode::OK,
        Some(Halt::Authentication) => StatusCode::INTERNAL_SERVER_ERROR,
        Some(Halt::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
    }
}

fn report_response(outcome: Result<DispatchReport, DispatchError>) -> Response {
    match outcome {
        Ok(report) => (status_for(&report), Json(report)).into_response(),
        Err(e) => {
            tracing::error!("Dispatch run failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
