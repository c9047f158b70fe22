//! HTTP server wiring.
//!
//! One listener serves both the proxied traffic (every path, every
//! method, via the fallback handler) and the management endpoint
//! `GET /metrics`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use gangway_common::error::{GangwayError, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::dispatcher::{dispatch, ProxyContext};

pub struct ProxyServer {
    context: Arc<ProxyContext>,
}

impl ProxyServer {
    pub fn new(context: Arc<ProxyContext>) -> Self {
        Self { context }
    }

    /// Builds the axum router: the metrics route plus the catch-all
    /// dispatcher.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(serve_metrics))
            .fallback(dispatch)
            .with_state(self.context.clone())
    }

    /// Binds and serves until the shutdown future resolves.
    pub async fn run(
        self,
        addr: &str,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GangwayError::Bind(format!("{}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GangwayError::Bind(e.to_string()))?;

        info!(listen_addr = %local_addr, "http_server_start");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| GangwayError::Transport(format!("server error: {}", e)))?;

        Ok(())
    }
}

async fn serve_metrics(State(ctx): State<Arc<ProxyContext>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        ctx.metrics.render(),
    )
}
