//! Router composition and startup.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;

use crate::api;
use crate::state::AppState;
use crate::{WebConfig, WebError};

/// The Toxic-MD liveness server.
pub struct WebServer {
    config: WebConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: WebConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Return the `host:port` string this server will bind to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.bind_addr, self.config.port)
    }

    /// Build the Axum router with all routes registered.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(api::index))
            .route("/ping", get(api::ping))
            .route("/health", get(api::health))
            .route("/status", get(api::status))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns [`WebError::Bind`] if the TCP listener cannot be bound.
    pub async fn start<F>(self, shutdown: F) -> Result<(), WebError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| WebError::Bind { addr: addr.clone(), source })?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), WebError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        match listener.local_addr() {
            Ok(local) => tracing::info!(addr = %local, "starting web server"),
            Err(_) => tracing::info!(addr = %self.addr(), "starting web server"),
        }

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(WebError::Serve)?;

        tracing::info!("web server stopped");
        Ok(())
    }
}
