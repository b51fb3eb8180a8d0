//! Relay server listener
//!
//! Binds the HTTP listener, starts the channel service's background work and
//! serves the routes until shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::channel::ChannelService;
use crate::error::Result;
use crate::server::config::ServerConfig;
use crate::server::http::{router, AppState};

/// HTTP relay server
pub struct RelayServer {
    config: ServerConfig,
    service: Arc<ChannelService>,
    state: Arc<AppState>,
}

impl RelayServer {
    /// Create a new server with the given configuration and channel service
    pub fn new(config: ServerConfig, service: Arc<ChannelService>) -> Self {
        let state = Arc::new(AppState::new(config.clone(), Arc::clone(&service)));
        Self {
            config,
            service,
            state,
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        router(Arc::clone(&self.state))
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server
    ///
    /// This method blocks until the server fails.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Relay server listening");

        let listener_handle = self.service.start();
        let stats_handle = self.spawn_stats_task();

        // Viewer bodies only end once their channels stop, so stop them first
        let service = Arc::clone(&self.service);
        let signal = async move {
            shutdown.await;
            tracing::info!("Shutdown signal received");
            service.shutdown();
        };

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await;

        if let Some(handle) = stats_handle {
            handle.abort();
        }
        self.service.shutdown();
        if let Some(handle) = listener_handle {
            let _ = handle.await;
        }

        tracing::info!("Relay server stopped");
        result.map_err(Into::into)
    }

    fn spawn_stats_task(&self) -> Option<JoinHandle<()>> {
        let interval = self.config.stats_interval;
        if interval.is_zero() {
            return None;
        }

        let state = Arc::clone(&self.state);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = state.stats();
                tracing::info!(
                    channels = stats.active_channels(),
                    sources = stats.active_sources(),
                    viewers = stats.active_connections,
                    total_viewers = stats.total_connections,
                    rejected = stats.rejected_connections,
                    bytes_sent = stats.total_bytes_sent,
                    "Relay stats"
                );
            }
        }))
    }
}
