//! encounterd - combat encounter daemon
//!
//! A D&D 5e combat engine (dice, conditions, initiative and actions) with a
//! live battlefield feed for observers over WebSocket.

pub mod api;
pub mod battlefield;
pub mod combat;
pub mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use api::AppState;
use battlefield::Battlefield;
use combat::EncounterManager;
pub use config::Config;

/// The encounterd server instance
pub struct Server {
    config: Arc<Config>,
    engine: Arc<EncounterManager>,
    battlefield: Arc<Battlefield>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Create a new server instance with the engine wired to the battlefield
    pub fn new(config: Config) -> Self {
        let battlefield = Battlefield::new(config.outbox_capacity).shared();
        let engine = EncounterManager::new(config.default_seed)
            .with_sink(battlefield.clone())
            .shared();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config: Arc::new(config),
            engine,
            battlefield,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn engine(&self) -> Arc<EncounterManager> {
        self.engine.clone()
    }

    pub fn battlefield(&self) -> Arc<Battlefield> {
        self.battlefield.clone()
    }

    /// Build the router
    pub fn router(&self) -> Router {
        api::router(AppState {
            engine: self.engine.clone(),
            battlefield: self.battlefield.clone(),
            config: self.config.clone(),
        })
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(self.config.bind_addr).await?)
    }

    /// Run the server until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!("encounterd listening on {}", local_addr);

        let router = self.router();
        let mut shutdown_rx = self.shutdown_rx.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await?;

        info!("encounterd shutdown complete");
        Ok(())
    }

    /// Signal the server to shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}
