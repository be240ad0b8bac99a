pub mod dispatcher;
mod routes;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::sync::RwLock;
use tracing::info;

use crate::command::SchedulingMode;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::registry::FingerprintRegistry;
use crate::store::StateStore;
use crate::{Error, Result};

/// How long we are willing to wait for the HTTP server to shut down
/// gracefully.
const SERVER_SHUTDOWN_TIME: Duration = Duration::from_secs(4);

/// Snapshot of the command bound to a live fingerprint, written before its
/// Runner starts and read back once the Runner completes.
#[derive(Debug, Clone)]
pub struct CommandDetails {
    pub cmd: String,
    pub args: Vec<String>,
    pub scheduling: SchedulingMode,
}

pub struct Server {
    pub config: Config,
    pub store: Arc<dyn StateStore>,
    pub registry: FingerprintRegistry,
    pub metrics: Metrics,
    pub command_details: RwLock<HashMap<String, CommandDetails>>,
}

impl Server {
    pub fn new(config: Config, store: Arc<dyn StateStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            registry: FingerprintRegistry::new(),
            metrics: Metrics::new(),
            command_details: RwLock::new(HashMap::new()),
        })
    }

    pub fn build_router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", post(routes::webhook))
            .route("/_health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/release", post(routes::release))
            .with_state(self.clone())
    }

    /// Bind the HTTP surface and serve until a shutdown signal arrives,
    /// then drain connections within the grace period.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .server
            .listen_address
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address: {}", e)))?;

        let router = self.build_router();
        let handle = Handle::new();

        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutting down HTTP server");
            shutdown_handle.graceful_shutdown(Some(SERVER_SHUTDOWN_TIME));
        });

        let tls_crt = &self.config.server.tls_crt;
        let tls_key = &self.config.server.tls_key;
        info!("Listening on {}", addr);
        if !tls_crt.is_empty() && !tls_key.is_empty() {
            info!("HTTPS on");
            // A process-level crypto provider must exist before rustls
            // config can be built.
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
            let tls_config = RustlsConfig::from_pem_file(tls_crt, tls_key)
                .await
                .map_err(|e| Error::Config(format!("failed to load TLS material: {}", e)))?;
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(router.into_make_service())
                .await?;
        } else {
            info!("HTTPS off");
            axum_server::bind(addr)
                .handle(handle)
                .serve(router.into_make_service())
                .await?;
        }

        info!("HTTP server shut down");
        Ok(())
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
