//! Unit verification HTTP server.
//!
//! Exposes the consumer QR verification endpoint plus health and stats,
//! backed by the local scan store, the registry mirror, and the in-process
//! risk classifier.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use eyre::{Result, WrapErr};
use lru::LruCache;
use tokio::sync::{Mutex, OnceCell};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::ledger::RegistryClient;
use crate::model::RiskModel;
use crate::notify::NotificationClient;
use crate::store::ScanStore;

pub mod handlers;
pub mod logging;
pub mod middleware;
pub mod types;

pub use types::ServerConfig;

use logging::UsageMetrics;
use middleware::IpRateLimiter;

/// Shared server state.
pub struct ServerState {
    pub config: ServerConfig,
    pub store: ScanStore,
    pub ledger: RegistryClient,
    pub notifier: NotificationClient,
    /// Classifier weights, loaded once on first use and shared for the
    /// process lifetime. A load failure is returned to every caller; the
    /// cell stays empty so a fixed artifact can succeed later.
    model: OnceCell<Arc<RiskModel>>,
    pub usage: UsageMetrics,
    pub rate_limiters: Mutex<LruCache<IpAddr, Arc<IpRateLimiter>>>,
    pub start_time: Instant,
}

impl ServerState {
    pub fn new(config: ServerConfig, store: ScanStore) -> Self {
        let ledger = RegistryClient::with_base_url(&config.ledger_url);
        let notifier = NotificationClient::with_base_url(&config.notify_url);
        let usage = UsageMetrics::new(&config.access_log_path, config.max_access_log_bytes);

        Self {
            config,
            store,
            ledger,
            notifier,
            model: OnceCell::new(),
            usage,
            rate_limiters: middleware::new_rate_limiter_cache(),
            start_time: Instant::now(),
        }
    }

    /// Get the risk model, loading it on first call.
    pub async fn model(&self) -> Result<Arc<RiskModel>> {
        self.model
            .get_or_try_init(|| async {
                let model = RiskModel::load(&self.config.model_path).wrap_err_with(|| {
                    format!(
                        "loading risk model from {}",
                        self.config.model_path.display()
                    )
                })?;
                info!(
                    hash = model.hash(),
                    version = model.version(),
                    "risk model loaded"
                );
                Ok(Arc::new(model))
            })
            .await
            .cloned()
    }

    /// Artifact hash of the loaded model, if it has been loaded yet.
    pub fn model_hash(&self) -> Option<String> {
        self.model.get().map(|m| m.hash().to_string())
    }
}

/// Build the application router. Exposed so tests can drive the full
/// request pipeline without binding a configured port.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(
            "/api/v1/verify/unit/{serial_number}",
            get(handlers::verify_unit_handler),
        )
        .route("/health", get(handlers::health_handler))
        .route("/stats", get(handlers::stats_handler))
        .layer(CorsLayer::permissive())
        // All endpoints are GET; any posted body is bounded small.
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}

/// Run the verification server until SIGINT or SIGTERM.
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let store = ScanStore::open(&config.db_path)
        .wrap_err_with(|| format!("opening scan store at {}", config.db_path.display()))?;

    let bind_addr = config.bind_addr;
    let state = Arc::new(ServerState::new(config, store));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .wrap_err_with(|| format!("binding to {bind_addr}"))?;

    info!(addr = %bind_addr, "verification server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .wrap_err("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install sigterm handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received sigterm, shutting down"),
    }
}
