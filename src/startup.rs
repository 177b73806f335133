//! Application startup and lifecycle management.

use crate::config::AppConfig;
use crate::error::AppError;
use crate::handlers;
use crate::services::database::Database;
use crate::services::filing::FilingWorkflow;
use crate::services::inflight::InflightSet;
use crate::services::payments::PaymentSourceClient;
use crate::services::sync::SyncWorkflow;
use crate::services::tax_api::TaxClient;
use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub payments: Arc<PaymentSourceClient>,
    pub tax: Arc<TaxClient>,
    pub filing: FilingWorkflow,
    pub sync: Arc<SyncWorkflow>,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: AppConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build without running migrations. For tests where the harness already
    /// applied them.
    pub async fn build_without_migrations(config: AppConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: AppConfig, run_migrations: bool) -> Result<Self, AppError> {
        let db = Database::new(&config.database).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let payments = Arc::new(PaymentSourceClient::new(&config.payment_source));
        let tax = Arc::new(TaxClient::new(&config.tax_authority));

        let shutdown = CancellationToken::new();
        let filing = FilingWorkflow::new(
            Arc::clone(&db),
            Arc::clone(&tax),
            InflightSet::new(),
            shutdown.clone(),
            Duration::from_secs(config.verify_delay_secs),
        );
        let sync = Arc::new(SyncWorkflow::new(Arc::clone(&db), Arc::clone(&tax)));

        let state = AppState {
            config: config.clone(),
            db,
            payments,
            tax,
            filing,
            sync,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind listener");
            AppError::InternalError(anyhow::anyhow!("Failed to bind {}: {}", addr, e))
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?
            .port();

        tracing::info!(port, "Listener bound");

        Ok(Self {
            port,
            listener,
            state,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run until the given shutdown future resolves. Background verification
    /// tasks observe the same cancellation.
    pub async fn run_until_stopped(
        self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let router = build_router(self.state);
        let token = self.shutdown;

        tracing::info!(port = self.port, "Starting HTTP server");

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal.await;
                token.cancel();
            })
            .await
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/payments", get(handlers::list_payments))
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/sync", post(handlers::run_sync))
        .route("/api/receipts", post(handlers::file_receipt))
        .route("/api/receipts/cancel", post(handlers::cancel_receipt))
        .route("/api/receipts/check", post(handlers::check_receipt))
        .route(
            "/api/service-names",
            get(handlers::list_service_names)
                .post(handlers::add_service_name)
                .delete(handlers::clear_service_names),
        )
        .route(
            "/api/service-names/:name",
            delete(handlers::remove_service_name),
        )
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}
