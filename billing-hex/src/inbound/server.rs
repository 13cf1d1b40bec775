//! HTTP Server configuration and startup.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use billing_types::BillingRepository;

use super::auth::auth_middleware;
use super::handlers::{self, AppState};
use crate::BillingService;
use crate::security::hash_api_key;

/// HTTP Server for the Billing API.
pub struct HttpServer<R: BillingRepository> {
    state: Arc<AppState<R>>,
}

impl<R: BillingRepository> HttpServer<R> {
    /// Creates a new HTTP server accepting the given raw API keys.
    pub fn new(service: Arc<BillingService<R>>, api_keys: &[String]) -> Self {
        let api_key_hashes = api_keys.iter().map(|k| hash_api_key(k)).collect();
        Self {
            state: Arc::new(AppState {
                service,
                api_key_hashes,
            }),
        }
    }

    /// Builds the Axum router with all routes.
    pub fn router(&self) -> Router {
        // Build HTTP metrics layer (uses globally set MeterProvider)
        let metrics = axum_otel_metrics::HttpMetricsLayerBuilder::new().build();

        Router::new()
            .route("/health", get(handlers::health))
            .route("/api-docs/openapi.json", get(handlers::openapi_json))
            .route("/api/rates", get(handlers::get_rates::<R>))
            .route("/api/amount-limits", get(handlers::get_amount_limits::<R>))
            .route("/api/wallets/{owner_id}", get(handlers::get_wallet::<R>))
            .route(
                "/api/wallets/{owner_id}/transactions",
                get(handlers::list_transactions::<R>),
            )
            .route(
                "/api/wallets/{owner_id}/purchases",
                post(handlers::purchase::<R>),
            )
            .route(
                "/api/wallets/{owner_id}/freeze",
                post(handlers::freeze_wallet::<R>),
            )
            .route(
                "/api/wallets/{owner_id}/unfreeze",
                post(handlers::unfreeze_wallet::<R>),
            )
            .route(
                "/api/payments/links",
                post(handlers::create_payment_link::<R>),
            )
            .route(
                "/api/payments/{provider}/{payment_id}/status",
                get(handlers::payment_status::<R>),
            )
            .route(
                "/api/subscriptions/{id}",
                get(handlers::get_subscription::<R>),
            )
            .route(
                "/api/subscriptions/{id}/renew",
                post(handlers::renew_subscription::<R>),
            )
            .route(
                "/api/subscriptions/{id}/cancel",
                post(handlers::cancel_subscription::<R>),
            )
            .route(
                "/api/subscriptions/{id}/suspend",
                post(handlers::suspend_subscription::<R>),
            )
            .route(
                "/api/subscriptions/{id}/resume",
                post(handlers::resume_subscription::<R>),
            )
            .route(
                "/api/owners/{owner_ref}/subscriptions",
                get(handlers::list_owner_subscriptions::<R>),
            )
            .route(
                "/webhooks/{provider}",
                post(handlers::provider_webhook::<R>),
            )
            .layer(metrics)
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth_middleware::<R>,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Runs the server on the given address with graceful shutdown.
    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Server listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown...");
}
