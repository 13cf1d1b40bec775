//! # Billing Application
//!
//! Binary that wires together all the components:
//! - Load configuration from environment
//! - Initialize the repository adapter
//! - Register payment providers and the currency converter
//! - Create the billing service and its background workers
//! - Start the HTTP server

mod config;

use std::sync::Arc;

use opentelemetry::global;
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace as sdktrace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use billing_hex::outbound::providers::{HostedCheckoutProvider, ProviderRegistry, SandboxProvider};
use billing_hex::workers::{ExpirySweeper, PendingReconciler};
use billing_hex::{BillingConfig, BillingService, GatewayConfig, inbound::HttpServer};
use billing_repo::build_repo;
use billing_types::AmountValidator;
use exchange_rates::{CurrencyConverter, HttpRateSource, RateRefresher, StaticRateSource};

/// Intents reconciled per pass of the pending reconciler.
const RECONCILE_BATCH: i64 = 50;

fn init_tracer() -> anyhow::Result<(sdktrace::Tracer, sdktrace::SdkTracerProvider)> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    // gRPC exporter with batch processing; endpoint comes from OTEL_EXPORTER_OTLP_ENDPOINT
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()?;

    let provider = sdktrace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .build();

    global::set_tracer_provider(provider.clone());

    use opentelemetry::trace::TracerProvider as _;
    Ok((provider.tracer("billing-service"), provider))
}

fn build_providers(config: &config::Config) -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    if let Some(secret) = &config.sandbox_secret {
        registry.register(Arc::new(SandboxProvider::new(secret.clone())));
        tracing::warn!("Sandbox payment provider enabled");
    }

    for hosted in &config.hosted_providers {
        tracing::info!(provider = %hosted.provider, currencies = ?hosted.currencies, "Registering payment provider");
        registry.register(Arc::new(HostedCheckoutProvider::new(hosted.clone())?));
    }

    if registry.is_empty() {
        tracing::warn!("No payment providers configured; payment links will be refused");
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Export traces only when a collector is configured
    let otel = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(_) => Some(init_tracer()?),
        Err(_) => None,
    };
    let telemetry = otel
        .as_ref()
        .map(|(tracer, _)| tracing_opentelemetry::layer().with_tracer(tracer.clone()));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,billing_app=debug,billing_hex=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry)
        .init();

    let config = config::Config::from_env()?;

    tracing::info!("Starting billing server on port {}", config.port);

    // Build repository (handles connection and migration)
    let repo = build_repo(&config.database_url).await?;

    let converter = Arc::new(CurrencyConverter::with_defaults());
    match &config.rates_url {
        Some(url) => {
            tracing::info!(url = %url, "Refreshing exchange rates from remote source");
            let source = HttpRateSource::new(url.clone(), config.provider_timeout)?;
            tokio::spawn(RateRefresher::new(converter.clone(), source, config.rates_refresh).run());
        }
        None => {
            tokio::spawn(
                RateRefresher::new(converter.clone(), StaticRateSource, config.rates_refresh).run(),
            );
        }
    }

    let validator = AmountValidator::with_overrides(config.amount_limits.clone())?;
    let providers = build_providers(&config)?;

    let service = Arc::new(BillingService::new(
        repo,
        providers,
        converter,
        validator,
        BillingConfig {
            default_currency: config.default_currency,
            gateway: GatewayConfig {
                provider_timeout: config.provider_timeout,
                intent_ttl: config.intent_ttl,
                poll_window: config.poll_window,
                ..GatewayConfig::default()
            },
        },
    ));

    tokio::spawn(ExpirySweeper::new(service.clone(), config.expiry_sweep).run());
    tokio::spawn(
        PendingReconciler::new(service.clone(), config.reconcile_interval, RECONCILE_BATCH).run(),
    );

    let server = HttpServer::new(service, &config.api_keys);
    let addr = format!("0.0.0.0:{}", config.port);

    server.run(&addr).await?;

    // Ensure traces are flushed before exit
    if let Some((_, provider)) = otel {
        let _ = provider.shutdown();
    }
    Ok(())
}
