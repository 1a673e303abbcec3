//! Pulsewatch backend entrypoint.
//!
//! Wires the rate limiter, providers, stores, and background services
//! together and serves the control/read API. Exits non-zero when required
//! configuration is missing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::middleware as axum_mw;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulsewatch::aggregator::BarGenerator;
use pulsewatch::api::{self, AppState};
use pulsewatch::digest::DigestService;
use pulsewatch::middleware::request_logging;
use pulsewatch::models::Config;
use pulsewatch::poller::TickPoller;
use pulsewatch::providers::{
    GrokClient, MockSearchClient, MockSummaryClient, SearchProvider, SummaryProvider,
    XSearchClient,
};
use pulsewatch::ratelimit::RateLimiter;
use pulsewatch::registry::TopicRegistry;
use pulsewatch::scheduler::BarScheduler;
use pulsewatch::store::{BarStore, TickStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pulsewatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    info!(port = config.port, "starting pulsewatch backend");

    let limiter = Arc::new(RateLimiter::standard());

    let (search, summary, upstream_limit): (
        Arc<dyn SearchProvider>,
        Arc<dyn SummaryProvider>,
        _,
    ) = if config.mock_providers {
        warn!("MOCK_PROVIDERS=true, serving deterministic mock data");
        (
            Arc::new(MockSearchClient),
            Arc::new(MockSummaryClient),
            None,
        )
    } else {
        let bearer = config
            .search_bearer_token
            .clone()
            .context("SEARCH_BEARER_TOKEN missing")?;
        let api_key = config
            .model_api_key
            .clone()
            .context("MODEL_API_KEY missing")?;

        let x_client = XSearchClient::new(bearer, limiter.clone())?;
        let upstream_limit = x_client.rate_limit_status();
        let grok = GrokClient::new(
            api_key,
            config.model_fast.clone(),
            config.model_reasoning.clone(),
            limiter.clone(),
        )?;
        info!("live search and summary providers configured");
        (Arc::new(x_client), Arc::new(grok), Some(upstream_limit))
    };

    let registry = Arc::new(TopicRegistry::new());
    let tick_store = Arc::new(TickStore::new(config.max_ticks_per_topic));
    let bar_store = Arc::new(BarStore::new(config.max_bars_per_resolution));
    let generator = Arc::new(BarGenerator::new(tick_store.clone(), summary.clone()));
    let digest_service = Arc::new(DigestService::new(summary));

    let poller = Arc::new(TickPoller::new(
        registry.clone(),
        tick_store.clone(),
        search.clone(),
        Duration::from_secs(config.poll_interval_seconds),
    ));
    let scheduler = Arc::new(BarScheduler::new(
        registry.clone(),
        bar_store.clone(),
        generator.clone(),
    ));

    if config.auto_start {
        poller.start();
        scheduler.start();
    } else {
        info!("background services disabled (set AUTO_START=true to enable)");
    }

    let state = AppState {
        config: config.clone(),
        registry,
        tick_store,
        bar_store,
        generator,
        digest_service,
        search,
        upstream_limit,
    };

    let app = api::router(state)
        .layer(axum_mw::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!(port = config.port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down");
    scheduler.stop().await;
    poller.stop().await;
    info!("goodbye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
}
