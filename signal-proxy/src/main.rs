use anyhow::Context;
use reqwest::Client;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use signal_proxy::app::build_router;
use signal_proxy::app_state::AppState;
use signal_proxy::config::{ProxyConfig, RulesFile};
use signal_proxy::filters::FilterEngine;
use signal_proxy::geoip::GeoIpResolver;
use signal_proxy::loki::LokiClient;
use signal_proxy::memory_cache::MemoryCache;
use signal_proxy::metrics::ProxyMetrics;
use signal_proxy::repository::AlertRepository;
use signal_proxy::scheduler::AnalyzerScheduler;
use signal_proxy::validation_store::ValidationStore;
use signal_proxy::validator::ClientValidator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = Arc::new(ProxyConfig::from_env()?);
    let rules = RulesFile::load(config.rules_path.as_deref())?;

    let repository = AlertRepository::connect(&config.database_url).await?;
    let validation_store_url = config
        .validation_database_url
        .clone()
        .unwrap_or_else(|| config.database_url.clone());
    let validation_store = ValidationStore::connect(&validation_store_url).await?;

    let http_client = Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let metrics = Arc::new(ProxyMetrics::new()?);
    let geoip = GeoIpResolver::open(config.geoip_path.as_deref()).map(Arc::new);

    let validator = ClientValidator::new(
        config.validation.clone(),
        config.capi_url.clone(),
        MemoryCache::new(config.validation.max_memory_entries),
        validation_store,
        http_client.clone(),
        metrics.clone(),
    );
    validator.spawn_cleanup_task();

    let filter_engine = Arc::new(FilterEngine::new(rules.filters));
    info!(
        capi_url = %config.capi_url,
        filters = filter_engine.filter_count(),
        analyzers = rules.analyzers.len(),
        lapi_servers = rules.lapi_servers.len(),
        validation_enabled = config.validation.enabled,
        "Loaded proxy configuration"
    );

    let scheduler = AnalyzerScheduler::new(
        rules.analyzers,
        repository.clone(),
        geoip.clone(),
        LokiClient::new(http_client.clone()),
        http_client.clone(),
        rules.lapi_servers,
        metrics.clone(),
    );
    scheduler.spawn_driver();

    let state = AppState {
        config: config.clone(),
        validator,
        filter_engine,
        geoip,
        repository,
        scheduler,
        http_client,
        metrics,
    };
    let app = build_router(state);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    println!("starting signal-proxy on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
