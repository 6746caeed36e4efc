use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use signal_proxy::analyzers::AnalyzerDef;
use signal_proxy::app::build_router;
use signal_proxy::app_state::AppState;
use signal_proxy::config::{LapiServer, ProxyConfig, ValidationConfig};
use signal_proxy::filters::{FilterDef, FilterEngine};
use signal_proxy::loki::LokiClient;
use signal_proxy::memory_cache::MemoryCache;
use signal_proxy::metrics::ProxyMetrics;
use signal_proxy::repository::AlertRepository;
use signal_proxy::scheduler::AnalyzerScheduler;
use signal_proxy::validation_store::ValidationStore;
use signal_proxy::validator::ClientValidator;

pub struct ProxyOptions {
    pub validation_enabled: bool,
    pub fail_closed: bool,
    pub cache_ttl_error_seconds: u64,
    pub filters: Vec<FilterDef>,
    pub analyzers: Vec<AnalyzerDef>,
    pub lapi_servers: Vec<LapiServer>,
    pub admin_api_key: Option<String>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            validation_enabled: true,
            fail_closed: false,
            cache_ttl_error_seconds: 30,
            filters: Vec::new(),
            analyzers: Vec::new(),
            lapi_servers: Vec::new(),
            admin_api_key: Some("test-admin-key".to_string()),
        }
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Boots a full proxy (in-memory stores, real listener on 127.0.0.1:0)
/// against the given CAPI base URL.
pub async fn spawn_proxy(capi_url: &str, options: ProxyOptions) -> TestProxy {
    let config = Arc::new(ProxyConfig {
        capi_url: capi_url.trim_end_matches('/').to_string(),
        proxy_timeout_ms: 2_000,
        validation: ValidationConfig {
            enabled: options.validation_enabled,
            cache_ttl_seconds: 3600,
            cache_ttl_error_seconds: options.cache_ttl_error_seconds,
            validation_timeout_ms: 1_000,
            max_memory_entries: 64,
            fail_closed: options.fail_closed,
            cleanup_seconds: 300,
        },
        database_url: "sqlite::memory:".to_string(),
        validation_database_url: None,
        geoip_path: None,
        admin_api_key: options.admin_api_key,
        rules_path: None,
    });

    let repo_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("repository pool");
    let repository = AlertRepository::with_pool(repo_pool);
    repository.ensure_schema().await.expect("repository schema");

    let store_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("validation store pool");
    let validation_store = ValidationStore::Sqlite(store_pool);
    validation_store.ensure_schema().await.expect("validation schema");

    let http_client = reqwest::Client::new();
    let metrics = Arc::new(ProxyMetrics::new().expect("metrics"));

    let validator = ClientValidator::new(
        config.validation.clone(),
        config.capi_url.clone(),
        MemoryCache::new(config.validation.max_memory_entries),
        validation_store,
        http_client.clone(),
        metrics.clone(),
    );

    let scheduler = AnalyzerScheduler::new(
        options.analyzers,
        repository.clone(),
        None,
        LokiClient::new(http_client.clone()),
        http_client.clone(),
        options.lapi_servers,
        metrics.clone(),
    );

    let state = AppState {
        config,
        validator,
        filter_engine: Arc::new(FilterEngine::new(options.filters)),
        geoip: None,
        repository,
        scheduler,
        http_client,
        metrics,
    };

    let app = build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            eprintln!("test proxy server error: {err}");
        }
    });

    TestProxy { addr, state }
}
