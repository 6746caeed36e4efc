use std::sync::Arc;

use reqwest::Client;

use crate::config::ProxyConfig;
use crate::filters::FilterEngine;
use crate::geoip::GeoIpResolver;
use crate::metrics::ProxyMetrics;
use crate::repository::AlertRepository;
use crate::scheduler::AnalyzerScheduler;
use crate::validator::ClientValidator;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub validator: ClientValidator,
    pub filter_engine: Arc<FilterEngine>,
    pub geoip: Option<Arc<GeoIpResolver>>,
    pub repository: AlertRepository,
    pub scheduler: AnalyzerScheduler,
    pub http_client: Client,
    pub metrics: Arc<ProxyMetrics>,
}
