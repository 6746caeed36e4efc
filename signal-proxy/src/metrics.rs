use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,
    forwarded_requests: IntCounterVec,
    validation_results: IntCounterVec,
    signal_alerts: IntCounterVec,
    analyzer_runs: IntCounterVec,
    upstream_latency: Histogram,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let forwarded_requests = IntCounterVec::new(
            Opts::new(
                "proxy_requests_total",
                "Intercepted agent requests grouped by outcome",
            ),
            &["outcome"],
        )?;
        let validation_results = IntCounterVec::new(
            Opts::new(
                "proxy_validation_results_total",
                "Client validation decisions grouped by reason",
            ),
            &["reason"],
        )?;
        let signal_alerts = IntCounterVec::new(
            Opts::new(
                "proxy_signal_alerts_total",
                "Alerts seen on the signals endpoint grouped by outcome",
            ),
            &["outcome"],
        )?;
        let analyzer_runs = IntCounterVec::new(
            Opts::new(
                "proxy_analyzer_runs_total",
                "Completed analyzer runs grouped by status",
            ),
            &["status"],
        )?;
        let upstream_latency = Histogram::with_opts(HistogramOpts::new(
            "proxy_upstream_latency_seconds",
            "Time spent forwarding to CAPI (seconds)",
        ))?;
        registry.register(Box::new(forwarded_requests.clone()))?;
        registry.register(Box::new(validation_results.clone()))?;
        registry.register(Box::new(signal_alerts.clone()))?;
        registry.register(Box::new(analyzer_runs.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        Ok(Self {
            registry,
            forwarded_requests,
            validation_results,
            signal_alerts,
            analyzer_runs,
            upstream_latency,
        })
    }

    pub fn record_request(&self, outcome: &str) {
        self.forwarded_requests.with_label_values(&[outcome]).inc();
    }

    pub fn record_validation(&self, reason: &str) {
        self.validation_results.with_label_values(&[reason]).inc();
    }

    pub fn record_alerts(&self, forwarded: u64, filtered: u64) {
        self.signal_alerts
            .with_label_values(&["forwarded"])
            .inc_by(forwarded);
        self.signal_alerts
            .with_label_values(&["filtered"])
            .inc_by(filtered);
    }

    pub fn record_analyzer_run(&self, status: &str) {
        self.analyzer_runs.with_label_values(&[status]).inc();
    }

    pub fn observe_upstream_latency(&self, secs: f64) {
        self.upstream_latency.observe(secs);
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
