use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use common_http_errors::ApiError;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::app_state::AppState;
use crate::filters::FilterCtx;
use crate::models::Alert;
use crate::repository::AlertInsert;

/// Headers copied verbatim to CAPI. `accept-encoding` is intentionally not
/// forwarded so upstream responses come back uncompressed.
pub const FORWARD_HEADERS: [&str; 5] = [
    "authorization",
    "content-type",
    "content-encoding",
    "user-agent",
    "accept",
];

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const SIGNALS_PATH: &str = "/v2/signals";

/// Intercepting forwarder for every method under `/v2/*` and `/v3/*`.
/// Bodies are carried as opaque bytes; only the signals endpoint is parsed,
/// and a parse failure forwards the original bytes untouched.
pub async fn forward_capi(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let path_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return ApiError::BadRequest {
                code: "unreadable_body",
                message: Some(err.to_string()),
            }
            .into_response()
        }
    };

    let mut machine_id = None;
    if state.config.validation.enabled {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        let outcome = state.validator.validate(auth_header).await;
        if !outcome.valid {
            state.metrics.record_request("rejected");
            debug!(%method, path = %path_query, reason = outcome.reason.as_str(), "Rejected agent request");
            return ApiError::Unauthorized { reason: outcome.reason.as_str() }.into_response();
        }
        machine_id = outcome.machine_id;
    }

    let mut upstream_body = body_bytes.clone();
    if method == Method::POST && path == SIGNALS_PATH {
        upstream_body = filter_signals(&state, &body_bytes, machine_id.as_deref()).await;
    }

    let url = format!("{}{}", state.config.capi_url, path_query);
    let upstream_method =
        reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut builder = state
        .http_client
        .request(upstream_method, &url)
        .timeout(Duration::from_millis(state.config.proxy_timeout_ms));
    for name in FORWARD_HEADERS {
        if let Some(value) = parts.headers.get(name) {
            builder = builder.header(name, value.as_bytes());
        }
    }
    if !upstream_body.is_empty() {
        // The client computes Content-Length from the body it is given.
        builder = builder.body(upstream_body.to_vec());
    }

    let started = Instant::now();
    let upstream = match builder.send().await {
        Ok(resp) => resp,
        Err(err) => {
            state.metrics.record_request("upstream_error");
            warn!(%method, path = %path_query, error = %err, "Upstream forward failed");
            return ApiError::bad_gateway(err).into_response();
        }
    };
    state
        .metrics
        .observe_upstream_latency(started.elapsed().as_secs_f64());

    let status = upstream.status().as_u16();
    let content_type = upstream.headers().get(reqwest::header::CONTENT_TYPE).cloned();
    let response_bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            state.metrics.record_request("upstream_error");
            warn!(%method, path = %path_query, error = %err, "Failed to read upstream response");
            return ApiError::bad_gateway(err).into_response();
        }
    };

    if status >= 400 {
        warn!(
            %method,
            path = %path_query,
            status,
            body = %String::from_utf8_lossy(&response_bytes),
            "Upstream returned error status"
        );
    } else {
        debug!(%method, path = %path_query, status, "Forwarded request");
    }
    state.metrics.record_request("forwarded");

    let mut response = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(ct) = content_type {
        if let Ok(value) = HeaderValue::from_bytes(ct.as_bytes()) {
            response = response.header(header::CONTENT_TYPE, value);
        }
    }
    response
        .body(Body::from(response_bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Runs the signals body through the filter pipeline. Every alert is
/// persisted with its outcome; only survivors are re-serialized upstream.
/// Persistence is observability: failures are logged, never returned.
async fn filter_signals(state: &AppState, body: &Bytes, machine_id: Option<&str>) -> Bytes {
    let alerts = match serde_json::from_slice::<Vec<Alert>>(body) {
        Ok(alerts) => alerts,
        Err(err) => {
            warn!(error = %err, "Unparseable signals body; forwarding bytes unmodified");
            return body.clone();
        }
    };

    let ctx = FilterCtx { machine_id, now: Utc::now() };
    let outcome = state.filter_engine.evaluate(&alerts, &ctx);
    debug!(
        original = outcome.original_count,
        filtered = outcome.filtered_count,
        passed = outcome.passed_count,
        "Evaluated signals batch"
    );
    state
        .metrics
        .record_alerts(outcome.passed_count as u64, outcome.filtered_count as u64);

    let batch: Vec<AlertInsert> = alerts
        .iter()
        .zip(outcome.results.iter())
        .map(|(alert, result)| {
            let geo = state.geoip.as_ref().and_then(|resolver| {
                alert.source.address().and_then(|ip| resolver.lookup(ip))
            });
            let filter_reasons = result.suppressed.then(|| {
                result
                    .matched
                    .iter()
                    .map(|m| m.filter_name.clone())
                    .collect::<Vec<_>>()
            });
            AlertInsert {
                alert: alert.clone(),
                filtered: result.suppressed,
                filter_reasons,
                geo,
            }
        })
        .collect();
    if let Err(err) = state.repository.insert_batch(&batch).await {
        warn!(error = %err, "Failed to persist signals batch");
    }

    match serde_json::to_vec(&outcome.surviving) {
        Ok(serialized) => Bytes::from(serialized),
        Err(err) => {
            warn!(error = %err, "Failed to re-serialize surviving alerts; forwarding original body");
            body.clone()
        }
    }
}
