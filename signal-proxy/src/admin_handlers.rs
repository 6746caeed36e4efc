use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::warn;

use crate::analyzers::DecisionPush;
use crate::app_state::AppState;
use crate::models::{DecisionRecord, GeoInfo, StoredAlert};
use crate::repository::{AlertDistribution, AlertQuery, AlertStats};
use crate::scheduler::{AnalyzerRun, AnalyzerSnapshot, TriggerError};

/// Shared-secret gate for the dashboard surface.
pub async fn require_api_key(
    state: AppState,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.admin_api_key.as_deref() else {
        warn!("Admin API request rejected: ADMIN_API_KEY is not configured");
        return Err(ApiError::Unauthorized { reason: "admin_api_disabled" });
    };
    let presented = request
        .headers()
        .get("X-API-Key")
        .and_then(|value| value.to_str().ok());
    if presented != Some(expected) {
        return Err(ApiError::Unauthorized { reason: "invalid_api_key" });
    }
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
pub struct AlertListParams {
    pub since: Option<String>,
    pub until: Option<String>,
    pub scenario: Option<String>,
    pub machine_id: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertListParams>,
) -> ApiResult<Json<Vec<StoredAlert>>> {
    let query = AlertQuery {
        since: params.since,
        until: params.until,
        scenario: params.scenario,
        machine_id: params.machine_id,
        limit: params.limit,
    };
    let alerts = state.repository.list(&query).await.map_err(ApiError::internal)?;
    Ok(Json(alerts))
}

pub async fn get_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StoredAlert>> {
    state
        .repository
        .get_by_id(&id)
        .await
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or(ApiError::NotFound { code: "alert_not_found" })
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub top: Option<i64>,
}

pub async fn get_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> ApiResult<Json<AlertStats>> {
    let stats = state
        .repository
        .stats(params.top.unwrap_or(10).clamp(1, 50))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
pub struct DistributionParams {
    pub days: Option<i64>,
}

pub async fn get_distribution(
    State(state): State<AppState>,
    Query(params): Query<DistributionParams>,
) -> ApiResult<Json<AlertDistribution>> {
    let distribution = state
        .repository
        .distribution(params.days.unwrap_or(30).clamp(1, 365))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(distribution))
}

pub async fn list_analyzers(State(state): State<AppState>) -> Json<Vec<AnalyzerSnapshot>> {
    Json(state.scheduler.snapshots())
}

pub async fn analyzer_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<AnalyzerRun>>> {
    state
        .scheduler
        .runs(&id)
        .map(Json)
        .ok_or(ApiError::NotFound { code: "analyzer_not_found" })
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub status: &'static str,
}

pub async fn trigger_analyzer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    match state.scheduler.try_trigger(&id) {
        Ok(()) => Ok((StatusCode::ACCEPTED, Json(TriggerResponse { status: "started" }))),
        Err(TriggerError::NotFound) => Err(ApiError::NotFound { code: "analyzer_not_found" }),
        Err(TriggerError::AlreadyRunning) => Err(ApiError::Conflict {
            code: "analyzer_running",
            message: Some("a run is already in progress".into()),
        }),
    }
}

#[derive(Debug, Deserialize)]
pub struct NewDecisionRequest {
    pub value: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(rename = "type", default = "default_decision_type")]
    pub decision_type: String,
    #[serde(default = "default_duration")]
    pub duration: String,
    #[serde(default = "default_scenario")]
    pub scenario: String,
}

fn default_scope() -> String {
    "ip".to_string()
}

fn default_decision_type() -> String {
    "ban".to_string()
}

fn default_duration() -> String {
    "4h".to_string()
}

fn default_scenario() -> String {
    "manual".to_string()
}

#[derive(Debug, Serialize)]
pub struct DecisionPushResponse {
    pub pushed: usize,
}

/// Manual remediation push (dashboard "ban this IP" button).
pub async fn create_decision(
    State(state): State<AppState>,
    Json(req): Json<NewDecisionRequest>,
) -> ApiResult<Json<DecisionPushResponse>> {
    if req.value.trim().is_empty() {
        return Err(ApiError::BadRequest { code: "missing_value", message: None });
    }
    let decision = DecisionPush {
        scope: req.scope,
        value: req.value,
        decision_type: req.decision_type,
        duration: req.duration,
        scenario: req.scenario,
    };
    let pushed = state.scheduler.push_to_all(&decision).await;
    Ok(Json(DecisionPushResponse { pushed }))
}

pub async fn list_decisions(State(state): State<AppState>) -> ApiResult<Json<Vec<DecisionRecord>>> {
    let decisions = state
        .repository
        .list_decisions()
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(decisions))
}

pub async fn delete_decision(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let deleted = state
        .repository
        .delete_decision(id)
        .await
        .map_err(ApiError::internal)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound { code: "decision_not_found" })
    }
}

#[derive(Debug, Serialize)]
pub struct IpInfoResponse {
    pub ip: String,
    pub geo: Option<GeoInfo>,
}

pub async fn ip_info(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<Json<IpInfoResponse>> {
    if ip.parse::<IpAddr>().is_err() {
        return Err(ApiError::BadRequest { code: "invalid_ip", message: None });
    }
    let geo = state.geoip.as_ref().and_then(|resolver| resolver.lookup(&ip));
    Ok(Json(IpInfoResponse { ip, geo }))
}
