use axum::body::Body;
use axum::extract::State;
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, HeaderValue, Method, StatusCode,
};
use axum::middleware;
use axum::response::Response;
use axum::routing::{any, delete, get, post};
use axum::Router;
use common_http_errors::count_http_errors;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use crate::admin_handlers::{
    analyzer_runs, create_decision, delete_decision, get_alert, get_distribution, get_stats,
    ip_info, list_alerts, list_analyzers, list_decisions, require_api_key, trigger_analyzer,
};
use crate::app_state::AppState;
use crate::proxy_handlers::forward_capi;

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "Failed to render metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("metrics unavailable"))
                .expect("failed to build metrics error response")
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    // Dashboard dev origins.
    let allowed_origins = [
        "http://localhost:3000",
        "http://localhost:5173",
    ];
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods(
            [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS]
                .into_iter()
                .collect::<Vec<_>>(),
        )
        .allow_headers(
            [ACCEPT, CONTENT_TYPE, HeaderName::from_static("x-api-key")]
                .into_iter()
                .collect::<Vec<_>>(),
        );

    let admin_state = state.clone();
    let admin_api = Router::new()
        .route("/alerts", get(list_alerts))
        .route("/alerts/:id", get(get_alert))
        .route("/stats", get(get_stats))
        .route("/stats/distribution", get(get_distribution))
        .route("/analyzers", get(list_analyzers))
        .route("/analyzers/:id/runs", get(analyzer_runs))
        .route("/analyzers/:id/trigger", post(trigger_analyzer))
        .route("/decisions", get(list_decisions).post(create_decision))
        .route("/decisions/:id", delete(delete_decision))
        .route("/ip/:ip", get(ip_info))
        .layer(middleware::from_fn(move |request, next| {
            let state = admin_state.clone();
            async move { require_api_key(state, request, next).await }
        }));

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .nest("/api", admin_api)
        // The intercepted CAPI surface: every method, raw bodies.
        .route("/v2/*path", any(forward_capi))
        .route("/v3/*path", any(forward_capi))
        .with_state(state)
        .layer(middleware::from_fn(|request, next| {
            count_http_errors("signal-proxy", request, next)
        }))
        .layer(cors)
}
