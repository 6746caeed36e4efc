use axum::{
    body::Body,
    http::{HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::Lazy;
use prometheus::IntCounterVec;
use serde::Serialize;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")] pub message: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized { reason: &'static str },
    BadRequest { code: &'static str, message: Option<String> },
    NotFound { code: &'static str },
    Conflict { code: &'static str, message: Option<String> },
    BadGateway { message: Option<String> },
    Internal { message: Option<String> },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E) -> Self { Self::Internal { message: Some(e.to_string()) } }
    pub fn bad_gateway<E: std::fmt::Display>(e: E) -> Self { Self::BadGateway { message: Some(e.to_string()) } }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body, error_code) = match self {
            ApiError::Unauthorized { reason } => (
                StatusCode::UNAUTHORIZED,
                ErrorBody { error: reason.into(), message: None },
                reason,
            ),
            ApiError::BadRequest { code, message } => (
                StatusCode::BAD_REQUEST,
                ErrorBody { error: code.into(), message },
                code,
            ),
            ApiError::NotFound { code } => (
                StatusCode::NOT_FOUND,
                ErrorBody { error: code.into(), message: None },
                code,
            ),
            ApiError::Conflict { code, message } => (
                StatusCode::CONFLICT,
                ErrorBody { error: code.into(), message },
                code,
            ),
            ApiError::BadGateway { message } => (
                StatusCode::BAD_GATEWAY,
                ErrorBody { error: "upstream_unreachable".into(), message },
                "upstream_unreachable",
            ),
            ApiError::Internal { message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody { error: "internal_error".into(), message },
                "internal_error",
            ),
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

static HTTP_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        prometheus::Opts::new(
            "http_errors_total",
            "Count of HTTP error responses emitted (status >= 400)",
        ),
        &["service", "status"],
    )
    .expect("http_errors_total opts are valid");
    let _ = prometheus::default_registry().register(Box::new(counter.clone()));
    counter
});

/// Middleware counting error responses per service and status code.
pub async fn count_http_errors(service: &'static str, req: Request<Body>, next: Next) -> Response {
    let resp = next.run(req).await;
    if resp.status().as_u16() >= 400 {
        HTTP_ERRORS_TOTAL
            .with_label_values(&[service, resp.status().as_str()])
            .inc();
    }
    resp
}
