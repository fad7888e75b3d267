//! Response envelopes: sync, async and error

use crate::common::Error;
use crate::operations::Operation;
use crate::orchestrator::Outcome;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

/// 200 with `metadata`
pub fn sync_response<T: Serialize>(metadata: T) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "type": "sync",
            "status": "Success",
            "status_code": 200,
            "metadata": metadata,
        })),
    )
        .into_response()
}

/// 200 with empty metadata, pointing `Location` at the affected resource
pub fn empty_sync_response(location: Option<&str>) -> Response {
    let mut resp = sync_response(json!({}));
    if let Some(value) = location.and_then(|l| HeaderValue::from_str(l).ok()) {
        resp.headers_mut().insert(header::LOCATION, value);
    }
    resp
}

/// 202 describing a running operation
pub fn async_response(op: &Operation) -> Response {
    let url = op.url();
    let mut resp = (
        StatusCode::ACCEPTED,
        Json(json!({
            "type": "async",
            "status": "Operation created",
            "status_code": 100,
            "operation": url,
            "metadata": op.view(),
        })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&url) {
        resp.headers_mut().insert(header::LOCATION, value);
    }
    resp
}

pub fn outcome_response(outcome: Outcome) -> Response {
    match outcome {
        Outcome::Done { location } => empty_sync_response(location.as_deref()),
        Outcome::Started(op) => async_response(&op),
    }
}

pub fn error_response(err: &Error) -> Response {
    let status = err.to_http_status();
    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
    }
    (
        status,
        Json(json!({
            "type": "error",
            "error": err.to_string(),
            "error_code": status.as_u16(),
        })),
    )
        .into_response()
}

/// Collapse a handler result into a response
pub fn respond(result: crate::common::Result<Response>) -> Response {
    result.unwrap_or_else(|e| error_response(&e))
}

pub fn with_etag(mut resp: Response, etag: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        resp.headers_mut().insert(header::ETAG, value);
    }
    resp
}
