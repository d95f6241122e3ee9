//! 🌐 The Ingestion Endpoint: JSON-RPC `eth_sendBundle` over HTTP.
//!
//! # Routes
//!
//! - `POST /` - `eth_sendBundle`, answered before any decoding or uploading happens
//! - `GET /` - liveness, says hello
//! - `GET /health` - liveness plus the governor's in-flight count
//!
//! # Status codes
//!
//! | situation | HTTP | JSON-RPC code |
//! |---|---|---|
//! | body is not JSON | 400 | -32700 |
//! | JSON, but not a request object | 400 | -32600 |
//! | method is not `eth_sendBundle` | 405 | -32601 |
//! | not exactly one param, empty `txs`, bad `blockNumber` | 400 | -32602 |
//! | body over `max_body_bytes` | 413 | -32602 |
//! | too many txs, or too many estimated bytes | 413 | -32602 |
//! | governor says no | 503 + `Retry-After` | -32005 |
//! | accepted | 200, `result: null` | |
//!
//! A successful response echoes the request's `jsonrpc` exactly as sent, and leaves it out
//! if the request had none. Error responses always say `"2.0"`.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use crate::common::{RawBundle, parse_block_number};
use crate::governor::AdmissionRejected;
use crate::pipeline::{Pipeline, Submission};

const THE_ONLY_METHOD: &str = "eth_sendBundle";

/// 🔧 The `[server]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 📏 Hard cap on the request body, enforced before any parsing.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_max_txs_per_bundle")]
    pub max_txs_per_bundle: usize,
    /// 🧮 Rough decoded footprint of one transaction, used for the size estimate.
    #[serde(default = "default_estimated_bytes_per_tx")]
    pub estimated_bytes_per_tx: usize,
    #[serde(default = "default_max_estimated_bundle_bytes")]
    pub max_estimated_bundle_bytes: usize,
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    128 * 1024 * 1024
}

fn default_max_txs_per_bundle() -> usize {
    50_000
}

fn default_estimated_bytes_per_tx() -> usize {
    2_048
}

fn default_max_estimated_bundle_bytes() -> usize {
    500 * 1024 * 1024
}

fn default_retry_after_secs() -> u64 {
    1
}

fn default_shutdown_drain_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_body_bytes: default_max_body_bytes(),
            max_txs_per_bundle: default_max_txs_per_bundle(),
            estimated_bytes_per_tx: default_estimated_bytes_per_tx(),
            max_estimated_bundle_bytes: default_max_estimated_bundle_bytes(),
            retry_after_secs: default_retry_after_secs(),
            shutdown_drain_secs: default_shutdown_drain_secs(),
        }
    }
}

/// 💀 Everything the endpoint can say no with.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("bundle too large: {0}")]
    TooLarge(String),
    #[error("{0}")]
    Saturated(#[from] AdmissionRejected),
}

impl EndpointError {
    pub fn status(&self) -> StatusCode {
        match self {
            EndpointError::Parse(_)
            | EndpointError::InvalidRequest(_)
            | EndpointError::InvalidParams(_) => StatusCode::BAD_REQUEST,
            EndpointError::MethodNotFound(_) => StatusCode::METHOD_NOT_ALLOWED,
            EndpointError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            EndpointError::Saturated(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn rpc_code(&self) -> i64 {
        match self {
            EndpointError::Parse(_) => -32700,
            EndpointError::InvalidRequest(_) => -32600,
            EndpointError::MethodNotFound(_) => -32601,
            EndpointError::InvalidParams(_) | EndpointError::TooLarge(_) => -32602,
            EndpointError::Saturated(_) => -32005,
        }
    }
}

/// 📮 An [`EndpointError`] addressed back to the request that caused it.
struct RpcFailure {
    id: Value,
    error: EndpointError,
    retry_after_secs: u64,
}

impl IntoResponse for RpcFailure {
    fn into_response(self) -> Response {
        let the_body = json!({
            "jsonrpc": "2.0",
            "id": self.id,
            "error": {
                "code": self.error.rpc_code(),
                "message": self.error.to_string(),
            }
        });
        let mut the_response = (self.error.status(), Json(the_body)).into_response();
        if matches!(self.error, EndpointError::Saturated(_)) {
            the_response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(self.retry_after_secs),
            );
        }
        the_response
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    jsonrpc: Option<Value>,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Vec<Value>,
}

/// 🗄️ What the handlers share.
#[derive(Debug)]
pub struct EndpointState {
    pub pipeline: Pipeline,
    pub limits: ServerConfig,
}

pub fn router(state: Arc<EndpointState>) -> Router {
    let the_body_limit = state.limits.max_body_bytes;
    Router::new()
        .route("/", get(hello).post(send_bundle))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(the_body_limit))
        .with_state(state)
}

/// GET / - liveness
async fn hello() -> Json<Value> {
    Json(json!({ "message": "Hello MEV Blocker" }))
}

/// GET /health - liveness plus load
async fn health(State(state): State<Arc<EndpointState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "inFlight": state.pipeline.governor().in_flight(),
    }))
}

/// POST / - eth_sendBundle
async fn send_bundle(
    State(state): State<Arc<EndpointState>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            let the_error = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                EndpointError::TooLarge(format!(
                    "request body is over {} bytes",
                    state.limits.max_body_bytes
                ))
            } else {
                EndpointError::Parse(rejection.body_text())
            };
            debug!(error = %the_error, "🚪 body rejected before parsing");
            return failure(&state, Value::Null, the_error);
        }
    };
    let the_request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            let the_error = if err.is_data() {
                EndpointError::InvalidRequest(err.to_string())
            } else {
                EndpointError::Parse(err.to_string())
            };
            debug!(error = %the_error, "🚪 unparseable request");
            return failure(&state, Value::Null, the_error);
        }
    };
    drop(body);
    trace!(method = %the_request.method, id = %the_request.id, "📨 request received");

    let the_id = the_request.id.clone();
    let the_jsonrpc = the_request.jsonrpc.clone();
    let the_referrer = referrer_from(&headers);

    let the_submission = match validate(the_request, &state.limits, the_referrer) {
        Ok(submission) => submission,
        Err(the_error) => {
            debug!(id = %the_id, error = %the_error, "🚪 request rejected at the door");
            return failure(&state, the_id, the_error);
        }
    };

    match state.pipeline.submit(the_submission) {
        Ok((the_accepted, _detached)) => {
            debug!(
                bundle_id = %the_accepted.bundle_id,
                timestamp = the_accepted.timestamp,
                "✅ bundle accepted"
            );
            let mut the_body = json!({ "id": the_id, "result": null });
            if let Some(jsonrpc) = the_jsonrpc {
                the_body["jsonrpc"] = jsonrpc;
            }
            Json(the_body).into_response()
        }
        Err(the_rejection) => {
            warn!(
                id = %the_id,
                in_flight = the_rejection.in_flight,
                limit = the_rejection.limit,
                "🛑 pipeline saturated, turning bundle away"
            );
            failure(&state, the_id, EndpointError::Saturated(the_rejection))
        }
    }
}

fn failure(state: &EndpointState, id: Value, error: EndpointError) -> Response {
    RpcFailure {
        id,
        error,
        retry_after_secs: state.limits.retry_after_secs,
    }
    .into_response()
}

/// 🔗 `Referer` wins, `Referrer` is the fallback. Both spellings exist in the wild.
fn referrer_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::REFERER)
        .or_else(|| headers.get("referrer"))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// 🪪 String ids stay as they are; numbers (and anything else) render as JSON text.
fn render_id(id: &Value) -> String {
    match id {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn validate(
    request: JsonRpcRequest,
    limits: &ServerConfig,
    referrer: Option<String>,
) -> Result<Submission, EndpointError> {
    if request.method != THE_ONLY_METHOD {
        return Err(EndpointError::MethodNotFound(request.method));
    }
    let the_request_id = render_id(&request.id);

    let mut the_params = request.params;
    if the_params.len() != 1 {
        return Err(EndpointError::InvalidParams(format!(
            "expected exactly one bundle, got {}",
            the_params.len()
        )));
    }
    let the_param = the_params.pop().unwrap_or_default();
    let the_raw: RawBundle = serde_json::from_value(the_param)
        .map_err(|err| EndpointError::InvalidParams(err.to_string()))?;

    if the_raw.transactions.is_empty() {
        return Err(EndpointError::InvalidParams("txs is empty".into()));
    }
    let the_block_number = parse_block_number(&the_raw.block_number).ok_or_else(|| {
        EndpointError::InvalidParams(format!(
            "blockNumber '{}' is not a decimal or 0x-hex number",
            the_raw.block_number
        ))
    })?;

    let the_count = the_raw.transactions.len();
    if the_count > limits.max_txs_per_bundle {
        return Err(EndpointError::TooLarge(format!(
            "{the_count} txs, limit is {}",
            limits.max_txs_per_bundle
        )));
    }
    let the_estimate = the_count.saturating_mul(limits.estimated_bytes_per_tx);
    if the_estimate > limits.max_estimated_bundle_bytes {
        return Err(EndpointError::TooLarge(format!(
            "estimated {the_estimate} bytes, limit is {}",
            limits.max_estimated_bundle_bytes
        )));
    }

    Ok(Submission {
        raw: the_raw,
        block_number: the_block_number,
        request_id: the_request_id,
        referrer,
    })
}
