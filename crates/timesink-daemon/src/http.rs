// Copyright (c) 2026 Joseph Verdicchio and Timesink Contributors
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, USER_AGENT};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::public_error::PublicErrorCode;
use crate::runtime::{
    HeartbeatRequest, MazeRuntime, RecordingRequest, RuntimeError, SessionRequest,
    StartSessionRequest, VerifyRequest,
};
use crate::telemetry::Telemetry;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<MazeRuntime>,
    pub telemetry: Arc<Telemetry>,
    pub max_body_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions", post(start_session))
        .route("/v1/maze-runtime/next", post(next_trial))
        .route("/v1/maze-runtime/verify", post(verify_answer))
        .route("/v1/telemetry/heartbeat", post(heartbeat))
        .route(
            "/v1/telemetry/recording",
            post(record_events).put(flush_recording),
        )
        .route("/metrics", get(metrics))
        .layer(RequestBodyLimitLayer::new(state.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /metrics` alone, for deployments that keep metrics off the public
/// port.
pub fn metrics_router(telemetry: Arc<Telemetry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_only))
        .layer(TraceLayer::new_for_http())
        .with_state(telemetry)
}

pub fn spawn_metrics_server(
    listener: tokio::net::TcpListener,
    telemetry: Arc<Telemetry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, metrics_router(telemetry)).await {
            tracing::error!(error = %err, "metrics listener failed");
        }
    })
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

pub async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener, std::io::Error> {
    let socket: SocketAddr = match addr.parse() {
        Ok(v) => v,
        Err(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid listen address",
            ))
        }
    };
    tokio::net::TcpListener::bind(socket).await
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

#[derive(Debug)]
pub struct HttpErr {
    pub(crate) code: PublicErrorCode,
    pub(crate) reason: Option<&'static str>,
}

impl HttpErr {
    fn invalid_input() -> Self {
        Self {
            code: PublicErrorCode::InvalidInput,
            reason: None,
        }
    }

    fn internal() -> Self {
        Self {
            code: PublicErrorCode::Internal,
            reason: None,
        }
    }
}

impl From<RuntimeError> for HttpErr {
    fn from(err: RuntimeError) -> Self {
        let code = err.public_code();
        if code == PublicErrorCode::Internal {
            tracing::error!(error = %err, "request failed");
        } else {
            tracing::debug!(error = %err, code = code.as_str(), "request refused");
        }
        let reason = match &err {
            RuntimeError::InvalidToken(token) => Some(token.as_str()),
            _ => None,
        };
        Self { code, reason }
    }
}

impl IntoResponse for HttpErr {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code.message(),
            code: self.code.as_str(),
            reason: self.reason,
        };
        (self.code.status(), Json(body)).into_response()
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, HttpErr> {
    serde_json::from_slice(body).map_err(|err| {
        tracing::debug!(error = %err, "rejecting malformed body");
        HttpErr::invalid_input()
    })
}

fn reply<T: Serialize>(result: Result<T, RuntimeError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => HttpErr::from(err).into_response(),
    }
}

/// First hop of `x-forwarded-for`, else `x-real-ip`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        })
        .map(str::to_string)
}

async fn start_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpErr> {
    let req: StartSessionRequest = parse_body(&body)?;
    let ip = client_ip(&headers);
    let user_agent = headers.get(USER_AGENT).and_then(|v| v.to_str().ok());
    Ok(reply(state.runtime.start_session(
        req,
        ip.as_deref(),
        user_agent,
    )))
}

async fn next_trial(State(state): State<AppState>, body: Bytes) -> Result<Response, HttpErr> {
    let req: SessionRequest = parse_body(&body)?;
    Ok(reply(state.runtime.next(req)))
}

async fn verify_answer(State(state): State<AppState>, body: Bytes) -> Result<Response, HttpErr> {
    let req: VerifyRequest = parse_body(&body)?;
    let started = Instant::now();
    let result = state.runtime.verify(req);
    state
        .telemetry
        .record_verify_latency_ms(started.elapsed().as_millis() as u64);
    Ok(reply(result))
}

async fn heartbeat(State(state): State<AppState>, body: Bytes) -> Result<Response, HttpErr> {
    let req: HeartbeatRequest = parse_body(&body)?;
    Ok(reply(state.runtime.heartbeat(req)))
}

// Recording calls may upload a chunk, so they run off the async workers.
async fn record_events(State(state): State<AppState>, body: Bytes) -> Result<Response, HttpErr> {
    let req: RecordingRequest = parse_body(&body)?;
    let runtime = state.runtime.clone();
    let result = tokio::task::spawn_blocking(move || runtime.record_events(req))
        .await
        .map_err(|_| HttpErr::internal())?;
    Ok(reply(result))
}

async fn flush_recording(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, HttpErr> {
    let req: SessionRequest = parse_body(&body)?;
    let runtime = state.runtime.clone();
    let result = tokio::task::spawn_blocking(move || runtime.flush_recording(req))
        .await
        .map_err(|_| HttpErr::internal())?;
    Ok(reply(result))
}

async fn metrics(State(state): State<AppState>) -> Response {
    metrics_text(&state.telemetry)
}

async fn metrics_only(State(telemetry): State<Arc<Telemetry>>) -> Response {
    metrics_text(&telemetry)
}

fn metrics_text(telemetry: &Telemetry) -> Response {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        telemetry.render(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), None);
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.9"));
        assert_eq!(client_ip(&headers).as_deref(), Some("192.0.2.9"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.5, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.5"));
    }

    #[test]
    fn runtime_errors_keep_token_reason() {
        let err = HttpErr::from(RuntimeError::InvalidToken(
            timesink_core::TokenError::Expired,
        ));
        assert_eq!(err.code, PublicErrorCode::Unauthorized);
        assert_eq!(err.reason, Some("expired"));
        assert_eq!(
            HttpErr::from(RuntimeError::SessionExpired).code.status(),
            StatusCode::GONE
        );
    }

    #[tokio::test]
    async fn metrics_listener_serves_only_metrics() {
        let telemetry = Arc::new(Telemetry::new());
        telemetry.record_automation_flag();
        let listener = bind_listener("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = spawn_metrics_server(listener, telemetry);

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("metrics");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body = resp.text().await.expect("text");
        assert!(body.contains("timesink_automation_flags_total 1"));

        let resp = client
            .post(format!("http://{addr}/v1/sessions"))
            .body("{}")
            .send()
            .await
            .expect("sessions");
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        handle.abort();
    }

    #[tokio::test]
    async fn bind_listener_rejects_bad_address() {
        let err = bind_listener("not-an-address").await.expect_err("bad addr");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
