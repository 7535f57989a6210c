//! HTTP request handlers.

use axum::{
    body::{Body, Bytes},
    extract::{Extension, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::Serialize;

use super::server::{AppState, RequestId};
use super::types::{self, ChatCompletionRequest};
use crate::error::{Error, Result};

/// API key used when the caller sends no bearer token.
pub const DEFAULT_API_KEY: &str = "default";

const SERVICE_NAME: &str = "OpenAI Adapter for MiniCPM-o 4.5";

/// Handle GET /
pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "mode": state.config.server.mode.to_string(),
    }))
}

/// Handle GET /v1/models - the single public model
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let backend = &state.config.backend;
    Json(serde_json::json!({
        "object": "list",
        "data": [{
            "id": backend.public_model,
            "object": "model",
            "created": backend.created,
            "owned_by": backend.owned_by,
        }]
    }))
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    match &state.omni {
        Some(omni) => {
            let request: ChatCompletionRequest = serde_json::from_slice(&body)
                .map_err(|e| Error::BadRequest(format!("Invalid request body: {}", e)))?;
            let api_key = api_key_from_headers(&headers);

            tracing::info!(
                request_id = %request_id.0,
                messages = request.messages.len(),
                stream = request.is_streaming(),
                "Received omni chat completion request"
            );

            omni.chat_completion(api_key, &request).await
        }
        None => forward(&state, &request_id, &body).await,
    }
}

/// Forward a request to llama-server with only `model` rewritten.
async fn forward(state: &AppState, request_id: &RequestId, body: &[u8]) -> Result<Response> {
    let mut payload: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Error::BadRequest(format!("Invalid JSON body: {}", e)))?;
    let backend = &state.config.backend;
    types::rewrite_model(&mut payload, &backend.model)?;
    let is_streaming = types::wants_stream(&payload);

    tracing::info!(
        request_id = %request_id.0,
        messages = types::message_count(&payload),
        stream = is_streaming,
        "Forwarding chat completion request"
    );

    let mut upstream = state
        .http_client
        .post(backend.chat_completions_url())
        .header(header::CONTENT_TYPE, "application/json")
        .json(&payload);
    // Streams are bounded by the client's idle read timeout instead of a total deadline.
    if !is_streaming {
        upstream = upstream.timeout(backend.timeout());
    }

    let upstream = upstream
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to reach llama-server");
            Error::BackendUnavailable(e.to_string())
        })?;

    let status = upstream.status();
    if !status.is_success() {
        let error_body = upstream.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %error_body, "llama-server returned error");
        return Err(Error::BackendStatus {
            status: status.as_u16(),
            body: error_body,
        });
    }

    if is_streaming {
        stream_response(upstream)
    } else {
        buffered_response(upstream).await
    }
}

/// Return the backend's JSON body unchanged.
async fn buffered_response(upstream: reqwest::Response) -> Result<Response> {
    let bytes = upstream.bytes().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to read llama-server response");
        Error::BackendUnavailable(e.to_string())
    })?;

    serde_json::from_slice::<serde::de::IgnoredAny>(&bytes).map_err(|e| {
        tracing::error!(error = %e, "llama-server returned invalid JSON");
        Error::Internal(format!("Invalid JSON from llama-server: {}", e))
    })?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Pass SSE bytes through chunk by chunk, unmodified.
fn stream_response(upstream: reqwest::Response) -> Result<Response> {
    let stream = upstream.bytes_stream().map(|chunk| {
        if let Err(ref e) = chunk {
            tracing::error!(error = %e, "Error streaming from llama-server");
        }
        chunk.map_err(std::io::Error::other)
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Body of GET /health.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub llama_server: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handle GET /health - llama-server reachability
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let backend = &state.config.backend;
    let probe = state
        .http_client
        .get(backend.health_url())
        .timeout(backend.health_timeout())
        .send()
        .await;

    let report = match probe {
        Ok(resp) if resp.status().is_success() => HealthReport {
            status: "healthy",
            llama_server: "healthy",
            error: None,
        },
        Ok(resp) => HealthReport {
            status: "unhealthy",
            llama_server: "unhealthy",
            error: Some(format!("health check returned {}", resp.status())),
        },
        Err(e) => HealthReport {
            status: "unhealthy",
            llama_server: "unreachable",
            error: Some(e.to_string()),
        },
    };

    if report.error.is_some() {
        tracing::warn!(llama_server = report.llama_server, error = ?report.error, "Health check failed");
    }
    Json(report)
}

/// Handle DELETE /v1/session - release the caller's cached session
pub async fn release_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    let omni = state
        .omni
        .as_ref()
        .ok_or_else(|| Error::NotFound("sessions are only managed in omni mode".to_string()))?;

    let released = omni.sessions().cleanup(api_key_from_headers(&headers)).await;
    Ok(Json(serde_json::json!({ "released": released })))
}

/// Caller API key from `Authorization: Bearer <key>`.
pub fn api_key_from_headers(headers: &HeaderMap) -> &str {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .unwrap_or(DEFAULT_API_KEY)
}
