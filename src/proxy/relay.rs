//! Forwarding of client requests to a slot backend.

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use relay_control_models::SlotId;
use relay_protocol::is_completion_endpoint;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use super::ProxyState;
use crate::error::ApiError;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to proxy request: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("Failed to proxy request: backend answered with invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("invalid JSON body: {0}")]
    InvalidBody(#[source] serde_json::Error),
    #[error("Method not allowed")]
    MethodNotAllowed,
}

/// Whether a POST to `endpoint` with `body` must be relayed as a live byte stream.
pub fn wants_stream(endpoint: &str, body: &Value) -> bool {
    let endpoint = endpoint.trim_matches('/');
    endpoint == "stream"
        || (is_completion_endpoint(endpoint) && body.get("stream").and_then(Value::as_bool) == Some(true))
}

/// Splits `/{slot}/{endpoint}` into an optional numeric slot and the endpoint path.
pub fn split_slot(path: &str) -> (Option<SlotId>, String) {
    let trimmed = path.trim_start_matches('/');
    let (first, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
    match first.parse::<u32>() {
        Ok(index) => (Some(SlotId::Device(index)), rest.to_string()),
        Err(_) => (None, trimmed.to_string()),
    }
}

pub async fn forward(
    state: &ProxyState,
    slot: SlotId,
    method: Method,
    endpoint: &str,
    query: Option<&str>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut url = format!("{}/{}", state.supervisor.backend_url(slot)?, endpoint.trim_start_matches('/'));
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    debug!(slot = %slot, %method, %url, "proxying request");

    let relayed = match method {
        Method::GET => forward_get(state, &url, endpoint).await,
        Method::POST => forward_post(state, &url, endpoint, &body).await,
        _ => Err(ProxyError::MethodNotAllowed),
    };
    relayed.map_err(|err| {
        if matches!(err, ProxyError::Upstream(_) | ProxyError::InvalidJson(_)) {
            error!(slot = %slot, %url, error = %err, "error proxying request to backend");
        }
        ApiError::from(err)
    })
}

async fn forward_get(state: &ProxyState, url: &str, endpoint: &str) -> Result<Response, ProxyError> {
    let upstream = state.client.get(url).timeout(state.control_timeout).send().await?;
    let status = upstream.status();
    let bytes = upstream.bytes().await?;

    if endpoint.trim_matches('/').is_empty() {
        return Ok((status, bytes).into_response());
    }
    let json: Value = serde_json::from_slice(&bytes).map_err(ProxyError::InvalidJson)?;
    Ok((status, Json(json)).into_response())
}

async fn forward_post(state: &ProxyState, url: &str, endpoint: &str, body: &Bytes) -> Result<Response, ProxyError> {
    let payload: Value = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(body).map_err(ProxyError::InvalidBody)?
    };

    if wants_stream(endpoint, &payload) {
        let upstream = state.client.post(url).json(&payload).send().await?;
        let status = upstream.status();
        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("text/event-stream"));
        let mut response = Body::from_stream(upstream.bytes_stream()).into_response();
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, content_type);
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        return Ok(response);
    }

    let mut request = state.client.post(url).json(&payload);
    if !is_completion_endpoint(endpoint) {
        request = request.timeout(state.control_timeout);
    }
    let upstream = request.send().await?;
    let status = upstream.status();
    let bytes = upstream.bytes().await?;
    let json: Value = serde_json::from_slice(&bytes).map_err(ProxyError::InvalidJson)?;
    Ok((status, Json(json)).into_response())
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        let status = match &err {
            ProxyError::Upstream(_) | ProxyError::InvalidJson(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn slot_prefix_is_split_off_numeric_segments_only() {
        assert_eq!(split_slot("/1/chat/completions"), (Some(SlotId::Device(1)), "chat/completions".to_string()));
        assert_eq!(split_slot("/v1/chat/completions"), (None, "v1/chat/completions".to_string()));
        assert_eq!(split_slot("/0"), (Some(SlotId::Device(0)), String::new()));
        assert_eq!(split_slot("/"), (None, String::new()));
    }

    #[test]
    fn stream_detection_follows_endpoint_and_flag() {
        assert!(wants_stream("stream", &json!({"text": "hi"})));
        assert!(wants_stream("chat/completions", &json!({"stream": true})));
        assert!(!wants_stream("chat/completions", &json!({"stream": false})));
        assert!(!wants_stream("completions", &json!({})));
        assert!(!wants_stream("tokenize", &json!({"stream": true})));
    }
}
