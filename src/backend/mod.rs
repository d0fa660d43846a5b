//! Per-slot HTTP service hosting one [`GenerationHandle`].
//!
//! The supervisor launches one of these per slot and the routing proxy forwards to it.

mod chat;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use relay_protocol::StatusMessage;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::engine::{load_engine, EngineOptions};
use crate::handle::{GenerationError, GenerationHandle, HandleOptions};

#[derive(Clone)]
pub struct BackendState {
    pub handle: GenerationHandle,
}

pub fn router(state: BackendState) -> Router {
    Router::new()
        .route("/stream", post(chat::stream_raw))
        .route("/completions", post(chat::chat))
        .route("/chat/completions", post(chat::chat))
        .route("/v1/chat/completions", post(chat::chat))
        .route("/reset_context", get(reset_context))
        .route("/interrupt", get(interrupt).post(interrupt))
        .route("/is_generating", get(is_generating))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn reset_context(State(state): State<BackendState>) -> impl IntoResponse {
    match state.handle.reset() {
        Ok(()) => (StatusCode::OK, Json(StatusMessage::new("Successfully reset"))),
        Err(GenerationError::Busy) => (
            StatusCode::CONFLICT,
            Json(StatusMessage::new("Could not reset: generation in progress")),
        ),
        Err(err) => {
            warn!(error = %err, "context reset failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(StatusMessage::new("Could not reset")),
            )
        }
    }
}

async fn interrupt(State(state): State<BackendState>) -> Json<StatusMessage<&'static str>> {
    state.handle.interrupt();
    Json(StatusMessage::new("Interrupted"))
}

async fn is_generating(State(state): State<BackendState>) -> Json<StatusMessage<bool>> {
    Json(StatusMessage::new(state.handle.is_generating()))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Everything the backend needs to load its model and listen.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub host: String,
    pub port: u16,
    pub model_root: PathBuf,
    pub model_path: String,
    pub mmproj_path: Option<String>,
    pub n_predict: usize,
    pub overrides: BTreeMap<String, Value>,
}

impl BackendOptions {
    fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            model_file: self.model_root.join(&self.model_path),
            projector_file: self
                .mmproj_path
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(|p| self.model_root.join(p)),
            overrides: self.overrides.clone(),
        }
    }
}

pub async fn serve(options: BackendOptions) -> anyhow::Result<()> {
    let engine_options = options.engine_options();
    info!(model = %engine_options.model_file.display(), "loading engine");
    let engine = tokio::task::spawn_blocking(move || load_engine(&engine_options)).await??;

    let handle = GenerationHandle::new(
        engine,
        HandleOptions {
            n_predict: options.n_predict,
            ..HandleOptions::default()
        },
    );
    let app = router(BackendState { handle });

    let addr: SocketAddr = format!("{}:{}", options.host, options.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(crate::shutdown_signal())
        .await?;
    info!("backend stopped");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::scripted::ScriptedEngine;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    pub(crate) fn scripted_router(engine: ScriptedEngine) -> (Router, GenerationHandle) {
        let handle = GenerationHandle::new(Box::new(engine), HandleOptions::default());
        (router(BackendState { handle: handle.clone() }), handle)
    }

    pub(crate) async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body bytes");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn control_endpoints_answer_with_message_bodies() {
        let (app, _) = scripted_router(ScriptedEngine::new(&["x"]));

        let res = app.clone().oneshot(get_request("/is_generating")).await.expect("response");
        assert_eq!(body_json(res).await, json!({"message": false}));

        let res = app.clone().oneshot(get_request("/interrupt")).await.expect("response");
        assert_eq!(body_json(res).await, json!({"message": "Interrupted"}));

        let post_interrupt = Request::builder()
            .method("POST")
            .uri("/interrupt")
            .body(Body::empty())
            .expect("request");
        let res = app.clone().oneshot(post_interrupt).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);

        let res = app.clone().oneshot(get_request("/reset_context")).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await, json!({"message": "Successfully reset"}));

        let res = app.oneshot(get_request("/health")).await.expect("response");
        assert_eq!(body_json(res).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn reset_failure_is_a_server_error() {
        let (app, _) = scripted_router(ScriptedEngine::new(&["x"]).failing_reset());
        let res = app.oneshot(get_request("/reset_context")).await.expect("response");
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(res).await, json!({"message": "Could not reset"}));
    }
}
