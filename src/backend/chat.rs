//! Chat completion and raw token streaming endpoints.

use std::convert::Infallible;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{sse::Event, IntoResponse, Response, Sse},
    Json,
};
use base64::Engine as _;
use futures::{Stream, StreamExt};
use relay_protocol::{
    ChatRequest, ChunkFrame, CompletionResponse, ErrorFrame, PromptPayload, Timings, Usage, DONE_MARKER,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::BackendState;
use crate::bridge::TokenStream;
use crate::error::ApiError;
use crate::handle::{SubmitOutcome, Submission};

#[derive(Debug, Deserialize)]
pub(super) struct RawStreamRequest {
    #[serde(flatten)]
    prompt: PromptPayload,
    #[serde(default)]
    reset: bool,
    #[serde(default)]
    stop: Vec<String>,
}

fn decode_images(images: &[String]) -> Result<Vec<Vec<u8>>, ApiError> {
    images
        .iter()
        .enumerate()
        .map(|(index, encoded)| {
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| ApiError::bad_request(format!("image {} is not valid base64: {}", index, e)))
        })
        .collect()
}

fn frame_event<T: Serialize>(frame: &T) -> Event {
    match serde_json::to_string(frame) {
        Ok(payload) => Event::default().data(payload),
        Err(e) => Event::default().data(format!("{{\"error\":\"{}\"}}", e)),
    }
}

/// Body-parse failures are answered in-band, as an error frame followed by `[DONE]`.
fn error_stream(message: String) -> Response {
    let events = futures::stream::iter([
        Ok::<_, Infallible>(frame_event(&ErrorFrame::new(message))),
        Ok(Event::default().data(DONE_MARKER)),
    ]);
    Sse::new(events).into_response()
}

fn chat_events(mut tokens: TokenStream) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let request_id = tokens.request_id();
        let mut failed = false;
        while let Some(item) = tokens.next().await {
            match item {
                Ok(token) => yield Ok(frame_event(&ChunkFrame::token(token))),
                Err(failure) => {
                    warn!(request_id, error = %failure, "stream ended with an engine error");
                    yield Ok(frame_event(&ErrorFrame::new(failure)));
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            yield Ok(frame_event(&ChunkFrame::stop()));
        }
        yield Ok(Event::default().data(DONE_MARKER));
        debug!(request_id, "event stream closed");
    }
}

pub(super) async fn chat(State(state): State<BackendState>, body: Bytes) -> Result<Response, ApiError> {
    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return Ok(error_stream(format!("invalid chat body: {}", e))),
    };
    let (prompt, restart) = request.prompt()?;
    let images = decode_images(&prompt.images)?;

    let submission = Submission {
        text: prompt.text,
        images,
        reset_conversation: restart,
        add_bos: restart,
        stop: request.stop.clone(),
        sampler_overrides: request.sampler_overrides(),
        streaming: request.stream,
    };

    if request.stream {
        return match state.handle.submit(submission)? {
            SubmitOutcome::Streaming(tokens) => Ok(Sse::new(chat_events(tokens)).into_response()),
            SubmitOutcome::Completed(_) => Err(ApiError::internal("expected a token stream")),
        };
    }

    let handle = state.handle.clone();
    let outcome = tokio::task::spawn_blocking(move || handle.submit(submission))
        .await
        .map_err(|e| ApiError::internal(format!("generation task failed: {}", e)))??;
    let SubmitOutcome::Completed(done) = outcome else {
        return Err(ApiError::internal("expected a completed generation"));
    };

    let stats = done.stats;
    let response = CompletionResponse::assistant(
        done.text,
        chrono::Utc::now().timestamp(),
        Usage::new(stats.prompt_n, stats.predicted_n),
        Timings::from_counts(stats.prompt_n, stats.prompt_ms, stats.predicted_n, stats.predicted_ms),
    );
    Ok(Json(response).into_response())
}

pub(super) async fn stream_raw(
    State(state): State<BackendState>,
    Json(request): Json<RawStreamRequest>,
) -> Result<Response, ApiError> {
    let images = decode_images(&request.prompt.images)?;
    let submission = Submission {
        text: request.prompt.text,
        images,
        reset_conversation: request.reset,
        add_bos: request.reset,
        stop: request.stop,
        sampler_overrides: Default::default(),
        streaming: true,
    };

    let SubmitOutcome::Streaming(tokens) = state.handle.submit(submission)? else {
        return Err(ApiError::internal("expected a token stream"));
    };

    let body = tokens.map(|item| {
        Ok::<_, Infallible>(match item {
            Ok(token) => format!("{}\n\n", token),
            Err(failure) => format!("Exception: {}", failure),
        })
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{body_json, scripted_router};
    use crate::engine::scripted::ScriptedEngine;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use relay_protocol::{sse_payloads, ChunkFrame, CompletionResponse};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body bytes");
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    #[tokio::test]
    async fn non_streaming_chat_returns_text_usage_and_timings() {
        let (app, _) = scripted_router(ScriptedEngine::new(&["Hi", " there"]));
        let res = app
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"messages": [{"role": "user", "content": "hello"}]}),
            ))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);

        let body: CompletionResponse = serde_json::from_value(body_json(res).await).expect("completion body");
        assert_eq!(body.text(), Some("Hi there"));
        assert_eq!(body.usage.prompt_tokens, 1);
        assert_eq!(body.usage.completion_tokens, 2);
        assert_eq!(body.usage.total_tokens, 3);
        let t = body.timings;
        assert_eq!(t.predicted_n, 2);
        if t.predicted_ms > 0.0 {
            let expected = t.predicted_n as f64 / (t.predicted_ms / 1000.0);
            assert!((t.predicted_per_second - expected).abs() <= expected * 1e-9);
        } else {
            assert_eq!(t.predicted_per_second, 0.0);
        }
    }

    #[tokio::test]
    async fn streaming_chat_emits_frames_stop_and_done() {
        let (app, _) = scripted_router(ScriptedEngine::new(&["a", "b"]));
        let res = app
            .oneshot(post_json(
                "/chat/completions",
                json!({"messages": [{"role": "user", "content": "hello"}], "stream": true}),
            ))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers()["content-type"]
            .to_str()
            .expect("content type")
            .starts_with("text/event-stream"));

        let text = body_text(res).await;
        let payloads = sse_payloads(&text);
        assert_eq!(payloads.len(), 4);
        let first: ChunkFrame = serde_json::from_str(payloads[0]).expect("first frame");
        let second: ChunkFrame = serde_json::from_str(payloads[1]).expect("second frame");
        assert_eq!(first.content(), Some("a"));
        assert_eq!(second.content(), Some("b"));
        let stop: ChunkFrame = serde_json::from_str(payloads[2]).expect("stop frame");
        assert_eq!(stop, ChunkFrame::stop());
        assert_eq!(payloads[3], "[DONE]");
    }

    #[tokio::test]
    async fn malformed_body_yields_error_frame_then_done() {
        let (app, _) = scripted_router(ScriptedEngine::new(&["a"]));
        let res = app
            .oneshot(post_json("/completions", json!({"stream": true})))
            .await
            .expect("response");
        let text = body_text(res).await;
        let payloads = sse_payloads(&text);
        assert_eq!(payloads.len(), 2);
        let err: Value = serde_json::from_str(payloads[0]).expect("error frame");
        assert!(err["error"].as_str().expect("error text").contains("messages"));
        assert_eq!(payloads[1], "[DONE]");
    }

    #[tokio::test]
    async fn engine_failure_mid_stream_is_an_error_frame() {
        let (app, _) = scripted_router(ScriptedEngine::new(&["a"]).failing_generation());
        let res = app
            .oneshot(post_json(
                "/chat/completions",
                json!({"messages": [{"content": "x"}], "stream": true}),
            ))
            .await
            .expect("response");
        let text = body_text(res).await;
        let payloads = sse_payloads(&text);
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].contains("\"error\""));
        assert_eq!(payloads[1], "[DONE]");
    }

    #[tokio::test]
    async fn images_on_a_text_only_engine_are_rejected() {
        let (app, _) = scripted_router(ScriptedEngine::new(&["a"]));
        let res = app
            .oneshot(post_json(
                "/chat/completions",
                json!({"messages": [{"content": {"text": "what is this", "images": ["aGVsbG8="]}}]}),
            ))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(res).await, json!({"error": "engine not multimodal"}));
    }

    #[tokio::test]
    async fn invalid_content_shape_is_a_client_error() {
        let (app, _) = scripted_router(ScriptedEngine::new(&["a"]));
        let res = app
            .oneshot(post_json(
                "/chat/completions",
                json!({"messages": [{"content": {"text": "x", "video": "y"}}]}),
            ))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn multi_turn_requests_keep_context_unless_reset() {
        let engine = ScriptedEngine::new(&["ok"]);
        let log = Arc::clone(&engine.log);
        let (app, _) = scripted_router(engine);
        let turns = json!([
            {"role": "user", "content": "one"},
            {"role": "assistant", "content": "ok"},
            {"role": "user", "content": [{"type": "text", "text": "two"}]}
        ]);
        app.clone()
            .oneshot(post_json("/chat/completions", json!({"messages": turns})))
            .await
            .expect("response");
        app.oneshot(post_json("/chat/completions", json!({"messages": turns, "reset": true})))
            .await
            .expect("response");

        let log = log.lock().expect("log");
        assert_eq!(log.prompts[0], ("two".to_string(), 0, false));
        assert_eq!(log.prompts[1], ("two".to_string(), 0, true));
        assert_eq!(log.resets, 1);
    }

    #[tokio::test]
    async fn raw_stream_writes_tokens_with_blank_lines() {
        let (app, _) = scripted_router(ScriptedEngine::new(&["x", "y"]));
        let res = app
            .oneshot(post_json("/stream", json!({"text": "hi", "images": []})))
            .await
            .expect("response");
        assert_eq!(res.headers()["cache-control"], "no-cache");
        assert_eq!(res.headers()["x-accel-buffering"], "no");
        assert_eq!(body_text(res).await, "x\n\ny\n\n");
    }

    #[tokio::test]
    async fn busy_handle_rejects_with_conflict() {
        let engine = ScriptedEngine::new(&["x"; 50]).with_delay(std::time::Duration::from_millis(5));
        let (app, handle) = scripted_router(engine);
        let first = app
            .clone()
            .oneshot(post_json(
                "/chat/completions",
                json!({"messages": [{"content": "a"}], "stream": true}),
            ))
            .await
            .expect("first response");
        assert!(handle.is_generating());

        let second = app
            .oneshot(post_json("/chat/completions", json!({"messages": [{"content": "b"}]})))
            .await
            .expect("second response");
        assert_eq!(second.status(), StatusCode::CONFLICT);
        drop(first);
    }
}
