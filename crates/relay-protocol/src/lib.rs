//! Wire contract spoken by the routing proxy and every slot backend.
//!
//! Chat bodies follow the OpenAI shape closely enough for common clients; the
//! last message's content may be a plain string, a `{text, images}` object or a
//! list of typed parts, and is normalized into a [`PromptPayload`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Payload marker that terminates every event stream.
pub const DONE_MARKER: &str = "[DONE]";

/// Endpoints whose POST bodies may ask for a streamed answer.
pub const COMPLETION_ENDPOINTS: [&str; 4] =
    ["stream", "completions", "chat/completions", "v1/chat/completions"];

/// Sampler keys a chat body may carry, paired with the name the engine expects.
pub const SAMPLER_KEYS: [(&str, &str); 5] = [
    ("temperature", "temp"),
    ("top_k", "top_k"),
    ("top_p", "top_p"),
    ("min_p", "min_p"),
    ("top_n_sigma", "top_n_sigma"),
];

pub fn is_completion_endpoint(endpoint: &str) -> bool {
    let endpoint = endpoint.trim_matches('/');
    COMPLETION_ENDPOINTS.contains(&endpoint)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("Chat request carries no messages")]
    NoMessages,
    #[error("Unsupported key '{0}' in message content: only text and images are implemented")]
    UnsupportedKey(String),
    #[error("Unsupported content part type '{0}'")]
    UnsupportedPartType(String),
    #[error("Content field '{field}' must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
    #[error("Message content must be a string, an object or a list of parts")]
    UnsupportedShape,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default = "default_role")]
    pub role: String,
    pub content: Value,
}

fn default_role() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub reset: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n_sigma: Option<f64>,
}

impl ChatRequest {
    /// Normalized prompt of the last message, and whether the conversation restarts.
    ///
    /// A single-message conversation always restarts; `reset: true` forces it.
    pub fn prompt(&self) -> Result<(PromptPayload, bool), ContentError> {
        let last = self.messages.last().ok_or(ContentError::NoMessages)?;
        let content = MessageContent::try_from(&last.content)?;
        let restart = self.reset || self.messages.len() == 1;
        Ok((content.normalize(), restart))
    }

    /// Present sampler keys, renamed for the engine (`temperature` becomes `temp`).
    pub fn sampler_overrides(&self) -> BTreeMap<String, Value> {
        let values = [
            self.temperature,
            self.top_k,
            self.top_p,
            self.min_p,
            self.top_n_sigma,
        ];
        SAMPLER_KEYS
            .iter()
            .zip(values)
            .filter_map(|((_, engine_key), value)| {
                let number = serde_json::Number::from_f64(value?)?;
                Some((engine_key.to_string(), Value::Number(number)))
            })
            .collect()
    }
}

/// Canonical prompt shape: text plus base64-encoded images, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    Image(String),
}

/// The three accepted shapes of a message's `content`.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Structured { text: String, images: Vec<String> },
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn normalize(self) -> PromptPayload {
        match self {
            MessageContent::Text(text) => PromptPayload {
                text,
                images: Vec::new(),
            },
            MessageContent::Structured { text, images } => PromptPayload { text, images },
            MessageContent::Parts(parts) => {
                let mut texts = Vec::new();
                let mut images = Vec::new();
                for part in parts {
                    match part {
                        ContentPart::Text(t) => texts.push(t),
                        ContentPart::Image(i) => images.push(i),
                    }
                }
                PromptPayload {
                    text: texts.join("\n\n"),
                    images,
                }
            }
        }
    }
}

impl TryFrom<&Value> for MessageContent {
    type Error = ContentError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(text) => Ok(MessageContent::Text(text.clone())),
            Value::Object(map) => {
                reject_unknown_keys(map, &["type", "text", "images"])?;
                let text = optional_str(map, "text")?.unwrap_or_default();
                let images = match map.get("images") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|item| {
                            item.as_str().map(str::to_string).ok_or(ContentError::InvalidField {
                                field: "images",
                                expected: "a list of base64 strings",
                            })
                        })
                        .collect::<Result<_, _>>()?,
                    Some(_) => {
                        return Err(ContentError::InvalidField {
                            field: "images",
                            expected: "a list of base64 strings",
                        })
                    }
                };
                Ok(MessageContent::Structured { text, images })
            }
            Value::Array(items) => items
                .iter()
                .map(parse_part)
                .collect::<Result<Vec<_>, _>>()
                .map(MessageContent::Parts),
            _ => Err(ContentError::UnsupportedShape),
        }
    }
}

fn parse_part(value: &Value) -> Result<ContentPart, ContentError> {
    let map = value.as_object().ok_or(ContentError::UnsupportedShape)?;
    reject_unknown_keys(map, &["type", "text", "image"])?;
    let kind = optional_str(map, "type")?.ok_or(ContentError::InvalidField {
        field: "type",
        expected: "\"text\" or \"image\"",
    })?;
    match kind.as_str() {
        "text" => Ok(ContentPart::Text(optional_str(map, "text")?.unwrap_or_default())),
        "image" => optional_str(map, "image")?
            .map(ContentPart::Image)
            .ok_or(ContentError::InvalidField {
                field: "image",
                expected: "a base64 string",
            }),
        other => Err(ContentError::UnsupportedPartType(other.to_string())),
    }
}

fn reject_unknown_keys(map: &Map<String, Value>, allowed: &[&str]) -> Result<(), ContentError> {
    match map.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(ContentError::UnsupportedKey(key.clone())),
        None => Ok(()),
    }
}

fn optional_str(map: &Map<String, Value>, field: &'static str) -> Result<Option<String>, ContentError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ContentError::InvalidField {
            field,
            expected: "a string",
        }),
    }
}

// ---- streaming frames ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub choices: Vec<ChunkChoice>,
}

impl ChunkFrame {
    pub fn token(content: impl Into<String>) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta: Delta {
                    content: Some(content.into()),
                },
                finish_reason: None,
            }],
        }
    }

    pub fn stop() -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta: Delta::default(),
                finish_reason: Some("stop".to_string()),
            }],
        }
    }

    pub fn content(&self) -> Option<&str> {
        self.choices.first()?.delta.content.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
}

impl ErrorFrame {
    pub fn new(error: impl ToString) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}

/// Splits an event-stream body into its `data:` payloads.
pub fn sse_payloads(body: &str) -> Vec<&str> {
    body.split("\n\n")
        .filter_map(|event| event.trim_start().strip_prefix("data:"))
        .map(str::trim)
        .collect()
}

// ---- buffered completion ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub message: AssistantMessage,
    pub finish_reason: String,
    pub index: usize,
    #[serde(default)]
    pub logprobs: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_n: usize, predicted_n: usize) -> Self {
        Self {
            prompt_tokens: prompt_n,
            completion_tokens: predicted_n,
            total_tokens: prompt_n + predicted_n,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub prompt_per_token_ms: f64,
    pub prompt_per_second: f64,
    pub predicted_n: usize,
    pub predicted_ms: f64,
    pub predicted_per_token_ms: f64,
    pub predicted_per_second: f64,
}

impl Timings {
    /// Throughput figures from token counts and phase durations.
    ///
    /// A zero count or a zero duration yields `0.0` for the derived rates.
    pub fn from_counts(prompt_n: usize, prompt_ms: f64, predicted_n: usize, predicted_ms: f64) -> Self {
        Self {
            prompt_n,
            prompt_ms,
            prompt_per_token_ms: per_token_ms(prompt_n, prompt_ms),
            prompt_per_second: per_second(prompt_n, prompt_ms),
            predicted_n,
            predicted_ms,
            predicted_per_token_ms: per_token_ms(predicted_n, predicted_ms),
            predicted_per_second: per_second(predicted_n, predicted_ms),
        }
    }
}

fn per_token_ms(n: usize, ms: f64) -> f64 {
    if n == 0 || ms <= 0.0 {
        0.0
    } else {
        ms / n as f64
    }
}

fn per_second(n: usize, ms: f64) -> f64 {
    if n == 0 || ms <= 0.0 {
        0.0
    } else {
        n as f64 / (ms / 1000.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub role: String,
    pub choices: Vec<CompletionChoice>,
    pub created: i64,
    pub usage: Usage,
    pub timings: Timings,
}

impl CompletionResponse {
    pub fn assistant(content: String, created: i64, usage: Usage, timings: Timings) -> Self {
        Self {
            role: "assistant".to_string(),
            choices: vec![CompletionChoice {
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: "stop".to_string(),
                index: 0,
                logprobs: None,
            }],
            created,
            usage,
            timings,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// `{"message": ...}` body used by the control endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage<T> {
    pub message: T,
}

impl<T> StatusMessage<T> {
    pub fn new(message: T) -> Self {
        Self { message }
    }
}
