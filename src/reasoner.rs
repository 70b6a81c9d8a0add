use crate::action::{Observation, ProposedCall, TOOL_BASH, TOOL_CAPTCHA, TOOL_COMPUTER, TOOL_CREDENTIAL};
use crate::conversation::Turn;
use crate::executor::DisplayBounds;
use anyhow::bail;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use thiserror::Error;
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Everything the model sees for one decision.
#[derive(Debug)]
pub struct ModelRequest<'a> {
    pub task: &'a str,
    pub turns: &'a [Turn],
    pub tools: &'a [Value],
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelReply {
    pub narration: Option<String>,
    pub calls: Vec<ProposedCall>,
    /// The model ended its turn without asking for anything further.
    pub done: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("model transport error: {0}")]
    Transport(String),
    #[error("model returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response invalid: {0}")]
    Decode(String),
}

impl ModelError {
    /// Client errors other than timeouts and rate limits will fail the same
    /// way on every retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Status { status, .. } => !(400..500).contains(status) || *status == 408 || *status == 429,
            ModelError::Transport(_) | ModelError::Decode(_) => true,
        }
    }
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn propose(&self, request: &ModelRequest<'_>) -> Result<ModelReply, ModelError>;
}

// ========================= Tool schemas =========================

fn hint_properties() -> Value {
    json!({
        "field": {
            "type": "string",
            "enum": ["username", "password", "one_time_code", "payment", "captcha_answer", "credential_submit"],
            "description": "Kind of form field this action targets. Always set it for login, payment and CAPTCHA steps."
        },
        "needs_human": {
            "type": "boolean",
            "description": "Ask the operator to approve this action before it runs."
        }
    })
}

fn with_hints(mut properties: Value) -> Value {
    if let (Some(obj), Value::Object(hints)) = (properties.as_object_mut(), hint_properties()) {
        obj.extend(hints);
    }
    properties
}

/// Tool declarations sent with every request.
pub fn tool_definitions(bounds: DisplayBounds) -> Vec<Value> {
    vec![
        json!({
            "name": TOOL_COMPUTER,
            "description": format!(
                "Control the desktop. The display is {}x{} pixels; coordinates are [x, y] from the top-left.",
                bounds.width, bounds.height
            ),
            "input_schema": {
                "type": "object",
                "properties": with_hints(json!({
                    "action": {
                        "type": "string",
                        "enum": ["screenshot", "left_click", "right_click", "middle_click", "double_click",
                                 "triple_click", "left_click_drag", "left_mouse_down", "left_mouse_up",
                                 "mouse_move", "type", "key", "hold_key", "scroll", "wait"]
                    },
                    "coordinate": {"type": "array", "items": {"type": "integer"}, "minItems": 2, "maxItems": 2},
                    "start_coordinate": {"type": "array", "items": {"type": "integer"}, "minItems": 2, "maxItems": 2},
                    "text": {"type": "string", "description": "Text to type, or key combo such as ctrl+l"},
                    "scroll_direction": {"type": "string", "enum": ["up", "down", "left", "right"]},
                    "scroll_amount": {"type": "integer", "minimum": 1},
                    "key": {"type": "string", "description": "Key to hold, such as shift"},
                    "duration": {"type": "number", "description": "Seconds to wait, or to hold the key"}
                })),
                "required": ["action"]
            }
        }),
        json!({
            "name": TOOL_BASH,
            "description": "Run a shell command inside the sandbox. Each command runs in a fresh shell.",
            "input_schema": {
                "type": "object",
                "properties": with_hints(json!({
                    "command": {"type": "string"},
                    "restart": {"type": "boolean"}
                }))
            }
        }),
        json!({
            "name": TOOL_CREDENTIAL,
            "description": "Ask the operator for a username, password, 2FA code or other value. \
                            Passwords and codes come back as a {{secret:<id>}} placeholder; type the \
                            placeholder verbatim with the matching field and it will be filled in.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "credential_type": {"type": "string", "enum": ["username", "password", "2fa", "custom"]},
                    "service_name": {"type": "string"},
                    "custom_message": {"type": "string"}
                },
                "required": ["credential_type"]
            }
        }),
        json!({
            "name": TOOL_CAPTCHA,
            "description": "Report a CAPTCHA visible on screen. It is solved automatically when possible; \
                            then perform the submit/verify step with field=captcha_answer.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "captcha_type": {
                        "type": "string",
                        "enum": ["recaptcha_v2", "recaptcha_v3", "turnstile", "amazon_waf", "image_to_text"]
                    },
                    "website_url": {"type": "string"},
                    "website_key": {"type": "string"},
                    "page_action": {"type": "string"}
                },
                "required": ["captcha_type", "website_url"]
            }
        }),
    ]
}

// ========================= Anthropic =========================

#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: String,
}

pub const SYSTEM_PROMPT: &str = "You operate a Linux desktop through tools to complete the user's task. \
Take a screenshot first to see the screen, act one step at a time and check the result. \
Never guess credentials: ask the operator with the credential tool. \
When you see a CAPTCHA, report it with the captcha tool. \
When the task is complete, reply with a short summary and no tool calls.";

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_API_BASE.into()),
            api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
            max_tokens: 4096,
            system_prompt: SYSTEM_PROMPT.into(),
        }
    }
}

#[derive(Clone)]
pub struct AnthropicReasoner {
    http: Client,
    cfg: AnthropicConfig,
}

impl AnthropicReasoner {
    pub fn new(cfg: AnthropicConfig) -> anyhow::Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("ANTHROPIC_API_KEY missing");
        }
        Ok(Self { http: Client::new(), cfg })
    }

    fn body(&self, request: &ModelRequest<'_>) -> Value {
        json!({
            "model": self.cfg.model,
            "max_tokens": self.cfg.max_tokens,
            "system": self.cfg.system_prompt,
            "tools": request.tools,
            "messages": render_messages(request.task, request.turns),
        })
    }
}

#[async_trait]
impl Reasoner for AnthropicReasoner {
    async fn propose(&self, request: &ModelRequest<'_>) -> Result<ModelReply, ModelError> {
        let url = format!("{}/messages", self.cfg.api_base.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| ModelError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ModelError::Status { status: status.as_u16(), body: text });
        }
        let v: Value = serde_json::from_str(&text).map_err(|e| ModelError::Decode(e.to_string()))?;
        parse_reply(&v)
    }
}

/// Task first, then each turn as an assistant `tool_use` message followed by
/// a user message holding the matching `tool_result` blocks.
pub fn render_messages(task: &str, turns: &[Turn]) -> Vec<Value> {
    let mut messages = vec![json!({
        "role": "user",
        "content": [{"type": "text", "text": format!("Task: {task}")}]
    })];
    for turn in turns {
        let mut content = Vec::new();
        if let Some(text) = turn.narration.as_deref().filter(|t| !t.is_empty()) {
            content.push(json!({"type": "text", "text": text}));
        }
        for call in &turn.calls {
            content.push(json!({"type": "tool_use", "id": call.id, "name": call.tool, "input": call.input}));
        }
        messages.push(json!({"role": "assistant", "content": content}));

        let results: Vec<Value> = turn
            .results
            .iter()
            .map(|r| {
                let mut block = json!({"type": "tool_result", "tool_use_id": r.call_id});
                match &r.observation {
                    Observation::Frame { png_base64, note } => {
                        let mut parts = Vec::new();
                        if let Some(n) = note {
                            parts.push(json!({"type": "text", "text": n}));
                        }
                        parts.push(json!({
                            "type": "image",
                            "source": {"type": "base64", "media_type": "image/png", "data": png_base64}
                        }));
                        block["content"] = Value::Array(parts);
                    }
                    Observation::Output { text } => {
                        let text = if text.is_empty() { "(no output)" } else { text.as_str() };
                        block["content"] = json!([{"type": "text", "text": text}]);
                    }
                    Observation::Failure { error } => {
                        block["content"] = json!([{"type": "text", "text": format!("Error: {error}")}]);
                        block["is_error"] = Value::Bool(true);
                    }
                }
                block
            })
            .collect();
        messages.push(json!({"role": "user", "content": results}));
    }
    messages
}

pub fn parse_reply(v: &Value) -> Result<ModelReply, ModelError> {
    let content = v
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::Decode("missing content".into()))?;
    let mut texts = Vec::new();
    let mut calls = Vec::new();
    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    texts.push(t.to_string());
                }
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str);
                let name = block.get("name").and_then(Value::as_str);
                let (Some(id), Some(name)) = (id, name) else {
                    return Err(ModelError::Decode("tool_use block without id or name".into()));
                };
                calls.push(ProposedCall {
                    id: id.to_string(),
                    tool: name.to_string(),
                    input: block.get("input").cloned().unwrap_or_else(|| json!({})),
                });
            }
            other => debug!(?other, "ignoring content block"),
        }
    }
    let stop = v.get("stop_reason").and_then(Value::as_str).unwrap_or("end_turn");
    let done = calls.is_empty() && stop == "end_turn";
    let narration = if texts.is_empty() { None } else { Some(texts.join("\n")) };
    Ok(ModelReply { narration, calls, done })
}
