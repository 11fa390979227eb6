//! Claude（Anthropic Messages API）适配器
//!
//! system 作为顶层字段，max_tokens 必填（缺省 4096）。流式事件按 content block 的 index 组装：
//! text_delta / thinking_delta 直接转发，tool_use 的参数由 input_json_delta 逐段拼接。

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::GatewayError;
use crate::llm::convert::{self, claude as wire, ProviderKind};
use crate::llm::sse::{check_status, read_events};
use crate::llm::stream::{finalize_assistant, StreamAccumulator, StreamDelta};
use crate::llm::traits::{ensure_not_empty, log_provider_error};
use crate::llm::{ProviderAdapter, TurnRequest, TurnResponse, Usage};
use crate::media::MediaPreprocessor;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
pub const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct ClaudeAdapter {
    base_url: String,
    default_model: String,
    http: reqwest::Client,
    media: Option<MediaPreprocessor>,
}

impl ClaudeAdapter {
    pub fn new(base_url: Option<&str>, model: Option<&str>) -> Self {
        Self {
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            default_model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            http: reqwest::Client::new(),
            media: None,
        }
    }

    pub fn with_media(mut self, media: MediaPreprocessor) -> Self {
        self.media = Some(media);
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn build_body(&self, request: &TurnRequest, model: &str) -> Result<Value, GatewayError> {
        let (system, rest) = TurnRequest::split_system(&request.messages);
        let messages = convert::messages_from_canonical(ProviderKind::Claude, &rest)?;

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(convert::tools_from_canonical(ProviderKind::Claude, &request.tools)?);
            body["tool_choice"] = wire::tool_choice(&request.tool_choice);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if request.stream {
            body["stream"] = json!(true);
        }
        Ok(body)
    }

    fn request(&self, api_key: &str, body: &Value) -> reqwest::RequestBuilder {
        self.http
            .post(self.endpoint())
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
    }

    async fn post(&self, api_key: &str, body: &Value) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .request(api_key, body)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        check_status(ProviderKind::Claude, response).await
    }

    async fn complete(&self, api_key: &str, body: &Value) -> Result<TurnResponse, GatewayError> {
        let response: Value = self
            .post(api_key, body)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::malformed(ProviderKind::Claude, e.to_string(), None))?;
        parse_response(&response)
    }

    async fn complete_stream(&self, request: &TurnRequest, body: &Value) -> Result<TurnResponse, GatewayError> {
        let mut acc = StreamAccumulator::new(request.events.clone());
        let mut decoder = EventDecoder::default();

        read_events(ProviderKind::Claude, self.request(&request.api_key, body), |data| {
            let event: Value = serde_json::from_str(data)
                .map_err(|e| GatewayError::malformed(ProviderKind::Claude, format!("bad stream event: {}", e), None))?;
            if event.get("type").and_then(Value::as_str) == Some("error") {
                return Err(GatewayError::Provider {
                    provider: ProviderKind::Claude,
                    message: event
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("stream error")
                        .to_string(),
                });
            }
            for delta in decoder.decode(&event) {
                acc.push(delta);
            }
            Ok(event.get("type").and_then(Value::as_str) != Some("message_stop"))
        })
        .await?;

        let out = acc.finish();
        Ok(TurnResponse {
            message: out.message,
            usage: out.usage.unwrap_or_default(),
            finish_reason: out.finish_reason,
        })
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn send_turn(&self, request: &TurnRequest) -> Result<TurnResponse, GatewayError> {
        let model = if request.model.is_empty() { self.default_model.as_str() } else { request.model.as_str() };
        let messages = match &self.media {
            Some(media) => media.process(&request.messages).await,
            None => request.messages.clone(),
        };
        let message_count = messages.len();

        let result = async {
            let prepared = TurnRequest {
                messages,
                events: None,
                ..request.clone()
            };
            let body = self.build_body(&prepared, model)?;
            let response = if request.stream {
                self.complete_stream(request, &body).await?
            } else {
                self.complete(&request.api_key, &body).await?
            };
            ensure_not_empty(ProviderKind::Claude, response)
        }
        .await;

        if let Err(err) = &result {
            log_provider_error(ProviderKind::Claude, model, &self.endpoint(), message_count, err);
        }
        result
    }
}

/// usage 对象 → Usage；缓存读取计入 cached_tokens
pub(crate) fn parse_usage(v: &Value) -> Usage {
    let count = |key: &str| v.get(key).and_then(Value::as_u64);
    let mut usage = Usage::new(count("input_tokens").unwrap_or(0), count("output_tokens").unwrap_or(0));
    usage.cached_tokens = count("cache_read_input_tokens");
    usage
}

pub(crate) fn parse_response(response: &Value) -> Result<TurnResponse, GatewayError> {
    let usage = response.get("usage").map(parse_usage).unwrap_or_default();
    let Some(content) = response.get("content").filter(|c| c.is_array()) else {
        return Err(GatewayError::malformed(ProviderKind::Claude, "response has no content", Some(&usage)));
    };
    let raw = json!({"role": "assistant", "content": content});
    Ok(TurnResponse {
        message: finalize_assistant(wire::to_canonical(&raw)?),
        usage,
        finish_reason: response.get("stop_reason").and_then(Value::as_str).map(str::to_string),
    })
}

/// 流式事件解码；message_start 与 message_delta 的用量需要合并
#[derive(Debug, Default)]
pub(crate) struct EventDecoder {
    usage: Usage,
}

impl EventDecoder {
    pub(crate) fn decode(&mut self, event: &Value) -> Vec<StreamDelta> {
        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
        match event.get("type").and_then(Value::as_str).unwrap_or("") {
            "message_start" => {
                if let Some(usage) = event.pointer("/message/usage") {
                    self.usage = parse_usage(usage);
                    return vec![StreamDelta::Usage(self.usage.clone())];
                }
                Vec::new()
            }
            "content_block_start" => {
                let Some(block) = event.get("content_block") else {
                    return Vec::new();
                };
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => vec![StreamDelta::ToolCall {
                        index,
                        id: block.get("id").and_then(Value::as_str).map(str::to_string),
                        name: block.get("name").and_then(Value::as_str).map(str::to_string),
                        arguments: String::new(),
                    }],
                    Some("text") => block
                        .get("text")
                        .and_then(Value::as_str)
                        .map(|t| vec![StreamDelta::Text(t.to_string())])
                        .unwrap_or_default(),
                    _ => Vec::new(),
                }
            }
            "content_block_delta" => {
                let Some(delta) = event.get("delta") else {
                    return Vec::new();
                };
                let field = |key: &str| delta.get(key).and_then(Value::as_str).unwrap_or("").to_string();
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => vec![StreamDelta::Text(field("text"))],
                    Some("thinking_delta") => vec![StreamDelta::Reasoning(field("thinking"))],
                    Some("input_json_delta") => vec![StreamDelta::ToolCall {
                        index,
                        id: None,
                        name: None,
                        arguments: field("partial_json"),
                    }],
                    _ => Vec::new(),
                }
            }
            "message_delta" => {
                let mut deltas = Vec::new();
                if let Some(usage) = event.get("usage") {
                    let update = parse_usage(usage);
                    if usage.get("input_tokens").is_some() {
                        self.usage.prompt_tokens = update.prompt_tokens;
                    }
                    self.usage.completion_tokens = update.completion_tokens;
                    self.usage.total_tokens = self.usage.prompt_tokens + self.usage.completion_tokens;
                    deltas.push(StreamDelta::Usage(self.usage.clone()));
                }
                if let Some(reason) = event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    deltas.push(StreamDelta::Finish(reason.to_string()));
                }
                deltas
            }
            _ => Vec::new(),
        }
    }
}
