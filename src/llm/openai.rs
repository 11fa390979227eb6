//! OpenAI 兼容适配器
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url），请求与回复以 JSON 透传（byot），
//! 以便保留 reasoning_content 等非标准字段。每轮按解析出的 API Key 构造客户端（支持 Key 轮换）。

use async_openai::config::OpenAIConfig;
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::core::GatewayError;
use crate::llm::convert::{self, openai as wire, ProviderKind};
use crate::llm::stream::{finalize_assistant, StreamAccumulator, StreamDelta};
use crate::llm::traits::{ensure_not_empty, log_provider_error};
use crate::llm::{ProviderAdapter, TurnRequest, TurnResponse, Usage};
use crate::media::MediaPreprocessor;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiAdapter {
    base_url: String,
    default_model: String,
    media: Option<MediaPreprocessor>,
}

impl OpenAiAdapter {
    pub fn new(base_url: Option<&str>, model: Option<&str>) -> Self {
        Self {
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            default_model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            media: None,
        }
    }

    pub fn with_media(mut self, media: MediaPreprocessor) -> Self {
        self.media = Some(media);
        self
    }

    fn client(&self, api_key: &str) -> Client<OpenAIConfig> {
        let config = OpenAIConfig::new()
            .with_api_base(&self.base_url)
            .with_api_key(api_key);
        Client::with_config(config)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(&self, request: &TurnRequest, model: &str, messages: Vec<Value>) -> Result<Value, GatewayError> {
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(convert::tools_from_canonical(ProviderKind::OpenAi, &request.tools)?);
            body["tool_choice"] = wire::tool_choice(&request.tool_choice);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if request.stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        Ok(body)
    }

    async fn complete(&self, client: &Client<OpenAIConfig>, body: Value) -> Result<TurnResponse, GatewayError> {
        let response: Value = client.chat().create_byot(body).await.map_err(provider_error)?;

        let usage = response.get("usage").and_then(parse_usage).unwrap_or_default();
        let Some(choice) = response.get("choices").and_then(|c| c.get(0)) else {
            return Err(GatewayError::malformed(ProviderKind::OpenAi, "response has no choices", Some(&usage)));
        };
        let Some(raw) = choice.get("message") else {
            return Err(GatewayError::malformed(ProviderKind::OpenAi, "choice has no message", Some(&usage)));
        };

        let message = finalize_assistant(wire::to_canonical(raw)?);
        Ok(TurnResponse {
            message,
            usage,
            finish_reason: choice.get("finish_reason").and_then(Value::as_str).map(str::to_string),
        })
    }

    async fn complete_stream(
        &self,
        client: &Client<OpenAIConfig>,
        body: Value,
        request: &TurnRequest,
    ) -> Result<TurnResponse, GatewayError> {
        let mut stream = client.chat().create_stream_byot(body).await.map_err(provider_error)?;
        let mut acc = StreamAccumulator::new(request.events.clone());

        while let Some(item) = stream.next().await {
            let chunk: Value = item.map_err(provider_error)?;
            for delta in decode_chunk(&chunk) {
                acc.push(delta);
            }
        }

        let out = acc.finish();
        Ok(TurnResponse {
            message: out.message,
            usage: out.usage.unwrap_or_default(),
            finish_reason: out.finish_reason,
        })
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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

        let result = async {
            let wire_messages = convert::messages_from_canonical(ProviderKind::OpenAi, &messages)?;
            let body = self.build_body(request, model, wire_messages)?;
            let client = self.client(&request.api_key);
            let response = if request.stream {
                self.complete_stream(&client, body, request).await?
            } else {
                self.complete(&client, body).await?
            };
            ensure_not_empty(ProviderKind::OpenAi, response)
        }
        .await;

        if let Err(err) = &result {
            log_provider_error(ProviderKind::OpenAi, model, &self.endpoint(), messages.len(), err);
        }
        result
    }
}

fn provider_error(err: async_openai::error::OpenAIError) -> GatewayError {
    GatewayError::Provider {
        provider: ProviderKind::OpenAi,
        message: err.to_string(),
    }
}

/// `usage` 对象 → Usage（含 cached / reasoning 细分）
pub(crate) fn parse_usage(v: &Value) -> Option<Usage> {
    if v.is_null() {
        return None;
    }
    let prompt = v.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let completion = v.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
    let mut usage = Usage::new(prompt, completion);
    if let Some(total) = v.get("total_tokens").and_then(Value::as_u64) {
        usage.total_tokens = total;
    }
    usage.cached_tokens = v
        .pointer("/prompt_tokens_details/cached_tokens")
        .and_then(Value::as_u64);
    usage.reasoning_tokens = v
        .pointer("/completion_tokens_details/reasoning_tokens")
        .and_then(Value::as_u64);
    Some(usage)
}

/// 解码一个 chat.completion.chunk
pub(crate) fn decode_chunk(chunk: &Value) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();

    if let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) {
        if let Some(delta) = choice.get("delta") {
            let reasoning = delta
                .get("reasoning_content")
                .or_else(|| delta.get("reasoning"))
                .and_then(Value::as_str);
            if let Some(text) = reasoning {
                deltas.push(StreamDelta::Reasoning(text.to_string()));
            }
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                deltas.push(StreamDelta::Text(text.to_string()));
            }
            for (position, call) in delta
                .get("tool_calls")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .enumerate()
            {
                let index = call
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|i| i as usize)
                    .unwrap_or(position);
                let arguments = match call.pointer("/function/arguments") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                deltas.push(StreamDelta::ToolCall {
                    index,
                    id: call.get("id").and_then(Value::as_str).map(str::to_string),
                    name: call.pointer("/function/name").and_then(Value::as_str).map(str::to_string),
                    arguments,
                });
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            deltas.push(StreamDelta::Finish(reason.to_string()));
        }
    }

    if let Some(usage) = chunk.get("usage").and_then(parse_usage) {
        deltas.push(StreamDelta::Usage(usage));
    }
    deltas
}
