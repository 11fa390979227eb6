//! Gemini 适配器
//!
//! 直接以 reqwest 调用 generativelanguage REST 接口：system 放入 systemInstruction，
//! 工具声明统一包进一个 functionDeclarations；流式走 `streamGenerateContent?alt=sse`。

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::GatewayError;
use crate::llm::convert::{self, gemini as wire, ProviderKind};
use crate::llm::sse::{check_status, read_events};
use crate::llm::stream::{finalize_assistant, StreamAccumulator, StreamDelta};
use crate::llm::traits::{ensure_not_empty, log_provider_error};
use crate::llm::{ProviderAdapter, TurnRequest, TurnResponse, Usage};
use crate::media::MediaPreprocessor;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

pub struct GeminiAdapter {
    base_url: String,
    default_model: String,
    http: reqwest::Client,
    media: Option<MediaPreprocessor>,
}

impl GeminiAdapter {
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

    fn endpoint(&self, model: &str, stream: bool) -> String {
        if stream {
            format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url, model)
        } else {
            format!("{}/models/{}:generateContent", self.base_url, model)
        }
    }

    fn build_body(&self, request: &TurnRequest) -> Result<Value, GatewayError> {
        let (system, rest) = TurnRequest::split_system(&request.messages);
        let contents = convert::messages_from_canonical(ProviderKind::Gemini, &rest)?;

        let mut body = json!({ "contents": contents });
        if let Some(system) = system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if !request.tools.is_empty() {
            let declarations = convert::tools_from_canonical(ProviderKind::Gemini, &request.tools)?;
            body["tools"] = wire::tools_payload(declarations);
            body["toolConfig"] = wire::tool_config(&request.tool_choice);
        }

        let mut generation = serde_json::Map::new();
        if let Some(t) = request.temperature {
            generation.insert("temperature".into(), json!(t));
        }
        if let Some(max) = request.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(max));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }
        Ok(body)
    }

    fn request(&self, url: &str, api_key: &str, body: &Value) -> reqwest::RequestBuilder {
        self.http.post(url).header("x-goog-api-key", api_key).json(body)
    }

    async fn post(&self, url: &str, api_key: &str, body: &Value) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .request(url, api_key, body)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        check_status(ProviderKind::Gemini, response).await
    }

    async fn complete(&self, url: &str, api_key: &str, body: &Value) -> Result<TurnResponse, GatewayError> {
        let response: Value = self
            .post(url, api_key, body)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::malformed(ProviderKind::Gemini, e.to_string(), None))?;
        parse_response(&response)
    }

    async fn complete_stream(&self, url: &str, request: &TurnRequest, body: &Value) -> Result<TurnResponse, GatewayError> {
        let mut acc = StreamAccumulator::new(request.events.clone());
        let mut decoder = ChunkDecoder::default();

        read_events(ProviderKind::Gemini, self.request(url, &request.api_key, body), |data| {
            let chunk: Value = serde_json::from_str(data)
                .map_err(|e| GatewayError::malformed(ProviderKind::Gemini, format!("bad stream chunk: {}", e), None))?;
            for delta in decoder.decode(&chunk) {
                acc.push(delta);
            }
            Ok(true)
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
impl ProviderAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn send_turn(&self, request: &TurnRequest) -> Result<TurnResponse, GatewayError> {
        let model = if request.model.is_empty() { self.default_model.as_str() } else { request.model.as_str() };
        let url = self.endpoint(model, request.stream);
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
            let body = self.build_body(&prepared)?;
            let response = if request.stream {
                self.complete_stream(&url, request, &body).await?
            } else {
                self.complete(&url, &request.api_key, &body).await?
            };
            ensure_not_empty(ProviderKind::Gemini, response)
        }
        .await;

        if let Err(err) = &result {
            log_provider_error(ProviderKind::Gemini, model, &url, message_count, err);
        }
        result
    }
}

/// usageMetadata → Usage
pub(crate) fn parse_usage(v: &Value) -> Usage {
    let count = |key: &str| v.get(key).and_then(Value::as_u64);
    let mut usage = Usage::new(count("promptTokenCount").unwrap_or(0), count("candidatesTokenCount").unwrap_or(0));
    if let Some(total) = count("totalTokenCount") {
        usage.total_tokens = total;
    }
    usage.cached_tokens = count("cachedContentTokenCount");
    usage.reasoning_tokens = count("thoughtsTokenCount");
    usage
}

/// 非流式 GenerateContentResponse → TurnResponse
pub(crate) fn parse_response(response: &Value) -> Result<TurnResponse, GatewayError> {
    let usage = response.get("usageMetadata").map(parse_usage).unwrap_or_default();
    let Some(candidate) = response.get("candidates").and_then(|c| c.get(0)) else {
        let detail = match response.pointer("/promptFeedback/blockReason").and_then(Value::as_str) {
            Some(reason) => format!("response has no candidates (blocked: {})", reason),
            None => "response has no candidates".to_string(),
        };
        return Err(GatewayError::malformed(ProviderKind::Gemini, detail, Some(&usage)));
    };

    let mut content = candidate.get("content").cloned().unwrap_or_else(|| json!({"parts": []}));
    if content.get("parts").is_none() {
        content["parts"] = json!([]);
    }
    content["role"] = json!("model");

    Ok(TurnResponse {
        message: finalize_assistant(wire::to_canonical(&content)?),
        usage,
        finish_reason: candidate.get("finishReason").and_then(Value::as_str).map(str::to_string),
    })
}

/// 流式块解码；Gemini 每个 functionCall 都是完整的，按出现顺序编号
#[derive(Debug, Default)]
pub(crate) struct ChunkDecoder {
    next_call: usize,
}

impl ChunkDecoder {
    pub(crate) fn decode(&mut self, chunk: &Value) -> Vec<StreamDelta> {
        let mut deltas = Vec::new();
        if let Some(candidate) = chunk.get("candidates").and_then(|c| c.get(0)) {
            let parts = candidate.pointer("/content/parts").and_then(Value::as_array);
            for part in parts.into_iter().flatten() {
                if let Some(call) = part.get("functionCall") {
                    let arguments = match call.get("args") {
                        Some(Value::Null) | None => String::new(),
                        Some(args) => args.to_string(),
                    };
                    deltas.push(StreamDelta::ToolCall {
                        index: self.next_call,
                        id: call.get("id").and_then(Value::as_str).map(str::to_string),
                        name: call.get("name").and_then(Value::as_str).map(str::to_string),
                        arguments,
                    });
                    self.next_call += 1;
                } else if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if part.get("thought").and_then(Value::as_bool) == Some(true) {
                        deltas.push(StreamDelta::Reasoning(text.to_string()));
                    } else {
                        deltas.push(StreamDelta::Text(text.to_string()));
                    }
                }
            }
            if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
                deltas.push(StreamDelta::Finish(reason.to_string()));
            }
        }
        // 每个块都带累计用量，后到的覆盖先到的
        if let Some(usage) = chunk.get("usageMetadata") {
            deltas.push(StreamDelta::Usage(parse_usage(usage)));
        }
        deltas
    }
}
