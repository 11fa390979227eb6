//! Gemini generateContent 线协议 ⇄ 规范消息
//!
//! Gemini 没有 system 角色：from_canonical 以 role = "system" 标出，由适配器提取为 systemInstruction。
//! 工具结果以 functionResponse 片段放在 user 角色内容中；functionCall 没有 id 时生成一个。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{result_as_object, split_data_uri, ConverterEntry};
use crate::core::GatewayError;
use crate::llm::{ContentPart, Message, Role, ToolCall, ToolChoice, ToolDefinition, ToolResult};
use crate::parser::normalize_argument_value;

pub const ENTRY: ConverterEntry = ConverterEntry {
    to_canonical,
    from_canonical,
    tool_to_canonical,
    tool_from_canonical,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// true 表示该片段是思考摘要
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub file_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: Value,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Part {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

pub fn to_canonical(value: &Value) -> Result<Message, GatewayError> {
    let wire: Content = serde_json::from_value(value.clone())
        .map_err(|e| GatewayError::Conversion(format!("gemini content: {}", e)))?;

    let role_key = wire.role.as_deref().unwrap_or("user");
    let has_responses = wire.parts.iter().any(|p| p.function_response.is_some());
    let role = match role_key {
        "model" | "assistant" => Role::Assistant,
        "system" => Role::System,
        "function" | "tool" => Role::Tool,
        "user" if has_responses => Role::Tool,
        "user" => Role::User,
        other => return Err(GatewayError::Conversion(format!("gemini role: {}", other))),
    };

    let mut content = Vec::new();
    let mut tool_calls = Vec::new();
    for part in wire.parts {
        if let Some(call) = part.function_call {
            let id = call.id.filter(|id| !id.is_empty()).unwrap_or_else(ToolCall::generate_id);
            tool_calls.push(ToolCall::new(id, call.name, normalize_argument_value(&call.args)));
            continue;
        }
        if let Some(response) = part.function_response {
            content.push(ContentPart::ToolResult(ToolResult {
                tool_call_id: response.id.unwrap_or_default(),
                content: response_text(&response.response),
                name: response.name,
            }));
            continue;
        }
        if let Some(blob) = part.inline_data {
            content.push(media_part(&blob.mime_type, format!("data:{};base64,{}", blob.mime_type, blob.data), blob.data));
            continue;
        }
        if let Some(file) = part.file_data {
            let mime = file.mime_type.unwrap_or_default();
            content.push(media_part(&mime, file.file_uri.clone(), file.file_uri));
            continue;
        }
        if let Some(text) = part.text {
            if part.thought == Some(true) {
                content.push(ContentPart::reasoning(text));
            } else if !text.is_empty() {
                content.push(ContentPart::text(text));
            }
        }
    }

    Ok(Message {
        tool_calls,
        ..Message::new(role, content)
    })
}

/// 音频保留原始数据（base64 或地址），图片/视频用 URL（data URI 或远程地址）
fn media_part(mime: &str, url: String, raw: String) -> ContentPart {
    if let Some(format) = mime.strip_prefix("audio/") {
        ContentPart::Audio {
            data: raw,
            format: format.to_string(),
        }
    } else if mime.starts_with("video/") {
        ContentPart::Video { url }
    } else {
        ContentPart::Image { url }
    }
}

/// functionResponse.response 是对象；`{"content": "..."}` 还原为原文本
fn response_text(response: &Value) -> String {
    match response.get("content").and_then(Value::as_str) {
        Some(text) if response.as_object().map(|m| m.len()) == Some(1) => text.to_string(),
        _ => response.to_string(),
    }
}

pub fn from_canonical(message: &Message) -> Vec<Value> {
    let (role, parts) = match message.role {
        Role::System => ("system", vec![Part::text(message.text())]),
        Role::User => ("user", message.content.iter().filter_map(part_from_canonical).collect()),
        Role::Assistant => {
            let mut parts: Vec<Part> = message.content.iter().filter_map(part_from_canonical).collect();
            parts.extend(message.tool_calls.iter().map(|c| Part {
                function_call: Some(FunctionCall {
                    id: None,
                    name: c.function.name.clone(),
                    args: c.arguments_value(),
                }),
                ..Default::default()
            }));
            ("model", parts)
        }
        Role::Tool => (
            "user",
            message
                .tool_results_iter()
                .map(|r| Part {
                    function_response: Some(FunctionResponse {
                        id: None,
                        name: r.name.clone(),
                        response: result_as_object(&r.content),
                    }),
                    ..Default::default()
                })
                .collect(),
        ),
    };

    if parts.is_empty() {
        return Vec::new();
    }
    let content = Content {
        role: Some(role.to_string()),
        parts,
    };
    serde_json::to_value(content).into_iter().collect()
}

fn part_from_canonical(part: &ContentPart) -> Option<Part> {
    match part {
        ContentPart::Text { text } if !text.is_empty() => Some(Part::text(text.clone())),
        ContentPart::Text { .. } | ContentPart::Reasoning { .. } | ContentPart::ToolResult(_) => None,
        ContentPart::Image { url } | ContentPart::Video { url } => Some(url_part(url)),
        ContentPart::Audio { data, format } => {
            if data.starts_with("http://") || data.starts_with("https://") {
                Some(url_part(data))
            } else {
                Some(Part {
                    inline_data: Some(Blob {
                        mime_type: format!("audio/{}", format),
                        data: data.clone(),
                    }),
                    ..Default::default()
                })
            }
        }
    }
}

fn url_part(url: &str) -> Part {
    match split_data_uri(url) {
        Some((mime, data)) => Part {
            inline_data: Some(Blob {
                mime_type: mime.to_string(),
                data: data.to_string(),
            }),
            ..Default::default()
        },
        None => Part {
            file_data: Some(FileData {
                mime_type: mime_guess::from_path(url.split('?').next().unwrap_or(url))
                    .first()
                    .map(|m| m.essence_str().to_string()),
                file_uri: url.to_string(),
            }),
            ..Default::default()
        },
    }
}

/// functionDeclarations 中的单个声明
pub fn tool_to_canonical(value: &Value) -> Result<ToolDefinition, GatewayError> {
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Conversion("gemini function declaration without name".into()))?;
    Ok(ToolDefinition {
        name: name.to_string(),
        description: value
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        parameters: value
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    })
}

pub fn tool_from_canonical(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

/// 全部声明包装为单个 `{"functionDeclarations": [...]}` 工具
pub fn tools_payload(declarations: Vec<Value>) -> Value {
    json!([{ "functionDeclarations": declarations }])
}

pub fn tool_config(choice: &ToolChoice) -> Value {
    let config = match choice {
        ToolChoice::Auto => json!({"mode": "AUTO"}),
        ToolChoice::None => json!({"mode": "NONE"}),
        ToolChoice::Required => json!({"mode": "ANY"}),
        ToolChoice::Function(name) => json!({"mode": "ANY", "allowedFunctionNames": [name]}),
    };
    json!({ "functionCallingConfig": config })
}
