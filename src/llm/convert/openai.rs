//! OpenAI chat completions 线协议消息 ⇄ 规范消息
//!
//! 同样适用于任意 OpenAI 兼容端点（DeepSeek、Qwen、自建代理等）；reasoning_content 按推理片段处理。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ConverterEntry;
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
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ChatContent>,
    #[serde(default, alias = "reasoning", skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ChatPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatPart {
    Text { text: String },
    ImageUrl { image_url: MediaUrl },
    VideoUrl { video_url: MediaUrl },
    InputAudio { input_audio: InputAudio },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAudio {
    pub data: String,
    pub format: String,
}

/// 参数在请求中是字符串；部分兼容端点在回复里直接给对象，两者都接受
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

fn function_type() -> String {
    "function".to_string()
}

/// 线协议消息 → 规范消息
pub fn to_canonical(value: &Value) -> Result<Message, GatewayError> {
    let wire: ChatMessage = serde_json::from_value(value.clone())
        .map_err(|e| GatewayError::Conversion(format!("openai message: {}", e)))?;

    let role = match wire.role.as_str() {
        "system" | "developer" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        other => return Err(GatewayError::Conversion(format!("openai role: {}", other))),
    };

    if role == Role::Tool {
        let result = ToolResult {
            tool_call_id: wire.tool_call_id.unwrap_or_default(),
            content: content_text(wire.content.as_ref()),
            name: wire.name.unwrap_or_default(),
        };
        return Ok(Message::tool_results(vec![result]));
    }

    let mut content = Vec::new();
    if let Some(reasoning) = wire.reasoning_content.filter(|r| !r.is_empty()) {
        content.push(ContentPart::reasoning(reasoning));
    }
    match wire.content {
        Some(ChatContent::Text(text)) if !text.is_empty() => content.push(ContentPart::text(text)),
        Some(ChatContent::Parts(parts)) => content.extend(parts.into_iter().filter_map(part_to_canonical)),
        _ => {}
    }

    let tool_calls = wire
        .tool_calls
        .into_iter()
        .map(|c| {
            let id = c.id.filter(|id| !id.is_empty()).unwrap_or_else(ToolCall::generate_id);
            ToolCall::new(id, c.function.name, normalize_argument_value(&c.function.arguments))
        })
        .collect();

    Ok(Message {
        tool_calls,
        ..Message::new(role, content)
    })
}

fn part_to_canonical(part: ChatPart) -> Option<ContentPart> {
    match part {
        ChatPart::Text { text } => Some(ContentPart::Text { text }),
        ChatPart::ImageUrl { image_url } => Some(ContentPart::Image { url: image_url.url }),
        ChatPart::VideoUrl { video_url } => Some(ContentPart::Video { url: video_url.url }),
        ChatPart::InputAudio { input_audio } => Some(ContentPart::Audio {
            data: input_audio.data,
            format: input_audio.format,
        }),
        ChatPart::Unsupported => None,
    }
}

fn content_text(content: Option<&ChatContent>) -> String {
    match content {
        Some(ChatContent::Text(text)) => text.clone(),
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .filter_map(|p| match p {
                ChatPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
        None => String::new(),
    }
}

/// 规范消息 → 线协议消息；tool 消息每个结果一条
pub fn from_canonical(message: &Message) -> Vec<Value> {
    let wire: Vec<ChatMessage> = match message.role {
        Role::System => vec![ChatMessage {
            role: "system".into(),
            content: Some(ChatContent::Text(message.text())),
            ..Default::default()
        }],
        Role::User => vec![ChatMessage {
            role: "user".into(),
            content: Some(user_content(message)),
            ..Default::default()
        }],
        Role::Assistant => {
            let text = message.text();
            vec![ChatMessage {
                role: "assistant".into(),
                content: (!text.is_empty() || message.tool_calls.is_empty()).then_some(ChatContent::Text(text)),
                tool_calls: message
                    .tool_calls
                    .iter()
                    .map(|c| WireToolCall {
                        id: Some(c.id.clone()),
                        kind: function_type(),
                        function: WireFunction {
                            name: c.function.name.clone(),
                            arguments: Value::String(c.function.arguments.clone()),
                        },
                    })
                    .collect(),
                ..Default::default()
            }]
        }
        Role::Tool => message
            .tool_results_iter()
            .map(|r| ChatMessage {
                role: "tool".into(),
                content: Some(ChatContent::Text(r.content.clone())),
                tool_call_id: Some(r.tool_call_id.clone()),
                name: (!r.name.is_empty()).then(|| r.name.clone()),
                ..Default::default()
            })
            .collect(),
    };

    wire.into_iter()
        .filter_map(|m| serde_json::to_value(m).ok())
        .collect()
}

/// 纯文本时用字符串，含媒体时用片段数组
fn user_content(message: &Message) -> ChatContent {
    let text_only = message
        .content
        .iter()
        .all(|p| matches!(p, ContentPart::Text { .. } | ContentPart::Reasoning { .. }));
    if text_only {
        return ChatContent::Text(message.text());
    }

    let parts = message
        .content
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(ChatPart::Text { text: text.clone() }),
            ContentPart::Image { url } => Some(ChatPart::ImageUrl {
                image_url: MediaUrl { url: url.clone() },
            }),
            ContentPart::Video { url } => Some(ChatPart::VideoUrl {
                video_url: MediaUrl { url: url.clone() },
            }),
            ContentPart::Audio { data, format } => Some(ChatPart::InputAudio {
                input_audio: InputAudio {
                    data: data.clone(),
                    format: format.clone(),
                },
            }),
            ContentPart::Reasoning { .. } | ContentPart::ToolResult(_) => None,
        })
        .collect();
    ChatContent::Parts(parts)
}

/// `{"type": "function", "function": {...}}`，也接受不带包装的 `{name, description, parameters}`
pub fn tool_to_canonical(value: &Value) -> Result<ToolDefinition, GatewayError> {
    let function = value.get("function").unwrap_or(value);
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Conversion("openai tool without name".into()))?;
    Ok(ToolDefinition {
        name: name.to_string(),
        description: function
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        parameters: function
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    })
}

pub fn tool_from_canonical(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

pub fn tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Required => json!("required"),
        ToolChoice::Function(name) => json!({"type": "function", "function": {"name": name}}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_tool_call_round_trip() {
        let original = Message {
            tool_calls: vec![ToolCall::new("call_1", "get_weather", r#"{"city":"Paris"}"#)],
            ..Message::assistant("Checking.")
        };
        let wire = from_canonical(&original);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["arguments"], r#"{"city":"Paris"}"#);

        let back = to_canonical(&wire[0]).unwrap();
        assert_eq!(back.role, Role::Assistant);
        assert_eq!(back.text(), "Checking.");
        assert_eq!(back.tool_calls[0].id, "call_1");
        assert_eq!(back.tool_calls[0].function.name, "get_weather");
        assert_eq!(back.tool_calls[0].function.arguments, r#"{"city":"Paris"}"#);
    }

    #[test]
    fn test_object_arguments_are_normalized() {
        let wire = json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{"id": "c", "type": "function", "function": {"name": "f", "arguments": {"b": 2, "a": 1}}}]
        });
        let msg = to_canonical(&wire).unwrap();
        assert_eq!(msg.tool_calls[0].arguments_value(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_reasoning_content() {
        let wire = json!({"role": "assistant", "content": "4", "reasoning_content": "2+2"});
        let msg = to_canonical(&wire).unwrap();
        assert_eq!(msg.reasoning().as_deref(), Some("2+2"));
        assert_eq!(msg.text(), "4");
    }

    #[test]
    fn test_tool_message_one_per_result() {
        let msg = Message::tool_results(vec![
            ToolResult { tool_call_id: "a".into(), content: "1".into(), name: "f".into() },
            ToolResult { tool_call_id: "b".into(), content: "2".into(), name: "g".into() },
        ]);
        let wire = from_canonical(&msg);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[1]["role"], "tool");
        assert_eq!(wire[1]["tool_call_id"], "b");
    }

    #[test]
    fn test_user_with_image_uses_parts() {
        let msg = Message::new(
            Role::User,
            vec![ContentPart::text("what is this"), ContentPart::image("data:image/png;base64,AA")],
        );
        let wire = from_canonical(&msg);
        assert_eq!(wire[0]["content"][1]["type"], "image_url");
        assert_eq!(wire[0]["content"][1]["image_url"]["url"], "data:image/png;base64,AA");

        assert_eq!(from_canonical(&Message::user("hi"))[0]["content"], "hi");
    }

    #[test]
    fn test_tool_definition_and_choice() {
        let def = ToolDefinition {
            name: "echo".into(),
            description: "Echo".into(),
            parameters: json!({"type": "object"}),
        };
        let wire = tool_from_canonical(&def);
        assert_eq!(tool_to_canonical(&wire).unwrap(), def);
        assert_eq!(tool_choice(&ToolChoice::None), json!("none"));
        assert_eq!(tool_choice(&ToolChoice::Function("f".into()))["function"]["name"], "f");
    }

    #[test]
    fn test_unknown_role_is_error() {
        assert!(to_canonical(&json!({"role": "narrator", "content": "x"})).is_err());
    }
}
