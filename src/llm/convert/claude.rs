//! Anthropic Messages API 线协议 ⇄ 规范消息
//!
//! system 由适配器提取到顶层字段；工具结果以 tool_result 块放在 user 消息里。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{split_data_uri, ConverterEntry};
use crate::core::GatewayError;
use crate::llm::{ContentPart, Message, Role, ToolCall, ToolChoice, ToolDefinition, ToolResult};
use crate::parser::normalize_argument_value;

pub const ENTRY: ConverterEntry = ConverterEntry {
    to_canonical,
    from_canonical,
    tool_to_canonical,
    tool_from_canonical,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: ClaudeContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaudeContent {
    Text(String),
    Blocks(Vec<Block>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

pub fn to_canonical(value: &Value) -> Result<Message, GatewayError> {
    let wire: ClaudeMessage = serde_json::from_value(value.clone())
        .map_err(|e| GatewayError::Conversion(format!("claude message: {}", e)))?;

    let blocks = match wire.content {
        ClaudeContent::Text(text) => vec![Block::Text { text }],
        ClaudeContent::Blocks(blocks) => blocks,
    };
    let has_results = blocks.iter().any(|b| matches!(b, Block::ToolResult { .. }));
    let role = match wire.role.as_str() {
        "assistant" => Role::Assistant,
        "system" => Role::System,
        "user" if has_results => Role::Tool,
        "user" => Role::User,
        other => return Err(GatewayError::Conversion(format!("claude role: {}", other))),
    };

    let mut content = Vec::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block {
            Block::Text { text } if !text.is_empty() => content.push(ContentPart::text(text)),
            Block::Text { .. } | Block::Unsupported => {}
            Block::Thinking { thinking, .. } => content.push(ContentPart::reasoning(thinking)),
            Block::Image { source } => content.push(ContentPart::Image {
                url: match source {
                    ImageSource::Base64 { media_type, data } => format!("data:{};base64,{}", media_type, data),
                    ImageSource::Url { url } => url,
                },
            }),
            Block::ToolUse { id, name, input } => {
                let id = if id.is_empty() { ToolCall::generate_id() } else { id };
                tool_calls.push(ToolCall::new(id, name, normalize_argument_value(&input)));
            }
            Block::ToolResult { tool_use_id, content: result, .. } => {
                content.push(ContentPart::ToolResult(ToolResult {
                    tool_call_id: tool_use_id,
                    content: result_text(&result),
                    name: String::new(),
                }))
            }
        }
    }

    Ok(Message {
        tool_calls,
        ..Message::new(role, content)
    })
}

/// tool_result.content 可以是字符串或文本块数组
fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn from_canonical(message: &Message) -> Vec<Value> {
    let (role, blocks): (&str, Vec<Block>) = match message.role {
        Role::System => ("system", vec![Block::Text { text: message.text() }]),
        Role::User => ("user", message.content.iter().filter_map(block_from_canonical).collect()),
        Role::Assistant => {
            let mut blocks: Vec<Block> = message.content.iter().filter_map(block_from_canonical).collect();
            blocks.extend(message.tool_calls.iter().map(|c| Block::ToolUse {
                id: c.id.clone(),
                name: c.function.name.clone(),
                input: c.arguments_value(),
            }));
            ("assistant", blocks)
        }
        Role::Tool => (
            "user",
            message
                .tool_results_iter()
                .map(|r| Block::ToolResult {
                    tool_use_id: r.tool_call_id.clone(),
                    content: Value::String(r.content.clone()),
                    is_error: None,
                })
                .collect(),
        ),
    };

    if blocks.is_empty() {
        return Vec::new();
    }
    let wire = ClaudeMessage {
        role: role.to_string(),
        content: ClaudeContent::Blocks(blocks),
    };
    serde_json::to_value(wire).into_iter().collect()
}

/// Claude 不接受音频/视频输入，这两类片段被丢弃；推理块缺少签名，不回传
fn block_from_canonical(part: &ContentPart) -> Option<Block> {
    match part {
        ContentPart::Text { text } if !text.is_empty() => Some(Block::Text { text: text.clone() }),
        ContentPart::Image { url } => Some(Block::Image {
            source: match split_data_uri(url) {
                Some((mime, data)) => ImageSource::Base64 {
                    media_type: mime.to_string(),
                    data: data.to_string(),
                },
                None => ImageSource::Url { url: url.clone() },
            },
        }),
        _ => None,
    }
}

pub fn tool_to_canonical(value: &Value) -> Result<ToolDefinition, GatewayError> {
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Conversion("claude tool without name".into()))?;
    Ok(ToolDefinition {
        name: name.to_string(),
        description: value
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        parameters: value
            .get("input_schema")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    })
}

pub fn tool_from_canonical(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

pub fn tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!({"type": "auto"}),
        ToolChoice::None => json!({"type": "none"}),
        ToolChoice::Required => json!({"type": "any"}),
        ToolChoice::Function(name) => json!({"type": "tool", "name": name}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_tool_use() {
        let wire = json!({
            "role": "assistant",
            "content": [
                {"type": "thinking", "thinking": "need time", "signature": "sig"},
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "get_time", "input": {}}
            ]
        });
        let msg = to_canonical(&wire).unwrap();
        assert_eq!(msg.reasoning().as_deref(), Some("need time"));
        assert_eq!(msg.text(), "Let me check.");
        assert_eq!(msg.tool_calls[0].id, "toolu_1");
        assert_eq!(msg.tool_calls[0].function.arguments, "{}");
    }

    #[test]
    fn test_tool_results_in_user_message() {
        let msg = Message::tool_results(vec![ToolResult {
            tool_call_id: "toolu_1".into(),
            content: "noon".into(),
            name: "get_time".into(),
        }]);
        let wire = from_canonical(&msg);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "tool_result");
        assert_eq!(wire[0]["content"][0]["tool_use_id"], "toolu_1");

        let back = to_canonical(&wire[0]).unwrap();
        assert_eq!(back.role, Role::Tool);
        assert_eq!(back.tool_results_iter().next().unwrap().content, "noon");
    }

    #[test]
    fn test_image_sources() {
        let msg = Message::new(
            Role::User,
            vec![
                ContentPart::image("data:image/png;base64,iVBOR"),
                ContentPart::image("https://example.com/a.jpg"),
                ContentPart::Audio { data: "AAAA".into(), format: "mp3".into() },
            ],
        );
        let wire = from_canonical(&msg);
        let blocks = wire[0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["source"]["type"], "base64");
        assert_eq!(blocks[0]["source"]["media_type"], "image/png");
        assert_eq!(blocks[1]["source"]["type"], "url");
    }

    #[test]
    fn test_plain_string_content() {
        let msg = to_canonical(&json!({"role": "user", "content": "hello"})).unwrap();
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "hello");
    }

    #[test]
    fn test_tool_schema_and_choice() {
        let def = ToolDefinition {
            name: "echo".into(),
            description: "Echo".into(),
            parameters: json!({"type": "object"}),
        };
        let wire = tool_from_canonical(&def);
        assert_eq!(wire["input_schema"]["type"], "object");
        assert_eq!(tool_to_canonical(&wire).unwrap(), def);
        assert_eq!(tool_choice(&ToolChoice::Required)["type"], "any");
    }
}
