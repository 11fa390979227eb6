//! 规范消息模型：与供应商无关的 system / user / assistant / tool 消息
//!
//! 所有适配器都先转换为这里的类型，再由转换器注册表转换为各家线协议格式。
//! 消息通过 parent_id 组成单向链表（历史链），消息本身不拥有子节点。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 工具执行结果（tool 消息的内容单元），tool_call_id 必须对应此前 assistant 发出的某个调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub name: String,
}

/// 有序内容片段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// 推理/思考内容，不作为最终回复文本
    Reasoning { text: String },
    /// url 可以是 data URI，也可以是远程地址（由媒体预处理内联）
    Image { url: String },
    Video { url: String },
    /// data 为 base64 数据或远程地址，format 如 mp3 / wav
    Audio { data: String, format: String },
    ToolResult(ToolResult),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        ContentPart::Reasoning { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::Image { url: url.into() }
    }

    /// 是否携带有意义的内容（空白文本不算）
    pub fn is_meaningful(&self) -> bool {
        match self {
            ContentPart::Text { text } => !text.trim().is_empty(),
            ContentPart::Reasoning { .. } => false,
            ContentPart::Image { url } | ContentPart::Video { url } => !url.trim().is_empty(),
            ContentPart::Audio { data, .. } => !data.trim().is_empty(),
            ContentPart::ToolResult(_) => true,
        }
    }
}

/// 函数调用：arguments 规范形态为 JSON 对象字符串
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// assistant 发出的工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: default_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// 新生成一个调用 id（供应商未给 id 或从文本中恢复时使用）
    pub fn generate_id() -> String {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// 参数解析为 JSON；不是合法对象时返回空对象
    pub fn arguments_value(&self) -> Value {
        match serde_json::from_str::<Value>(&self.function.arguments) {
            Ok(v @ Value::Object(_)) => v,
            _ => Value::Object(Default::default()),
        }
    }
}

/// 规范消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    /// 仅 assistant 使用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            role,
            content,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }

    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let text = text.into();
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentPart::text(text)]
        };
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// 由一批工具结果构造 tool 消息
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self::new(
            Role::Tool,
            results.into_iter().map(ContentPart::ToolResult).collect(),
        )
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// 拼接全部 Text 片段
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// 拼接全部 Reasoning 片段；没有时返回 None
    pub fn reasoning(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Reasoning { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(""))
        }
    }

    pub fn tool_results_iter(&self) -> impl Iterator<Item = &ToolResult> {
        self.content.iter().filter_map(|p| match p {
            ContentPart::ToolResult(r) => Some(r),
            _ => None,
        })
    }

    /// 「实际为空」：没有有意义的文本/图片/音频/工具结果，也没有工具调用。此类消息不会发给模型
    pub fn is_effectively_empty(&self) -> bool {
        self.tool_calls.is_empty() && !self.content.iter().any(ContentPart::is_meaningful)
    }

    /// 用新文本替换全部 Text 片段（其余片段保持原顺序），空文本时去掉 Text 片段
    pub fn replace_text(&mut self, text: &str) {
        let mut replaced = false;
        let mut content = Vec::with_capacity(self.content.len());
        for part in self.content.drain(..) {
            match part {
                ContentPart::Text { .. } => {
                    if !replaced && !text.is_empty() {
                        content.push(ContentPart::text(text));
                    }
                    replaced = true;
                }
                other => content.push(other),
            }
        }
        if !replaced && !text.is_empty() {
            content.push(ContentPart::text(text));
        }
        self.content = content;
    }
}

/// Token 使用统计（单轮或多轮累计）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

impl Usage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            ..Default::default()
        }
    }

    /// 累加另一轮的用量
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.cached_tokens = add_optional(self.cached_tokens, other.cached_tokens);
        self.reasoning_tokens = add_optional(self.reasoning_tokens, other.reasoning_tokens);
    }
}

fn add_optional(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

/// 供模型调用的工具声明
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 工具选择策略
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    Function(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effectively_empty() {
        assert!(Message::user("   \n").is_effectively_empty());
        assert!(Message::new(Role::User, vec![]).is_effectively_empty());
        assert!(!Message::user("hi").is_effectively_empty());
        assert!(!Message::new(Role::User, vec![ContentPart::image("https://x/a.png")]).is_effectively_empty());

        let with_calls = Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "f", "{}")]);
        assert!(!with_calls.is_effectively_empty());
    }

    #[test]
    fn test_reasoning_only_is_empty() {
        let msg = Message::new(Role::Assistant, vec![ContentPart::reasoning("hmm")]);
        assert!(msg.is_effectively_empty());
        assert_eq!(msg.reasoning().as_deref(), Some("hmm"));
    }

    #[test]
    fn test_replace_text_keeps_other_parts() {
        let mut msg = Message::new(
            Role::Assistant,
            vec![
                ContentPart::reasoning("r"),
                ContentPart::text("a"),
                ContentPart::text("b"),
            ],
        );
        msg.replace_text("clean");
        assert_eq!(msg.content, vec![ContentPart::reasoning("r"), ContentPart::text("clean")]);

        msg.replace_text("");
        assert_eq!(msg.content, vec![ContentPart::reasoning("r")]);
    }

    #[test]
    fn test_usage_add() {
        let mut total = Usage::new(10, 5);
        let mut other = Usage::new(3, 2);
        other.cached_tokens = Some(4);
        total.add(&other);
        assert_eq!(total.prompt_tokens, 13);
        assert_eq!(total.completion_tokens, 7);
        assert_eq!(total.total_tokens, 20);
        assert_eq!(total.cached_tokens, Some(4));
        assert_eq!(total.reasoning_tokens, None);
    }

    #[test]
    fn test_arguments_value_falls_back_to_object() {
        let call = ToolCall::new("c", "f", "not json");
        assert_eq!(call.arguments_value(), serde_json::json!({}));
        let call = ToolCall::new("c", "f", r#"{"a":1}"#);
        assert_eq!(call.arguments_value()["a"], 1);
    }

    #[test]
    fn test_message_serde_shape() {
        let msg = Message::tool_results(vec![ToolResult {
            tool_call_id: "c1".into(),
            content: "ok".into(),
            name: "f".into(),
        }]);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "tool");
        assert_eq!(v["content"][0]["type"], "tool_result");
        assert_eq!(v["content"][0]["tool_call_id"], "c1");
    }
}
