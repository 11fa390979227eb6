//! 转换器注册表：每个供应商一组纯函数，在规范消息与线协议消息之间双向转换
//!
//! 注册表在首次访问时构建，之后只读，可被多个会话并发读取。
//! 按 ProviderKind 查找；字符串键先解析为 ProviderKind，未知键返回 UnknownProvider。

pub mod claude;
pub mod gemini;
pub mod openai;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::GatewayError;
use crate::llm::{Message, ToolDefinition};

/// 供应商标识
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    Claude,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [ProviderKind::OpenAi, ProviderKind::Gemini, ProviderKind::Claude];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Claude => "claude",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "claude" | "anthropic" => Ok(ProviderKind::Claude),
            other => Err(GatewayError::UnknownProvider(other.to_string())),
        }
    }
}

/// 单个供应商的转换函数
///
/// from_canonical 可能产出多条线协议消息（例如 OpenAI 的 tool 消息每个结果一条）。
#[derive(Clone, Copy)]
pub struct ConverterEntry {
    pub to_canonical: fn(&Value) -> Result<Message, GatewayError>,
    pub from_canonical: fn(&Message) -> Vec<Value>,
    pub tool_to_canonical: fn(&Value) -> Result<ToolDefinition, GatewayError>,
    pub tool_from_canonical: fn(&ToolDefinition) -> Value,
}

impl fmt::Debug for ConverterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterEntry").finish_non_exhaustive()
    }
}

/// 进程级转换器表
#[derive(Debug)]
pub struct ConverterRegistry {
    entries: HashMap<ProviderKind, ConverterEntry>,
}

impl ConverterRegistry {
    fn builtin() -> Self {
        let mut entries = HashMap::new();
        entries.insert(ProviderKind::OpenAi, openai::ENTRY);
        entries.insert(ProviderKind::Gemini, gemini::ENTRY);
        entries.insert(ProviderKind::Claude, claude::ENTRY);
        Self { entries }
    }

    pub fn get(&self, kind: ProviderKind) -> Result<&ConverterEntry, GatewayError> {
        self.entries
            .get(&kind)
            .ok_or_else(|| GatewayError::UnknownProvider(kind.to_string()))
    }

    /// 按字符串键查找（"openai" / "gemini" / "claude" 及别名）
    pub fn lookup(&self, key: &str) -> Result<&ConverterEntry, GatewayError> {
        self.get(key.parse()?)
    }

    pub fn providers(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.entries.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

static REGISTRY: OnceLock<ConverterRegistry> = OnceLock::new();

/// 全局只读注册表
pub fn registry() -> &'static ConverterRegistry {
    REGISTRY.get_or_init(ConverterRegistry::builtin)
}

/// 用指定供应商的转换器把整段历史转为线协议消息
pub fn messages_from_canonical(kind: ProviderKind, messages: &[Message]) -> Result<Vec<Value>, GatewayError> {
    let entry = registry().get(kind)?;
    Ok(messages.iter().flat_map(|m| (entry.from_canonical)(m)).collect())
}

pub fn tools_from_canonical(kind: ProviderKind, tools: &[ToolDefinition]) -> Result<Vec<Value>, GatewayError> {
    let entry = registry().get(kind)?;
    Ok(tools.iter().map(|t| (entry.tool_from_canonical)(t)).collect())
}

/// 拆分 data URI：`data:image/png;base64,XXXX` → (mime, data)
pub(crate) fn split_data_uri(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    Some((mime, data))
}

/// 把 ToolResult 的内容解析为 JSON；不是 JSON 时包装为 `{"content": ...}`
pub(crate) fn result_as_object(content: &str) -> Value {
    match serde_json::from_str::<Value>(content) {
        Ok(v @ Value::Object(_)) => v,
        _ => serde_json::json!({ "content": content }),
    }
}
