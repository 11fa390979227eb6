//! 供应商适配器抽象
//!
//! 每个适配器实现「发送一轮」：媒体预处理 → 转换为线协议 → 调用供应商 → 转回规范消息
//! （流式时经 StreamAccumulator 重建）→ 恢复解析器兜底。供应商专有字段名只出现在适配器与转换器中。

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::events::TurnEvent;
use crate::core::GatewayError;
use crate::llm::{Message, ProviderKind, Role, ToolChoice, ToolDefinition, Usage};

/// 单轮请求
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    /// 完整上下文（含 system），按时间顺序
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub model: String,
    pub api_key: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tool_choice: ToolChoice,
    pub stream: bool,
    pub events: Option<UnboundedSender<TurnEvent>>,
}

impl TurnRequest {
    /// 拆出 system 文本（Gemini / Claude 放在顶层字段）与其余消息
    pub fn split_system(messages: &[Message]) -> (Option<String>, Vec<Message>) {
        let system: Vec<String> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(Message::text)
            .filter(|t| !t.trim().is_empty())
            .collect();
        let rest = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        let system = (!system.is_empty()).then(|| system.join("\n\n"));
        (system, rest)
    }
}

/// 单轮回复：规范 assistant 消息 + 用量
#[derive(Debug, Clone)]
pub struct TurnResponse {
    pub message: Message,
    pub usage: Usage,
    pub finish_reason: Option<String>,
}

/// 供应商适配器
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn default_model(&self) -> &str;

    /// 发送一轮；供应商错误原样向上传播，不在此层重试
    async fn send_turn(&self, request: &TurnRequest) -> Result<TurnResponse, GatewayError>;
}

/// 供应商失败日志：带上下文，不含密钥
pub(crate) fn log_provider_error(kind: ProviderKind, model: &str, endpoint: &str, message_count: usize, err: &GatewayError) {
    tracing::error!(
        provider = %kind,
        model,
        endpoint,
        message_count,
        error = %err,
        "Provider request failed"
    );
}

/// 没有任何文本、推理或工具调用的回复视为不完整
pub(crate) fn ensure_not_empty(kind: ProviderKind, response: TurnResponse) -> Result<TurnResponse, GatewayError> {
    if response.message.is_effectively_empty() && response.message.reasoning().is_none() {
        return Err(GatewayError::malformed(
            kind,
            format!(
                "empty completion (finish_reason: {})",
                response.finish_reason.as_deref().unwrap_or("none")
            ),
            Some(&response.usage),
        ));
    }
    Ok(response)
}
