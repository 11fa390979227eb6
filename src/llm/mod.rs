//! LLM 层：规范消息模型、转换器注册表、供应商适配器（OpenAI 兼容 / Gemini / Claude / 脚本化）与流式重建

pub mod claude;
pub mod convert;
pub mod gemini;
pub mod message;
pub mod mock;
pub mod openai;
pub mod sse;
pub mod stream;
pub mod traits;

use std::sync::Arc;

pub use claude::ClaudeAdapter;
pub use convert::{registry, ConverterEntry, ConverterRegistry, ProviderKind};
pub use gemini::GeminiAdapter;
pub use message::{ContentPart, FunctionCall, Message, Role, ToolCall, ToolChoice, ToolDefinition, ToolResult, Usage};
pub use mock::ScriptedAdapter;
pub use openai::OpenAiAdapter;
pub use stream::{StreamAccumulator, StreamDelta};
pub use traits::{ProviderAdapter, TurnRequest, TurnResponse};

use crate::media::MediaPreprocessor;

/// 按供应商创建适配器；base_url / model 为空时使用各家默认值
pub fn create_adapter(
    kind: ProviderKind,
    base_url: Option<&str>,
    model: Option<&str>,
    media: Option<MediaPreprocessor>,
) -> Arc<dyn ProviderAdapter> {
    tracing::info!(provider = %kind, model = model.unwrap_or("(default)"), "Creating provider adapter");
    match (kind, media) {
        (ProviderKind::OpenAi, Some(media)) => Arc::new(OpenAiAdapter::new(base_url, model).with_media(media)),
        (ProviderKind::OpenAi, None) => Arc::new(OpenAiAdapter::new(base_url, model)),
        (ProviderKind::Gemini, Some(media)) => Arc::new(GeminiAdapter::new(base_url, model).with_media(media)),
        (ProviderKind::Gemini, None) => Arc::new(GeminiAdapter::new(base_url, model)),
        (ProviderKind::Claude, Some(media)) => Arc::new(ClaudeAdapter::new(base_url, model).with_media(media)),
        (ProviderKind::Claude, None) => Arc::new(ClaudeAdapter::new(base_url, model)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_adapter_defaults() {
        for kind in ProviderKind::ALL {
            let adapter = create_adapter(kind, None, None, None);
            assert_eq!(adapter.kind(), kind);
            assert!(!adapter.default_model().is_empty());
        }
        let adapter = create_adapter(ProviderKind::Gemini, None, Some("gemini-1.5-pro"), None);
        assert_eq!(adapter.default_model(), "gemini-1.5-pro");
    }
}
