//! 网关错误类型
//!
//! 解析与媒体预处理失败在模块内部吸收（fail-soft），不会出现在这里；
//! 供应商调用、持久化、配置等错误通过 GatewayError 一路传播给调用方。

use thiserror::Error;

use crate::llm::{ProviderKind, Usage};

/// 空回复且 prompt 很大时，推断为上下文超限
const PROMPT_TOO_LARGE_TOKENS: u64 = 32_000;

/// 网关运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("{provider} API error: {message}")]
    Provider {
        provider: ProviderKind,
        message: String,
    },

    #[error("{provider} returned a malformed response: {detail}")]
    MalformedResponse {
        provider: ProviderKind,
        detail: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("No API key configured")]
    NoApiKey,

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("History error: {0}")]
    History(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,
}

impl GatewayError {
    /// 供应商返回了不完整的回复；若用量呈现「prompt 很大、completion 为 0」，附加上下文超限提示
    pub fn malformed(provider: ProviderKind, detail: impl Into<String>, usage: Option<&Usage>) -> Self {
        let mut detail = detail.into();
        if let Some(hint) = usage.and_then(prompt_too_large_hint) {
            detail = format!("{} ({})", detail, hint);
        }
        GatewayError::MalformedResponse { provider, detail }
    }
}

/// 「prompt 过大」启发式：prompt token 很多且没有任何 completion
pub fn prompt_too_large_hint(usage: &Usage) -> Option<&'static str> {
    if usage.prompt_tokens >= PROMPT_TOO_LARGE_TOKENS && usage.completion_tokens == 0 {
        Some("prompt may exceed the model's context window")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_too_large_hint() {
        assert!(prompt_too_large_hint(&Usage::new(40_000, 0)).is_some());
        assert!(prompt_too_large_hint(&Usage::new(40_000, 12)).is_none());
        assert!(prompt_too_large_hint(&Usage::new(100, 0)).is_none());
    }

    #[test]
    fn test_malformed_attaches_hint() {
        let err = GatewayError::malformed(
            ProviderKind::OpenAi,
            "no choices",
            Some(&Usage::new(50_000, 0)),
        );
        let text = err.to_string();
        assert!(text.contains("no choices"));
        assert!(text.contains("context window"));

        let err = GatewayError::malformed(ProviderKind::Gemini, "no candidates", None);
        assert!(!err.to_string().contains("context window"));
    }
}
