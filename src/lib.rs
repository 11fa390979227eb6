//! Hive - Rust 多供应商 LLM 网关
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话编排循环、循环限制、Key 解析、错误与事件
//! - **llm**: 规范消息模型、转换器注册表、供应商适配器（OpenAI 兼容 / Gemini / Claude）、流式重建
//! - **media**: 远程媒体内联为 base64
//! - **memory**: 对话历史（进程内 / 文件）
//! - **parser**: 工具调用恢复解析
//! - **tools**: 工具注册表、批量执行调度与内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod media;
pub mod memory;
pub mod observability;
pub mod parser;
pub mod tools;

pub use crate::core::{Gateway, GatewayBuilder, GatewayError, GatewayResponse, SendOptions};
pub use crate::llm::{ContentPart, Message, ProviderKind, Role, ToolCall, Usage};
