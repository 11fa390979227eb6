//! 核心编排层：错误、事件、循环状态、Key 解析、主控循环与构建器

pub mod builder;
pub mod error;
pub mod events;
pub mod keys;
pub mod orchestrator;
pub mod state;

pub use builder::GatewayBuilder;
pub use error::{prompt_too_large_hint, GatewayError};
pub use events::TurnEvent;
pub use keys::{KeyResolver, KeyStrategy};
pub use orchestrator::{Gateway, GatewayResponse, IntermediateHandler, SendOptions};
pub use state::{LimitKind, LoopLimits, SignatureRules, ToolCallTracker};
