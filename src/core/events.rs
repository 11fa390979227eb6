//! 会话过程事件：流式增量、工具调用与结果、轮次结束，供前端实时展示

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::llm::Usage;

/// 单个事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 回复文本增量
    TextDelta { text: String },
    /// 推理内容增量
    ReasoningDelta { text: String },
    /// 工具调用片段（名字、参数逐段到达）
    ToolCallDelta {
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        arguments: String,
    },
    /// 即将执行的工具调用
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    ToolResult {
        id: String,
        name: String,
        preview: String,
        is_error: bool,
    },
    /// 一轮请求结束
    Finished {
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

/// 可选事件通道；接收端已关闭时静默丢弃
pub(crate) fn send_event(tx: Option<&UnboundedSender<TurnEvent>>, event: TurnEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let ev = TurnEvent::ToolResult {
            id: "c1".into(),
            name: "echo".into(),
            preview: "hi".into(),
            is_error: false,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tool_result");
        assert_eq!(v["name"], "echo");
    }

    #[tokio::test]
    async fn test_send_event_ignores_closed_channel() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        send_event(Some(&tx), TurnEvent::TextDelta { text: "x".into() });
        send_event(None, TurnEvent::TextDelta { text: "y".into() });
    }
}
