//! 流式回复重建
//!
//! 各适配器把供应商的增量块解码为 StreamDelta，StreamAccumulator 负责累积：
//! 文本、推理通道、按 index 分组的工具调用片段（名字与参数逐段拼接，而不是覆盖）、用量与结束原因。
//! 结束后统一经过 finalize_assistant：拆出内联 `<think>`，再用恢复解析器兜底提取泄漏的工具调用。

use std::collections::BTreeMap;

use tokio::sync::mpsc::UnboundedSender;

use crate::core::events::{send_event, TurnEvent};
use crate::llm::{ContentPart, Message, Role, ToolCall, Usage};
use crate::parser::{self, normalize_arguments};

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// 供应商无关的单个增量
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    Reasoning(String),
    ToolCall {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Usage(Usage),
    Finish(String),
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// 增量累积器；每收到一个增量就向事件通道转发一份
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    reasoning: String,
    calls: BTreeMap<usize, PartialCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    events: Option<UnboundedSender<TurnEvent>>,
}

/// 重建结果
#[derive(Debug, Clone)]
pub struct Reconstructed {
    pub message: Message,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

impl StreamAccumulator {
    pub fn new(events: Option<UnboundedSender<TurnEvent>>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn push(&mut self, delta: StreamDelta) {
        match delta {
            StreamDelta::Text(text) => {
                if text.is_empty() {
                    return;
                }
                self.text.push_str(&text);
                send_event(self.events.as_ref(), TurnEvent::TextDelta { text });
            }
            StreamDelta::Reasoning(text) => {
                if text.is_empty() {
                    return;
                }
                self.reasoning.push_str(&text);
                send_event(self.events.as_ref(), TurnEvent::ReasoningDelta { text });
            }
            StreamDelta::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                let call = self.calls.entry(index).or_default();
                if let Some(id) = id.filter(|id| !id.is_empty()) {
                    call.id = id;
                }
                if let Some(fragment) = name.as_deref().filter(|n| !n.is_empty()) {
                    // 部分兼容端点每个块都重发完整名字
                    if call.name != fragment {
                        call.name.push_str(fragment);
                    }
                }
                call.arguments.push_str(&arguments);
                send_event(
                    self.events.as_ref(),
                    TurnEvent::ToolCallDelta {
                        index,
                        name,
                        arguments,
                    },
                );
            }
            StreamDelta::Usage(usage) => self.usage = Some(usage),
            StreamDelta::Finish(reason) => self.finish_reason = Some(reason),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// 合成最终 assistant 消息
    pub fn finish(self) -> Reconstructed {
        let mut content = Vec::new();
        if !self.reasoning.is_empty() {
            content.push(ContentPart::reasoning(self.reasoning));
        }
        if !self.text.is_empty() {
            content.push(ContentPart::text(self.text));
        }

        let tool_calls = self
            .calls
            .into_values()
            .filter(|c| !c.name.trim().is_empty())
            .map(|c| {
                let id = if c.id.is_empty() { ToolCall::generate_id() } else { c.id };
                ToolCall::new(id, c.name.trim(), normalize_arguments(&c.arguments))
            })
            .collect();

        let message = Message {
            tool_calls,
            ..Message::new(Role::Assistant, content)
        };
        send_event(
            self.events.as_ref(),
            TurnEvent::Finished {
                finish_reason: self.finish_reason.clone(),
                usage: self.usage.clone(),
            },
        );
        Reconstructed {
            message: finalize_assistant(message),
            usage: self.usage,
            finish_reason: self.finish_reason,
        }
    }
}

/// 拆分内联思考：返回 (推理内容, 剩余文本)
///
/// 处理三种情况：完整的 `<think>…</think>`；只有闭合标签（开头被截断，之前的都算推理）；
/// 只有开始标签（结尾被截断，之后的都算推理）。
pub fn split_inline_think(text: &str) -> (Option<String>, String) {
    let open = text.find(THINK_OPEN);
    let close = text.find(THINK_CLOSE);

    let (reasoning, rest) = match (open, close) {
        (Some(o), Some(c)) if o < c => {
            let reasoning = &text[o + THINK_OPEN.len()..c];
            let rest = format!("{}{}", &text[..o], &text[c + THINK_CLOSE.len()..]);
            (reasoning.to_string(), rest)
        }
        (_, Some(c)) => (
            text[..c].replace(THINK_OPEN, ""),
            text[c + THINK_CLOSE.len()..].to_string(),
        ),
        (Some(o), None) => (text[o + THINK_OPEN.len()..].to_string(), text[..o].to_string()),
        (None, None) => return (None, text.to_string()),
    };

    let reasoning = reasoning.trim();
    let reasoning = (!reasoning.is_empty()).then(|| reasoning.to_string());
    (reasoning, rest.trim().to_string())
}

/// 规范化 assistant 消息：没有原生推理时拆出内联思考；没有原生工具调用时跑恢复解析器
pub fn finalize_assistant(mut message: Message) -> Message {
    if message.role != Role::Assistant {
        return message;
    }

    let mut text = message.text();
    if message.reasoning().is_none() {
        let (reasoning, rest) = split_inline_think(&text);
        if let Some(reasoning) = reasoning {
            message.content.insert(0, ContentPart::reasoning(reasoning));
            text = rest;
        }
    }

    if message.tool_calls.is_empty() {
        let parsed = parser::parse(&text);
        message.tool_calls = parsed.tool_calls;
        text = parsed.clean_text;
    }

    if text != message.text() {
        message.replace_text(&text);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_delta(index: usize, id: Option<&str>, name: Option<&str>, args: &str) -> StreamDelta {
        StreamDelta::ToolCall {
            index,
            id: id.map(String::from),
            name: name.map(String::from),
            arguments: args.to_string(),
        }
    }

    #[test]
    fn test_split_complete_tag() {
        let (r, rest) = split_inline_think("<think>plan</think>answer");
        assert_eq!(r.as_deref(), Some("plan"));
        assert_eq!(rest, "answer");
    }

    #[test]
    fn test_split_closing_only() {
        let (r, rest) = split_inline_think("half a thought</think>\nfinal");
        assert_eq!(r.as_deref(), Some("half a thought"));
        assert_eq!(rest, "final");
    }

    #[test]
    fn test_split_opening_only() {
        let (r, rest) = split_inline_think("prefix <think>still going");
        assert_eq!(r.as_deref(), Some("still going"));
        assert_eq!(rest, "prefix");
    }

    #[test]
    fn test_split_no_tags() {
        assert_eq!(split_inline_think("plain"), (None, "plain".to_string()));
    }

    #[test]
    fn test_tool_call_fragments_are_concatenated() {
        let mut acc = StreamAccumulator::new(None);
        acc.push(call_delta(0, Some("call_a"), Some("get_weather"), ""));
        acc.push(call_delta(0, None, None, "{\"ci"));
        acc.push(call_delta(0, None, None, "ty\":\"Paris\"}"));
        acc.push(call_delta(1, Some("call_b"), Some("get_time"), "{}"));
        acc.push(StreamDelta::Finish("tool_calls".into()));
        assert!(acc.is_finished());

        let out = acc.finish();
        let calls = &out.message.tool_calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].function.arguments, r#"{"city":"Paris"}"#);
        assert_eq!(calls[1].function.name, "get_time");
        assert_eq!(out.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_repeated_full_name_not_duplicated() {
        let mut acc = StreamAccumulator::new(None);
        acc.push(call_delta(0, Some("c"), Some("echo"), "{\"text\":"));
        acc.push(call_delta(0, None, Some("echo"), "\"hi\"}"));
        let out = acc.finish();
        assert_eq!(out.message.tool_calls[0].function.name, "echo");
    }

    #[test]
    fn test_inline_think_and_usage() {
        let mut acc = StreamAccumulator::new(None);
        acc.push(StreamDelta::Text("<think>hm".into()));
        acc.push(StreamDelta::Text("m</think>The answer".into()));
        acc.push(StreamDelta::Usage(Usage::new(10, 3)));
        let out = acc.finish();
        assert_eq!(out.message.reasoning().as_deref(), Some("hmm"));
        assert_eq!(out.message.text(), "The answer");
        assert_eq!(out.usage, Some(Usage::new(10, 3)));
    }

    #[test]
    fn test_native_reasoning_wins() {
        let mut acc = StreamAccumulator::new(None);
        acc.push(StreamDelta::Reasoning("native".into()));
        acc.push(StreamDelta::Text("ok".into()));
        let out = acc.finish();
        assert_eq!(out.message.reasoning().as_deref(), Some("native"));
        assert_eq!(out.message.text(), "ok");
    }

    #[test]
    fn test_leaked_tool_call_recovered() {
        let mut acc = StreamAccumulator::new(None);
        acc.push(StreamDelta::Text("Sure. <tool_call>{\"name\":\"get_time\",".into()));
        acc.push(StreamDelta::Text("\"arguments\":{}}</tool_call>".into()));
        let out = acc.finish();
        assert_eq!(out.message.tool_calls.len(), 1);
        assert_eq!(out.message.text(), "Sure.");
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut acc = StreamAccumulator::new(Some(tx));
        acc.push(StreamDelta::Text("hi".into()));
        let _ = acc.finish();
        assert_eq!(rx.recv().await, Some(TurnEvent::TextDelta { text: "hi".into() }));
        assert!(matches!(rx.recv().await, Some(TurnEvent::Finished { .. })));
    }

    #[test]
    fn test_finalize_native_calls_skip_parser() {
        let msg = Message {
            tool_calls: vec![ToolCall::new("c1", "f", "{}")],
            ..Message::assistant(r#"{"tool_calls":[{"function":{"name":"g","arguments":"{}"}}]}"#)
        };
        let out = finalize_assistant(msg.clone());
        assert_eq!(out.tool_calls, msg.tool_calls);
        assert_eq!(out.text(), msg.text());
    }
}
