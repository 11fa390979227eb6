//! 脚本化适配器（用于测试，无需 API）
//!
//! 按顺序返回预先排好的 assistant 回复，并记录收到的每个请求。回复与真实适配器一样经过
//! finalize_assistant（流式请求则经过 StreamAccumulator），因此纯文本里泄漏的工具调用同样会被恢复；
//! 空回复同样按不完整响应报错。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::GatewayError;
use crate::llm::stream::{finalize_assistant, StreamAccumulator, StreamDelta};
use crate::llm::traits::ensure_not_empty;
use crate::llm::{ContentPart, Message, ProviderAdapter, ProviderKind, TurnRequest, TurnResponse, Usage};

enum Scripted {
    Reply(Message),
    Fail(String),
}

pub struct ScriptedAdapter {
    kind: ProviderKind,
    default_model: String,
    script: Mutex<VecDeque<Scripted>>,
    repeat: Option<Message>,
    usage: Usage,
    requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedAdapter {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            default_model: "scripted".to_string(),
            script: Mutex::new(VecDeque::new()),
            repeat: None,
            usage: Usage::new(10, 5),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn reply(self, message: Message) -> Self {
        self.push(Scripted::Reply(message));
        self
    }

    pub fn reply_text(self, text: &str) -> Self {
        self.reply(Message::assistant(text))
    }

    pub fn fail(self, message: &str) -> Self {
        self.push(Scripted::Fail(message.to_string()));
        self
    }

    /// 脚本用完后一直返回这条回复
    pub fn repeat(mut self, message: Message) -> Self {
        self.repeat = Some(message);
        self
    }

    /// 已收到的请求（不含事件通道）
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn push(&self, item: Scripted) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
    }

    fn next(&self) -> Option<Scripted> {
        let popped = self.script.lock().ok().and_then(|mut s| s.pop_front());
        popped.or_else(|| self.repeat.clone().map(Scripted::Reply))
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn send_turn(&self, request: &TurnRequest) -> Result<TurnResponse, GatewayError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(TurnRequest {
                events: None,
                ..request.clone()
            });
        }

        let message = match self.next() {
            Some(Scripted::Reply(message)) => message,
            Some(Scripted::Fail(message)) => {
                return Err(GatewayError::Provider {
                    provider: self.kind,
                    message,
                })
            }
            None => {
                return Err(GatewayError::Provider {
                    provider: self.kind,
                    message: "script exhausted".to_string(),
                })
            }
        };

        if !request.stream {
            let message = Message {
                id: uuid::Uuid::new_v4().to_string(),
                ..finalize_assistant(message)
            };
            return ensure_not_empty(
                self.kind,
                TurnResponse {
                    message,
                    usage: self.usage.clone(),
                    finish_reason: Some("stop".to_string()),
                },
            );
        }

        // 流式：拆成增量喂给累积器，走与真实适配器相同的重建路径
        let mut acc = StreamAccumulator::new(request.events.clone());
        for part in &message.content {
            match part {
                ContentPart::Reasoning { text } => acc.push(StreamDelta::Reasoning(text.clone())),
                ContentPart::Text { text } => acc.push(StreamDelta::Text(text.clone())),
                _ => {}
            }
        }
        for (index, call) in message.tool_calls.iter().enumerate() {
            acc.push(StreamDelta::ToolCall {
                index,
                id: Some(call.id.clone()),
                name: Some(call.function.name.clone()),
                arguments: call.function.arguments.clone(),
            });
        }
        acc.push(StreamDelta::Usage(self.usage.clone()));
        acc.push(StreamDelta::Finish("stop".to_string()));
        let out = acc.finish();
        ensure_not_empty(
            self.kind,
            TurnResponse {
                message: out.message,
                usage: out.usage.unwrap_or_default(),
                finish_reason: out.finish_reason,
            },
        )
    }
}
