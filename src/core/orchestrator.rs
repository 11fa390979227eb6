//! 会话编排器：多轮工具调用主循环
//!
//! 每次 send_message 是一个显式循环：
//! 组装上下文 → 适配器发送一轮 → 持久化 user / assistant → 无工具调用则返回；
//! 有工具调用则同轮去重、检查循环限制（触发时补上跳过结果与说明后返回）→ 执行工具 → 追加 tool 消息 → 下一轮。
//! 工具轮数达到模型对应阈值后，下一轮强制 tool_choice = none，促使模型给出最终答复。
//!
//! 循环状态（ToolCallTracker）只属于这一次调用，从不跨会话共享。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::ConversationSection;
use crate::core::events::{send_event, TurnEvent};
use crate::core::keys::KeyResolver;
use crate::core::state::{LimitKind, SignatureRules, ToolCallTracker};
use crate::core::GatewayError;
use crate::llm::{ContentPart, Message, ProviderAdapter, ToolCall, ToolChoice, ToolResult, TurnRequest, TurnResponse, Usage};
use crate::memory::HistoryManager;
use crate::parser;
use crate::tools::{ToolCallLog, ToolContext, ToolExecutor};

/// 中间消息回调：(清理后的中间文本, 本轮工具调用)，用于实时展示进度
pub type IntermediateHandler = Arc<dyn Fn(&str, &[ToolCall]) + Send + Sync>;

/// 单次 send_message 的选项
#[derive(Clone, Default)]
pub struct SendOptions {
    /// 缺省时生成新的会话 id
    pub conversation_id: Option<String>,
    /// 从该消息继续；缺省为会话最后一条
    pub parent_message_id: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tool_choice: Option<ToolChoice>,
    pub stream: Option<bool>,
    pub system_override: Option<String>,
    pub on_message_with_tool_call: Option<IntermediateHandler>,
    pub disable_history_read: bool,
    pub disable_history_save: bool,
    pub cancel: Option<CancellationToken>,
    pub events: Option<UnboundedSender<TurnEvent>>,
}

impl std::fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendOptions")
            .field("conversation_id", &self.conversation_id)
            .field("parent_message_id", &self.parent_message_id)
            .field("model", &self.model)
            .field("tool_choice", &self.tool_choice)
            .field("stream", &self.stream)
            .field("disable_history_read", &self.disable_history_read)
            .field("disable_history_save", &self.disable_history_save)
            .finish_non_exhaustive()
    }
}

/// send_message 的返回
#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    /// 最后一条 assistant 消息的 id
    pub id: String,
    pub conversation_id: String,
    pub model: String,
    pub contents: Vec<ContentPart>,
    /// 本次调用所有轮次的累计用量
    pub usage: Usage,
    pub tool_call_logs: Vec<ToolCallLog>,
    /// 因循环限制提前结束时为 Some
    #[serde(skip)]
    pub limit_reached: Option<LimitKind>,
}

impl GatewayResponse {
    pub fn text(&self) -> String {
        self.contents
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// 网关：适配器 + 工具执行器 + 历史 + Key 池
pub struct Gateway {
    pub(crate) adapter: Arc<dyn ProviderAdapter>,
    pub(crate) executor: Arc<ToolExecutor>,
    pub(crate) history: Arc<dyn HistoryManager>,
    pub(crate) keys: Arc<KeyResolver>,
    pub(crate) conversation: ConversationSection,
    pub(crate) signature_rules: SignatureRules,
    pub(crate) temperature: Option<f32>,
    pub(crate) max_tokens: Option<u32>,
    pub(crate) stream: bool,
    pub(crate) request_timeout: Duration,
}

/// 一次 send_message 的进行中状态
struct Turn {
    conversation_id: String,
    model: String,
    parent_id: Option<String>,
    context: Vec<Message>,
    usage: Usage,
    logs: Vec<ToolCallLog>,
    tracker: Option<ToolCallTracker>,
    tool_rounds: usize,
    force_final: bool,
}

impl Gateway {
    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    pub fn history(&self) -> &Arc<dyn HistoryManager> {
        &self.history
    }

    /// 发送一条消息并驱动工具调用循环直到得到最终答复或触发限制
    ///
    /// disable_history_save 时，无论成功、出错还是取消，结束后都会清除该会话。
    pub async fn send_message(&self, message: Option<Message>, options: SendOptions) -> Result<GatewayResponse, GatewayError> {
        let conversation_id = options
            .conversation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let result = self.run(conversation_id.clone(), message, &options).await;
        if !options.disable_history_save {
            return result;
        }

        let purged = self.history.delete_conversation(&conversation_id).await;
        match (result, purged) {
            (Ok(response), Ok(())) => Ok(response),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), purged) => {
                if let Err(purge_err) = purged {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %purge_err,
                        "Failed to purge unsaved conversation after error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn run(&self, conversation_id: String, message: Option<Message>, options: &SendOptions) -> Result<GatewayResponse, GatewayError> {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.adapter.default_model().to_string());

        let context = if options.disable_history_read {
            Vec::new()
        } else {
            self.history
                .get_history(options.parent_message_id.as_deref(), &conversation_id)
                .await?
        };
        let parent_id = options
            .parent_message_id
            .clone()
            .or_else(|| context.last().map(|m| m.id.clone()));

        let mut pending_user = message.filter(|m| {
            let empty = m.is_effectively_empty();
            if empty {
                tracing::debug!(conversation_id = %conversation_id, "Skipping effectively empty user message");
            }
            !empty
        });

        let mut turn = Turn {
            conversation_id,
            model,
            parent_id,
            context,
            usage: Usage::default(),
            logs: Vec::new(),
            tracker: None,
            tool_rounds: 0,
            force_final: false,
        };
        let force_final_rounds = self.conversation.force_final_rounds(&turn.model);

        loop {
            if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                tracing::info!(conversation_id = %turn.conversation_id, "Conversation cancelled");
                return Err(GatewayError::Cancelled);
            }

            let request = self.build_request(&turn, pending_user.as_ref(), options)?;
            let response = self.send_turn(&request, options.cancel.as_ref()).await?;
            turn.usage.add(&response.usage);

            if let Some(user) = pending_user.take() {
                let user = user.with_parent(turn.parent_id.clone());
                self.persist(&mut turn, user).await?;
            }

            let mut assistant = response.message.with_parent(turn.parent_id.clone());
            if !assistant.tool_calls.is_empty() {
                let calls = std::mem::take(&mut assistant.tool_calls);
                assistant.tool_calls = self.signature_rules.dedup_same_turn(calls);
            }
            self.persist(&mut turn, persisted_form(&assistant)).await?;

            if assistant.tool_calls.is_empty() {
                turn.tracker = None;
                let contents = final_contents(&assistant);
                return Ok(self.finish(turn, assistant.id, contents, None));
            }

            let limits = self.conversation.limits();
            let tracker = turn.tracker.get_or_insert_with(|| ToolCallTracker::new(limits));
            if let Some(limit) = tracker.record_round(&assistant.tool_calls) {
                turn.tracker = None;
                let closing = self.close_limited_round(&mut turn, &assistant, &limit).await?;
                let text = assistant.text();
                let text = if text.trim().is_empty() { limit.message() } else { text };
                return Ok(self.finish(turn, closing, vec![ContentPart::text(text)], Some(limit)));
            }

            if let Some(handler) = &options.on_message_with_tool_call {
                handler(&assistant.text(), &assistant.tool_calls);
            }
            self.run_tools(&mut turn, &assistant, options).await?;

            turn.tool_rounds += 1;
            if !turn.force_final && turn.tool_rounds >= force_final_rounds {
                tracing::info!(
                    model = %turn.model,
                    rounds = turn.tool_rounds,
                    "Tool round threshold reached, forcing a final answer"
                );
                turn.force_final = true;
            }
        }
    }

    fn build_request(&self, turn: &Turn, pending_user: Option<&Message>, options: &SendOptions) -> Result<TurnRequest, GatewayError> {
        let system = options
            .system_override
            .clone()
            .or_else(|| self.conversation.system_prompt.clone())
            .filter(|s| !s.trim().is_empty());

        let mut messages = Vec::with_capacity(turn.context.len() + 2);
        if let Some(system) = system {
            messages.push(Message::system(system));
        }
        messages.extend(turn.context.iter().cloned());
        if let Some(user) = pending_user {
            messages.push(user.clone());
        }
        if messages.iter().all(|m| m.role == crate::llm::Role::System) {
            return Err(GatewayError::Conversion("no messages to send".to_string()));
        }

        let tool_choice = if turn.force_final {
            ToolChoice::None
        } else {
            options.tool_choice.clone().unwrap_or_default()
        };

        Ok(TurnRequest {
            messages,
            tools: self.executor.registry().definitions(),
            model: turn.model.clone(),
            api_key: self.keys.resolve()?,
            temperature: options.temperature.or(self.temperature),
            max_tokens: options.max_tokens.or(self.max_tokens),
            tool_choice,
            stream: options.stream.unwrap_or(self.stream),
            events: options.events.clone(),
        })
    }

    async fn send_turn(&self, request: &TurnRequest, cancel: Option<&CancellationToken>) -> Result<TurnResponse, GatewayError> {
        let send = async {
            match tokio::time::timeout(self.request_timeout, self.adapter.send_turn(request)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Network(format!(
                    "request timed out after {}s",
                    self.request_timeout.as_secs()
                ))),
            }
        };
        match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(GatewayError::Cancelled),
                result = send => result,
            },
            None => send.await,
        }
    }

    async fn run_tools(&self, turn: &mut Turn, assistant: &Message, options: &SendOptions) -> Result<(), GatewayError> {
        for call in &assistant.tool_calls {
            send_event(
                options.events.as_ref(),
                TurnEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name().to_string(),
                    arguments: call.arguments_value(),
                },
            );
        }

        let ctx = ToolContext {
            conversation_id: turn.conversation_id.clone(),
            model: turn.model.clone(),
            provider: Some(self.adapter.kind()),
        };
        let batch = self.executor.execute_batch(&assistant.tool_calls, &ctx).await;

        for (result, log) in batch.results.iter().zip(&batch.logs) {
            send_event(
                options.events.as_ref(),
                TurnEvent::ToolResult {
                    id: result.tool_call_id.clone(),
                    name: result.name.clone(),
                    preview: log.result.clone(),
                    is_error: log.is_error,
                },
            );
        }
        turn.logs.extend(batch.logs);

        let tool_message = Message::tool_results(batch.results).with_parent(turn.parent_id.clone());
        self.persist(turn, tool_message).await
    }

    /// 保存消息并推进父指针
    async fn persist(&self, turn: &mut Turn, message: Message) -> Result<(), GatewayError> {
        self.history.save_history(&message, &turn.conversation_id).await?;
        turn.parent_id = Some(message.id.clone());
        turn.context.push(message);
        Ok(())
    }

    /// 触发限制的一轮：为未执行的调用补上跳过结果，再追加一条说明，保证历史中每个工具调用都有对应结果
    async fn close_limited_round(&self, turn: &mut Turn, assistant: &Message, limit: &LimitKind) -> Result<String, GatewayError> {
        let skipped = assistant
            .tool_calls
            .iter()
            .map(|call| ToolResult {
                tool_call_id: call.id.clone(),
                content: format!("Not executed. {}", limit.message()),
                name: call.name().to_string(),
            })
            .collect();
        let tool_message = Message::tool_results(skipped).with_parent(turn.parent_id.clone());
        self.persist(turn, tool_message).await?;

        let notice = Message::assistant(limit.message()).with_parent(turn.parent_id.clone());
        let id = notice.id.clone();
        self.persist(turn, notice).await?;
        Ok(id)
    }

    fn finish(&self, turn: Turn, id: String, contents: Vec<ContentPart>, limit_reached: Option<LimitKind>) -> GatewayResponse {
        tracing::debug!(
            conversation_id = %turn.conversation_id,
            tool_rounds = turn.tool_rounds,
            total_tokens = turn.usage.total_tokens,
            limited = limit_reached.is_some(),
            "Conversation turn finished"
        );
        GatewayResponse {
            id,
            conversation_id: turn.conversation_id,
            model: turn.model,
            contents,
            usage: turn.usage,
            tool_call_logs: turn.logs,
            limit_reached,
        }
    }
}

/// 持久化形式：只是工具调用 JSON 的文本属于实现细节，不写入历史
fn persisted_form(message: &Message) -> Message {
    let mut persisted = message.clone();
    if !persisted.tool_calls.is_empty() && parser::is_tool_call_payload(&persisted.text()) {
        persisted.replace_text("");
    }
    persisted
}

/// 返回给调用方的内容：去掉工具结果片段
fn final_contents(message: &Message) -> Vec<ContentPart> {
    message
        .content
        .iter()
        .filter(|p| !matches!(p, ContentPart::ToolResult(_)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCall;

    #[test]
    fn test_persisted_form_drops_payload_text() {
        let call = ToolCall::new("call_1", "get_time", "{}");
        let msg = Message::assistant_with_tool_calls(
            r#"{"tool_calls":[{"function":{"name":"get_time","arguments":"{}"}}]}"#,
            vec![call.clone()],
        );
        assert_eq!(persisted_form(&msg).text(), "");
        assert_eq!(persisted_form(&msg).tool_calls.len(), 1);

        let prose = Message::assistant_with_tool_calls("Let me check the time.", vec![call]);
        assert_eq!(persisted_form(&prose).text(), "Let me check the time.");
    }

    #[test]
    fn test_final_contents_keeps_reasoning() {
        let mut msg = Message::assistant("answer");
        msg.content.insert(0, ContentPart::reasoning("why"));
        assert_eq!(final_contents(&msg).len(), 2);
    }
}
