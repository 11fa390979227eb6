//! 会话编排端到端测试：脚本化适配器 + 进程内历史 + 内置工具

use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use hive::config::{ConversationSection, ForceFinalRule};
use hive::core::{KeyStrategy, LimitKind, TurnEvent};
use hive::llm::{ScriptedAdapter, ToolChoice};
use hive::memory::InMemoryHistory;
use hive::tools::ToolRegistry;
use hive::{ContentPart, GatewayBuilder, GatewayError, Message, ProviderKind, Role, SendOptions, ToolCall, Usage};

fn options(conversation_id: &str) -> SendOptions {
    SendOptions {
        conversation_id: Some(conversation_id.to_string()),
        ..Default::default()
    }
}

fn builder(adapter: Arc<ScriptedAdapter>, history: Arc<InMemoryHistory>) -> GatewayBuilder {
    GatewayBuilder::new(adapter)
        .history(history)
        .tools(ToolRegistry::with_builtins())
        .api_keys("test-key", KeyStrategy::First)
}

#[tokio::test]
async fn test_plain_reply_without_tools() {
    let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::OpenAi).reply_text("Hello there!"));
    let history = Arc::new(InMemoryHistory::new());
    let gateway = GatewayBuilder::new(adapter.clone())
        .history(history.clone())
        .api_keys("test-key", KeyStrategy::First)
        .build()
        .unwrap();

    let response = gateway.send_message(Some(Message::user("hi")), options("c1")).await.unwrap();

    assert_eq!(response.contents, vec![ContentPart::text("Hello there!")]);
    assert!(response.tool_call_logs.is_empty());
    assert!(response.limit_reached.is_none());
    assert_eq!(response.usage.total_tokens, 15);

    let saved = history.messages("c1").await;
    let roles: Vec<Role> = saved.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(saved[1].parent_id.as_deref(), Some(saved[0].id.as_str()));
    assert_eq!(response.id, saved[1].id);

    let requests = adapter.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].tools.is_empty());
    assert_eq!(requests[0].api_key, "test-key");
}

#[tokio::test]
async fn test_plain_text_tool_calls_are_recovered_and_executed() {
    let payload = r#"{"tool_calls":[{"function":{"name":"get_time","arguments":"{}"}}]}"#;
    let adapter = Arc::new(
        ScriptedAdapter::new(ProviderKind::OpenAi)
            .reply_text(payload)
            .reply_text("It is almost noon."),
    );
    let history = Arc::new(InMemoryHistory::new());
    let gateway = builder(adapter.clone(), history.clone()).build().unwrap();

    let response = gateway
        .send_message(Some(Message::user("what time is it?")), options("c2"))
        .await
        .unwrap();

    assert_eq!(response.text(), "It is almost noon.");
    assert!(!response.text().contains('{'));
    assert_eq!(response.tool_call_logs.len(), 1);
    assert_eq!(response.tool_call_logs[0].name, "get_time");
    assert!(!response.tool_call_logs[0].is_error);
    assert_eq!(response.usage.total_tokens, 30);

    let saved = history.messages("c2").await;
    let roles: Vec<Role> = saved.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);

    let call = &saved[1].tool_calls[0];
    assert_eq!(call.name(), "get_time");
    assert_eq!(saved[1].text(), "");
    let result = saved[2].tool_results_iter().next().unwrap();
    assert_eq!(result.tool_call_id, call.id);
    assert!(result.content.contains("datetime"));

    // 第二轮请求带上了工具结果
    let requests = adapter.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.last().unwrap().role, Role::Tool);
    assert_eq!(requests[0].tools.len(), 2);
}

#[tokio::test]
async fn test_repeated_identical_calls_hit_limit() {
    let looping = Message::assistant_with_tool_calls(
        "",
        vec![ToolCall::new("call_loop", "echo", r#"{"text":"again"}"#)],
    );
    let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::OpenAi).repeat(looping));
    let history = Arc::new(InMemoryHistory::new());
    let gateway = builder(adapter.clone(), history).build().unwrap();

    let response = gateway.send_message(Some(Message::user("loop")), options("c3")).await.unwrap();

    assert_eq!(response.limit_reached, Some(LimitKind::IdenticalCalls(4)));
    assert_eq!(adapter.requests().len(), 5);
    assert_eq!(response.tool_call_logs.len(), 4);
    assert!(response.text().contains("Stopped"));
}

#[tokio::test]
async fn test_force_final_answer_after_threshold() {
    let call = |text: &str| {
        Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new(ToolCall::generate_id(), "echo", json!({"text": text}).to_string())],
        )
    };
    let adapter = Arc::new(
        ScriptedAdapter::new(ProviderKind::Gemini)
            .with_model("gemini-2.0-flash")
            .reply(call("a"))
            .reply(call("b"))
            .reply_text("done"),
    );
    let conversation = ConversationSection {
        force_final_overrides: vec![ForceFinalRule {
            model_pattern: "gemini".into(),
            rounds: 2,
        }],
        ..ConversationSection::default()
    };
    let gateway = builder(adapter.clone(), Arc::new(InMemoryHistory::new()))
        .conversation(conversation)
        .build()
        .unwrap();

    let response = gateway.send_message(Some(Message::user("go")), options("c4")).await.unwrap();
    assert_eq!(response.text(), "done");

    let choices: Vec<ToolChoice> = adapter.requests().into_iter().map(|r| r.tool_choice).collect();
    assert_eq!(choices, vec![ToolChoice::Auto, ToolChoice::Auto, ToolChoice::None]);
}

#[tokio::test]
async fn test_same_turn_duplicates_collapse() {
    let duplicated = Message::assistant_with_tool_calls(
        "",
        vec![
            ToolCall::new("call_a", "echo", r#"{"text":"x","n":1}"#),
            ToolCall::new("call_b", "echo", r#"{"n":1,"text":"x"}"#),
        ],
    );
    let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::Claude).reply(duplicated).reply_text("ok"));
    let history = Arc::new(InMemoryHistory::new());
    let gateway = builder(adapter, history.clone()).build().unwrap();

    let response = gateway.send_message(Some(Message::user("dup")), options("c5")).await.unwrap();
    assert_eq!(response.tool_call_logs.len(), 1);

    let saved = history.messages("c5").await;
    assert_eq!(saved[1].tool_calls.len(), 1);
    assert_eq!(saved[2].tool_results_iter().count(), 1);
    assert_eq!(saved[2].tool_results_iter().next().unwrap().tool_call_id, "call_a");
}

#[tokio::test]
async fn test_history_continues_across_calls() {
    let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::OpenAi).reply_text("first").reply_text("second"));
    let history = Arc::new(InMemoryHistory::new());
    let gateway = builder(adapter.clone(), history.clone())
        .system_prompt("be brief")
        .build()
        .unwrap();

    gateway.send_message(Some(Message::user("one")), options("c6")).await.unwrap();
    gateway.send_message(Some(Message::user("two")), options("c6")).await.unwrap();

    let second = &adapter.requests()[1];
    let texts: Vec<String> = second.messages.iter().map(Message::text).collect();
    assert_eq!(texts, vec!["be brief", "one", "first", "two"]);
    assert_eq!(history.messages("c6").await.len(), 4);
}

#[tokio::test]
async fn test_disable_history_save_purges() {
    let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::OpenAi).reply_text("bye"));
    let history = Arc::new(InMemoryHistory::new());
    let gateway = builder(adapter, history.clone()).build().unwrap();

    let opts = SendOptions {
        disable_history_save: true,
        ..options("c7")
    };
    gateway.send_message(Some(Message::user("temp")), opts).await.unwrap();
    assert!(history.messages("c7").await.is_empty());
}

#[tokio::test]
async fn test_provider_error_propagates() {
    let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::OpenAi).fail("HTTP 500: upstream"));
    let history = Arc::new(InMemoryHistory::new());
    let gateway = builder(adapter, history.clone()).build().unwrap();

    let err = gateway.send_message(Some(Message::user("hi")), options("c8")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Provider { .. }));
    assert!(history.messages("c8").await.is_empty());
}

#[tokio::test]
async fn test_empty_message_is_not_sent() {
    let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::OpenAi).reply_text("unused"));
    let gateway = builder(adapter.clone(), Arc::new(InMemoryHistory::new())).build().unwrap();

    let err = gateway.send_message(Some(Message::user("   ")), options("c9")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Conversion(_)));
    assert!(adapter.requests().is_empty());
}

#[tokio::test]
async fn test_cancelled_before_send() {
    let adapter = Arc::new(ScriptedAdapter::new(ProviderKind::OpenAi).reply_text("unused"));
    let gateway = builder(adapter.clone(), Arc::new(InMemoryHistory::new())).build().unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let opts = SendOptions {
        cancel: Some(token),
        ..options("c10")
    };
    let err = gateway.send_message(Some(Message::user("hi")), opts).await.unwrap_err();
    assert!(matches!(err, GatewayError::Cancelled));
    assert!(adapter.requests().is_empty());
}

#[tokio::test]
async fn test_intermediate_handler_and_events() {
    let adapter = Arc::new(
        ScriptedAdapter::new(ProviderKind::OpenAi)
            .reply(Message::assistant_with_tool_calls(
                "Checking the clock.",
                vec![ToolCall::new("call_t", "get_time", "{}")],
            ))
            .reply_text("Noon."),
    );
    let seen: Arc<Mutex<Vec<(String, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let gateway = builder(adapter, Arc::new(InMemoryHistory::new())).stream(true).build().unwrap();

    let opts = SendOptions {
        on_message_with_tool_call: Some(Arc::new(move |text: &str, calls: &[ToolCall]| {
            sink.lock().unwrap().push((text.to_string(), calls.len()));
        })),
        events: Some(tx),
        ..options("c11")
    };
    let response = gateway.send_message(Some(Message::user("time?")), opts).await.unwrap();
    assert_eq!(response.text(), "Noon.");
    assert_eq!(*seen.lock().unwrap(), vec![("Checking the clock.".to_string(), 1)]);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(events.iter().any(|e| matches!(e, TurnEvent::TextDelta { text } if text == "Noon.")));
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::ToolCall { name, .. } if name == "get_time")));
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::ToolResult { id, is_error: false, .. } if id == "call_t")));
}

/// 每个带工具调用的 assistant 消息之后都紧跟覆盖全部调用的 tool 消息
fn assert_calls_answered(messages: &[Message]) {
    for (i, message) in messages.iter().enumerate() {
        if message.role != Role::Assistant || message.tool_calls.is_empty() {
            continue;
        }
        let next = messages.get(i + 1).expect("tool calls must not end the history");
        assert_eq!(next.role, Role::Tool, "message {} is followed by {:?}", i, next.role);
        let answered: Vec<&str> = next.tool_results_iter().map(|r| r.tool_call_id.as_str()).collect();
        for call in &message.tool_calls {
            assert!(answered.contains(&call.id.as_str()), "call {} has no result", call.id);
        }
    }
}

#[tokio::test]
async fn test_limit_trip_leaves_history_consistent() {
    let looping = Message::assistant_with_tool_calls("", vec![ToolCall::new("call_clock", "get_time", "{}")]);
    let mut adapter = ScriptedAdapter::new(ProviderKind::OpenAi);
    for _ in 0..5 {
        adapter = adapter.reply(looping.clone());
    }
    let adapter = Arc::new(adapter.reply_text("Fresh start."));
    let history = Arc::new(InMemoryHistory::new());
    let gateway = builder(adapter.clone(), history.clone()).build().unwrap();

    let first = gateway.send_message(Some(Message::user("time?")), options("c12")).await.unwrap();
    assert_eq!(first.limit_reached, Some(LimitKind::IdenticalCalls(4)));

    let saved = history.messages("c12").await;
    assert_calls_answered(&saved);
    let last = saved.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.tool_calls.is_empty());
    assert_eq!(first.id, last.id);
    let skipped = saved[saved.len() - 2].tool_results_iter().next().unwrap();
    assert!(skipped.content.starts_with("Not executed."));

    let second = gateway.send_message(Some(Message::user("again")), options("c12")).await.unwrap();
    assert_eq!(second.text(), "Fresh start.");

    let sent = &adapter.requests()[5].messages;
    assert_calls_answered(sent);
    let tail = &sent[sent.len() - 2];
    assert_eq!(tail.role, Role::Assistant);
    assert!(tail.tool_calls.is_empty());
    assert_eq!(sent.last().unwrap().role, Role::User);
}

#[tokio::test]
async fn test_disable_history_save_purges_on_failure() {
    let adapter = Arc::new(
        ScriptedAdapter::new(ProviderKind::OpenAi)
            .reply(Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("call_e", "echo", r#"{"text":"one"}"#)],
            ))
            .fail("HTTP 503: overloaded"),
    );
    let history = Arc::new(InMemoryHistory::new());
    let gateway = builder(adapter.clone(), history.clone()).build().unwrap();

    let opts = SendOptions {
        disable_history_save: true,
        ..options("c13")
    };
    let err = gateway.send_message(Some(Message::user("temp")), opts).await.unwrap_err();
    assert!(matches!(err, GatewayError::Provider { .. }));
    assert_eq!(adapter.requests().len(), 2);
    assert!(history.messages("c13").await.is_empty());
}

#[tokio::test]
async fn test_empty_completion_with_huge_prompt_is_flagged() {
    let adapter = Arc::new(
        ScriptedAdapter::new(ProviderKind::Claude)
            .with_usage(Usage::new(64_000, 0))
            .reply_text(""),
    );
    let history = Arc::new(InMemoryHistory::new());
    let gateway = builder(adapter, history.clone()).build().unwrap();

    let err = gateway.send_message(Some(Message::user("huge")), options("c14")).await.unwrap_err();
    match err {
        GatewayError::MalformedResponse { detail, .. } => assert!(detail.contains("context window"), "{}", detail),
        other => panic!("unexpected error: {}", other),
    }
    assert!(history.messages("c14").await.is_empty());
}
