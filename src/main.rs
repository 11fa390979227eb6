//! Hive 命令行入口：加载配置、按配置的供应商构建网关、发送一条消息并打印答复与工具日志
//!
//! 用法：`hive "<prompt>"`；可用 `HIVE_CONFIG=<path>` 指定额外的配置文件。

use std::path::PathBuf;

use anyhow::Context;
use hive::config::load_config;
use hive::core::TurnEvent;
use hive::{GatewayBuilder, Message, SendOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("usage: hive \"<prompt>\"");
    }

    let config_path = std::env::var("HIVE_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let gateway = GatewayBuilder::from_config(&cfg)
        .context("Failed to set up provider")?
        .build()
        .context("Failed to build gateway")?;

    // 流式模式下边收边打印
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        use std::io::Write;
        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::TextDelta { text } => {
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
                TurnEvent::ToolCall { name, arguments, .. } => eprintln!("\n[tool] {} {}", name, arguments),
                _ => {}
            }
        }
    });

    let options = SendOptions {
        events: Some(tx),
        ..Default::default()
    };
    let response = gateway
        .send_message(Some(Message::user(prompt)), options)
        .await
        .context("Conversation failed")?;
    let _ = printer.await;

    if !cfg.llm.stream {
        println!("{}", response.text());
    } else {
        println!();
    }
    for log in &response.tool_call_logs {
        eprintln!(
            "[tool log] {} ({} ms{}) {}",
            log.name,
            log.duration_ms,
            if log.is_error { ", error" } else { "" },
            log.result
        );
    }
    eprintln!(
        "[usage] prompt={} completion={} total={}",
        response.usage.prompt_tokens, response.usage.completion_tokens, response.usage.total_tokens
    );
    Ok(())
}
