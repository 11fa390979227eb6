//! 工具执行器
//!
//! 单次调用：在超时内执行工具，输出结构化审计日志（JSON）；未注册、失败、超时都变成结果文本而不是错误。
//!
//! 批量调用（execute_batch）按名称分组：会向终端用户发出可见消息的工具（order_sensitive）严格按原顺序串行，
//! 多条之间间隔 send_interval；其余工具同时启动、由信号量限制并发，单个任务 panic 不影响其他任务。
//! 结果数组始终与输入的 tool_calls 一一对齐。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::llm::{ToolCall, ToolResult};
use crate::tools::{ToolContext, ToolRegistry};

/// 日志中结果的最大字符数
pub const LOG_RESULT_CHARS: usize = 500;

/// 单次工具调用日志
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolCallLog {
    pub name: String,
    pub args: Value,
    pub result: String,
    pub duration_ms: u64,
    pub is_error: bool,
}

/// 一批工具调用的结果与日志，均按输入顺序排列
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub results: Vec<ToolResult>,
    pub logs: Vec<ToolCallLog>,
}

#[derive(Debug, Clone)]
struct Outcome {
    content: String,
    is_error: bool,
    duration_ms: u64,
}

/// 工具执行器：持有只读注册表与调度参数
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    order_sensitive: HashSet<String>,
    send_interval: Duration,
    max_parallel: usize,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
            order_sensitive: HashSet::new(),
            send_interval: Duration::from_millis(300),
            max_parallel: 8,
        }
    }

    pub fn with_order_sensitive<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_sensitive = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn is_order_sensitive(&self, name: &str) -> bool {
        self.order_sensitive.contains(name)
    }

    /// 执行一批调用；order_sensitive 组与并行组同时推进，全部完成后才返回
    pub async fn execute_batch(&self, calls: &[ToolCall], ctx: &ToolContext) -> BatchOutcome {
        let (serial, parallel): (Vec<(usize, &ToolCall)>, Vec<(usize, &ToolCall)>) = calls
            .iter()
            .enumerate()
            .partition(|(_, call)| self.is_order_sensitive(call.name()));

        let (serial_out, parallel_out) = tokio::join!(
            self.run_serial(&serial, ctx),
            self.run_parallel(&parallel, ctx)
        );

        let mut slots: Vec<Option<Outcome>> = vec![None; calls.len()];
        for (idx, outcome) in serial_out.into_iter().chain(parallel_out) {
            slots[idx] = Some(outcome);
        }

        let mut batch = BatchOutcome::default();
        for (call, slot) in calls.iter().zip(slots) {
            let outcome = slot.unwrap_or_else(|| Outcome {
                content: format!("Tool {} produced no result", call.name()),
                is_error: true,
                duration_ms: 0,
            });
            batch.logs.push(ToolCallLog {
                name: call.name().to_string(),
                args: call.arguments_value(),
                result: truncate_chars(&outcome.content, LOG_RESULT_CHARS),
                duration_ms: outcome.duration_ms,
                is_error: outcome.is_error,
            });
            batch.results.push(ToolResult {
                tool_call_id: call.id.clone(),
                content: outcome.content,
                name: call.name().to_string(),
            });
        }
        batch
    }

    async fn run_serial(&self, calls: &[(usize, &ToolCall)], ctx: &ToolContext) -> Vec<(usize, Outcome)> {
        let mut out = Vec::with_capacity(calls.len());
        for (position, (idx, call)) in calls.iter().enumerate() {
            if position > 0 && !self.send_interval.is_zero() {
                tokio::time::sleep(self.send_interval).await;
            }
            let outcome = run_one(&self.registry, self.timeout, call.name(), call.arguments_value(), ctx).await;
            out.push((*idx, outcome));
        }
        out
    }

    async fn run_parallel(&self, calls: &[(usize, &ToolCall)], ctx: &ToolContext) -> Vec<(usize, Outcome)> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let handles: Vec<_> = calls
            .iter()
            .map(|(idx, call)| {
                let registry = Arc::clone(&self.registry);
                let semaphore = Arc::clone(&semaphore);
                let ctx = ctx.clone();
                let limit = self.timeout;
                let name = call.name().to_string();
                let args = call.arguments_value();
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    run_one(&registry, limit, &name, args, &ctx).await
                });
                (*idx, call.name().to_string(), handle)
            })
            .collect();

        let mut out = Vec::with_capacity(handles.len());
        for (idx, name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(tool = %name, error = %err, "Tool task panicked");
                    Outcome {
                        content: format!("Error: tool {} crashed: {}", name, err),
                        is_error: true,
                        duration_ms: 0,
                    }
                }
            };
            out.push((idx, outcome));
        }
        out
    }
}

/// 执行单个工具：超时与错误都转成结果文本；输出 JSON 审计日志
async fn run_one(registry: &ToolRegistry, limit: Duration, name: &str, args: Value, ctx: &ToolContext) -> Outcome {
    let start = Instant::now();
    let args_preview = truncate_chars(&args.to_string(), 200);

    let Some(tool) = registry.get(name) else {
        tracing::warn!(tool = %name, "Model requested an unregistered tool");
        return Outcome {
            content: format!("Error: tool \"{}\" does not exist", name),
            is_error: true,
            duration_ms: 0,
        };
    };

    let result = timeout(limit, tool.execute(args, ctx)).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let (ok, outcome_label, content) = match result {
        Ok(Ok(value)) => (true, "ok", value_to_content(value)),
        Ok(Err(e)) => (false, "error", format!("Error: {}", e)),
        Err(_) => (false, "timeout", format!("Error: tool {} timed out after {}s", name, limit.as_secs())),
    };
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": name,
        "ok": ok,
        "outcome": outcome_label,
        "duration_ms": duration_ms,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");

    Outcome {
        content,
        is_error: !ok,
        duration_ms,
    }
}

fn value_to_content(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}
