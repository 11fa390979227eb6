//! 工具调用循环状态
//!
//! 每次顶层 send_message 持有一个 ToolCallTracker，在循环的各轮之间传递，从不跨会话共享。
//! 两种签名：精确签名（名称 + 规范化参数 JSON，键排序）用于循环检测；
//! 简化签名（按工具语义只取寻址字段、或归一化 shell 命令）用于同轮去重。

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::llm::ToolCall;

/// 循环限制阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    pub max_consecutive_rounds: usize,
    pub max_consecutive_identical: usize,
    pub max_total_calls: usize,
    pub max_signature_repeats: usize,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_consecutive_rounds: 10,
            max_consecutive_identical: 4,
            max_total_calls: 25,
            max_signature_repeats: 5,
        }
    }
}

/// 触发的限制种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    ConsecutiveRounds(usize),
    IdenticalCalls(usize),
    TotalCalls(usize),
    SignatureRepeats(usize),
}

impl LimitKind {
    /// 返回给用户的说明文本
    pub fn message(&self) -> String {
        match self {
            LimitKind::ConsecutiveRounds(n) => {
                format!("Stopped: the model kept calling tools for more than {} consecutive rounds.", n)
            }
            LimitKind::IdenticalCalls(n) => {
                format!("Stopped: the model repeated the same tool call more than {} times in a row.", n)
            }
            LimitKind::TotalCalls(n) => format!("Stopped: more than {} tool calls in one conversation turn.", n),
            LimitKind::SignatureRepeats(n) => {
                format!("Stopped: one tool call was repeated more than {} times (possible loop).", n)
            }
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// 单次顶层调用内的计数器
#[derive(Debug, Clone, Default)]
pub struct ToolCallTracker {
    limits: LoopLimits,
    consecutive_rounds: usize,
    consecutive_identical: usize,
    total_calls: usize,
    last_signature: Option<String>,
    signature_counts: HashMap<String, usize>,
}

impl ToolCallTracker {
    pub fn new(limits: LoopLimits) -> Self {
        Self {
            limits,
            ..Default::default()
        }
    }

    pub fn rounds(&self) -> usize {
        self.consecutive_rounds
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls
    }

    /// 记录一轮工具调用并检查限制；依次检查：连续相同、连续轮数、总次数、单签名重复
    pub fn record_round(&mut self, calls: &[ToolCall]) -> Option<LimitKind> {
        let signatures: Vec<String> = calls.iter().map(exact_signature).collect();
        let round_signature = signatures.join(";");

        if self.last_signature.as_deref() == Some(round_signature.as_str()) {
            self.consecutive_identical += 1;
        } else {
            self.consecutive_identical = 1;
            self.last_signature = Some(round_signature);
        }
        self.consecutive_rounds += 1;
        self.total_calls += calls.len();
        let mut max_repeat = 0;
        for signature in signatures {
            let count = self.signature_counts.entry(signature).or_insert(0);
            *count += 1;
            max_repeat = max_repeat.max(*count);
        }

        let limits = self.limits;
        let tripped = if self.consecutive_identical > limits.max_consecutive_identical {
            Some(LimitKind::IdenticalCalls(limits.max_consecutive_identical))
        } else if self.consecutive_rounds > limits.max_consecutive_rounds {
            Some(LimitKind::ConsecutiveRounds(limits.max_consecutive_rounds))
        } else if self.total_calls > limits.max_total_calls {
            Some(LimitKind::TotalCalls(limits.max_total_calls))
        } else if max_repeat > limits.max_signature_repeats {
            Some(LimitKind::SignatureRepeats(limits.max_signature_repeats))
        } else {
            None
        };

        if let Some(kind) = tripped {
            tracing::warn!(
                limit = ?kind,
                rounds = self.consecutive_rounds,
                identical = self.consecutive_identical,
                total = self.total_calls,
                "Tool call limit reached"
            );
        }
        tripped
    }
}

/// 简化签名规则（可配置）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignatureRules {
    /// 工具名 → 寻址字段；这些工具的简化签名只看寻址字段（例如发给谁）
    pub addressing_fields: HashMap<String, Vec<String>>,
    /// command 参数做大小写与空白归一的工具
    pub shell_tools: HashSet<String>,
}

impl Default for SignatureRules {
    fn default() -> Self {
        let addressing = [
            ("send_message", vec!["user_id", "group_id", "target"]),
            ("send_private_message", vec!["user_id"]),
            ("send_group_message", vec!["group_id"]),
            ("poke", vec!["user_id", "group_id"]),
        ];
        Self {
            addressing_fields: addressing
                .into_iter()
                .map(|(tool, fields)| (tool.to_string(), fields.into_iter().map(str::to_string).collect()))
                .collect(),
            shell_tools: ["shell", "run_command", "execute_command"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl SignatureRules {
    pub fn simplified_signature(&self, call: &ToolCall) -> String {
        let name = call.name();
        let args = call.arguments_value();

        if let Some(fields) = self.addressing_fields.get(name) {
            let address: Vec<String> = fields
                .iter()
                .filter_map(|f| args.get(f).map(|v| format!("{}={}", f, scalar_text(v))))
                .collect();
            if !address.is_empty() {
                return format!("{}|{}", name, address.join("&"));
            }
        }

        if self.shell_tools.contains(name) {
            if let Some(command) = args.get("command").and_then(Value::as_str) {
                let command = command.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
                return format!("{}|{}", name, command);
            }
        }

        format!("{}|{}", name, canonical_json(&args))
    }

    /// 同一轮内按简化签名去重，保留首次出现的调用
    pub fn dedup_same_turn(&self, calls: Vec<ToolCall>) -> Vec<ToolCall> {
        let mut seen = HashSet::new();
        let before = calls.len();
        let kept: Vec<ToolCall> = calls
            .into_iter()
            .filter(|call| seen.insert(self.simplified_signature(call)))
            .collect();
        if kept.len() < before {
            tracing::debug!(removed = before - kept.len(), "Deduplicated same-turn tool calls");
        }
        kept
    }
}

/// 精确签名：名称 + 键排序后的参数 JSON
pub fn exact_signature(call: &ToolCall) -> String {
    format!("{}|{}", call.name(), canonical_json(&call.arguments_value()))
}

/// 键排序的紧凑 JSON，与 Map 的内部顺序无关
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}
