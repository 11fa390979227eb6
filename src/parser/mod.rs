//! 工具调用恢复解析器
//!
//! 许多模型不会老实地把工具调用放进 API 的结构化字段，而是在文本里「泄漏」一个近似形态：
//! 自定义标签、代码块里的 JSON、裸 JSON，甚至半截的 JSON。parse 按固定顺序跑一串启发式阶段，
//! 从文本中恢复出结构化调用，并返回清理后的文本。
//!
//! 阶段顺序：
//! 1. 去掉 `<think>` 等思考块（无条件）
//! 2. 显式标签：`<tools>`、`<tool_call>`、`<function_call>`、`<invoke>`（总会执行并删除匹配片段）
//! 3. 代码块中的 JSON（严格解析，失败再修复）
//! 4. 括号计数扫描：`{"tool_calls": [...]}`、调用数组、单个调用对象
//! 5. 正则兜底：转义参数、模糊 name/arguments、`func({...})` 调用表达式、仅名字的最后一搏
//!
//! 第 3 步起，前一阶段找到任意调用即停止。解析永不失败：最坏情况原样返回文本与空列表。

mod arguments;
mod cleanup;
mod fuzzy;
mod repair;
mod scan;
mod tags;

use std::collections::HashSet;

use serde_json::Value;

use crate::llm::ToolCall;

pub use arguments::{normalize_argument_value, normalize_arguments};
pub use repair::repair_json;
pub use scan::find_balanced_spans;
pub use tags::strip_thinking_tags;

/// 单次解析最多返回的调用数
pub const MAX_TOOL_CALLS: usize = 10;

/// 解析结果：清理后的文本与恢复出的调用
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub clean_text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// 各阶段产出的原始调用，参数尚未规范化
#[derive(Debug, Clone)]
pub(crate) struct RawCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

/// 阶段输出：剩余文本与本阶段找到的调用
pub(crate) struct StageOutput {
    pub text: String,
    pub calls: Vec<RawCall>,
}

type Stage = fn(&str) -> StageOutput;

/// 标签阶段，全部执行
const TAG_STAGES: &[Stage] = &[
    tags::tools_tag,
    tags::tool_call_tag,
    tags::function_call_tag,
    tags::invoke_tag,
];

/// 后续阶段，首个找到调用的阶段胜出
const FALLBACK_STAGES: &[Stage] = &[
    scan::fenced_blocks,
    scan::tool_calls_object,
    scan::call_arrays,
    scan::single_call_object,
    fuzzy::escaped_arguments,
    fuzzy::name_arguments_pairs,
    fuzzy::call_expressions,
    fuzzy::name_only,
];

/// 从模型输出中恢复工具调用
pub fn parse(text: &str) -> ParsedOutput {
    let mut current = strip_thinking_tags(text);
    let mut touched = current != text;
    let mut raw: Vec<RawCall> = Vec::new();

    for stage in TAG_STAGES {
        let out = stage(&current);
        if out.text != current {
            touched = true;
            current = out.text;
        }
        raw.extend(out.calls);
    }

    if raw.is_empty() {
        for stage in FALLBACK_STAGES {
            let out = stage(&current);
            if !out.calls.is_empty() {
                touched = true;
                current = out.text;
                raw = out.calls;
                break;
            }
        }
    }

    if !touched && raw.is_empty() {
        return ParsedOutput {
            clean_text: text.to_string(),
            tool_calls: Vec::new(),
        };
    }

    let tool_calls = finalize_calls(raw);
    let clean_text = cleanup::tidy(&current, !tool_calls.is_empty());
    ParsedOutput {
        clean_text,
        tool_calls,
    }
}

/// 判断一段文本是否仅由工具调用载荷组成（没有任何正常对话内容）
pub fn is_tool_call_payload(text: &str) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    let parsed = parse(text);
    !parsed.tool_calls.is_empty() && parsed.clean_text.trim().is_empty()
}

/// 规范化参数、按 (name, arguments) 去重、截断到 MAX_TOOL_CALLS
fn finalize_calls(raw: Vec<RawCall>) -> Vec<ToolCall> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut calls = Vec::new();

    for call in raw {
        let name = call.name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        let arguments = normalize_argument_value(&call.arguments);
        if !seen.insert((name.clone(), arguments.clone())) {
            continue;
        }
        let id = call
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(ToolCall::generate_id);
        calls.push(ToolCall::new(id, name, arguments));
    }

    if calls.len() > MAX_TOOL_CALLS {
        tracing::warn!(
            found = calls.len(),
            max = MAX_TOOL_CALLS,
            "Too many recovered tool calls, truncating"
        );
        calls.truncate(MAX_TOOL_CALLS);
    }
    calls
}
