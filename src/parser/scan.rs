//! 结构化扫描阶段：代码块中的 JSON、以及用括号计数从正文中找出的裸 JSON

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::repair::repair_json;
use super::{RawCall, StageOutput};

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_\-]*[ \t]*\n?(.*?)```").unwrap());
static TOOL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][\w.\-]{0,63}$").unwrap());

const ARGUMENT_KEYS: &[&str] = &["arguments", "parameters", "args", "input"];
const ID_KEYS: &[&str] = &["id", "tool_call_id", "call_id"];

/// 找出所有以 `open` 开头的顶层括号片段，返回字节区间 [start, end)
///
/// `{}` 与 `[]` 共享同一深度计数，字符串内的括号与转义引号会被忽略；未闭合的片段丢弃。
pub fn find_balanced_spans(text: &str, open: char) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut pos = 0;
    while let Some(offset) = text[pos..].find(open) {
        let start = pos + offset;
        match balanced_end(text, start) {
            Some(end) => {
                spans.push((start, end));
                pos = end;
            }
            None => pos = start + open.len_utf8(),
        }
    }
    spans
}

/// 从 start 处的开括号开始，返回与之配对的闭括号之后的字节位置
pub(crate) fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// 把 JSON 值解释为调用：调用对象、调用数组、`{"tool_calls": [...]}`
///
/// require_args 为 true 时，对象必须带参数字段才算调用（减少把普通 JSON 误判为调用）。
pub(crate) fn calls_from_value(value: &Value, require_args: bool) -> Vec<RawCall> {
    match value {
        Value::Array(items) => items
            .iter()
            .flat_map(|item| calls_from_value(item, require_args))
            .collect(),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("tool_calls") {
                return items
                    .iter()
                    .flat_map(|item| calls_from_value(item, false))
                    .collect();
            }
            call_from_object(map, require_args).into_iter().collect()
        }
        _ => Vec::new(),
    }
}

fn call_from_object(map: &Map<String, Value>, require_args: bool) -> Option<RawCall> {
    let (name, arguments) = match map.get("function") {
        Some(Value::Object(function)) => {
            let name = function.get("name").and_then(Value::as_str)?;
            (name, first_of(function, ARGUMENT_KEYS).or_else(|| first_of(map, ARGUMENT_KEYS)))
        }
        Some(Value::String(name)) => (name.as_str(), first_of(map, ARGUMENT_KEYS)),
        _ => {
            let name = map.get("name").and_then(Value::as_str)?;
            (name, first_of(map, ARGUMENT_KEYS))
        }
    };

    let name = name.trim();
    if !TOOL_NAME.is_match(name) {
        return None;
    }
    if require_args && arguments.is_none() {
        return None;
    }

    let id = ID_KEYS
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .map(str::to_string);

    Some(RawCall {
        id,
        name: name.to_string(),
        arguments: arguments.cloned().unwrap_or(Value::Null),
    })
}

fn first_of<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| map.get(*key))
}

/// 代码块中的 JSON；只移除确实产出了调用的代码块
pub(crate) fn fenced_blocks(text: &str) -> StageOutput {
    let mut calls = Vec::new();
    let mut spans = Vec::new();

    for caps in FENCED_BLOCK.captures_iter(text) {
        let body = caps[1].trim();
        if !(body.starts_with('{') || body.starts_with('[')) {
            continue;
        }
        let Some(value) = repair_json(body) else {
            continue;
        };
        let found = calls_from_value(&value, true);
        if !found.is_empty() {
            if let Some(m) = caps.get(0) {
                spans.push((m.start(), m.end()));
            }
            calls.extend(found);
        }
    }

    StageOutput {
        text: remove_spans(text, &spans),
        calls,
    }
}

/// `{"tool_calls": [...]}` 包装对象
pub(crate) fn tool_calls_object(text: &str) -> StageOutput {
    scan_spans(text, '{', |value| match value {
        Value::Object(map) if map.contains_key("tool_calls") => calls_from_value(value, false),
        _ => Vec::new(),
    })
}

/// 调用数组：数组中每个元素都必须是带参数的调用
pub(crate) fn call_arrays(text: &str) -> StageOutput {
    scan_spans(text, '[', |value| match value {
        Value::Array(items) if !items.is_empty() => {
            let calls = calls_from_value(value, true);
            if calls.len() == items.len() {
                calls
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    })
}

/// 单个调用对象
pub(crate) fn single_call_object(text: &str) -> StageOutput {
    scan_spans(text, '{', |value| match value {
        Value::Object(map) => call_from_object(map, true).into_iter().collect(),
        _ => Vec::new(),
    })
}

fn scan_spans(text: &str, open: char, to_calls: impl Fn(&Value) -> Vec<RawCall>) -> StageOutput {
    let mut calls = Vec::new();
    let mut spans = Vec::new();

    for (start, end) in find_balanced_spans(text, open) {
        let Some(value) = repair_json(&text[start..end]) else {
            continue;
        };
        let found = to_calls(&value);
        if !found.is_empty() {
            spans.push((start, end));
            calls.extend(found);
        }
    }

    StageOutput {
        text: remove_spans(text, &spans),
        calls,
    }
}

/// 按升序且不重叠的区间删除文本片段
pub(crate) fn remove_spans(text: &str, spans: &[(usize, usize)]) -> String {
    if spans.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for &(start, end) in spans {
        if start < last {
            continue;
        }
        out.push_str(&text[last..start]);
        last = end;
    }
    out.push_str(&text[last..]);
    out
}
