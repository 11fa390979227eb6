//! 正则兜底阶段：前面的结构化阶段都失败时才会运行

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::repair::repair_json;
use super::scan::{balanced_end, remove_spans};
use super::{RawCall, StageOutput};

static ESCAPED_ARGUMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:name|function)"\s*:\s*"([A-Za-z_][\w.\-]*)"\s*,\s*"(?:arguments|parameters)"\s*:\s*"((?:[^"\\]|\\.)*)""#)
        .unwrap()
});
static NAME_THEN_ARGUMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:name|function)"\s*:\s*"([A-Za-z_][\w.\-]*)"\s*,\s*"(?:arguments|parameters|args)"\s*:\s*"#)
        .unwrap()
});
static CALL_EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z_][\w.]*)\s*\(\s*\{").unwrap());
static NAME_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:name|function|tool_name)"\s*:\s*"([A-Za-z_][\w.\-]*)""#).unwrap()
});
static ARGUMENTS_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(?:arguments|parameters|args)"\s*:\s*"#).unwrap());

/// 看起来像函数调用、但几乎肯定是代码片段的名字
const CALL_STOPLIST: &[&str] = &[
    "if", "for", "while", "switch", "catch", "function", "return", "print", "console", "log",
    "JSON", "parse", "stringify", "require", "import", "typeof", "def", "fn", "eval", "alert",
    "setTimeout", "Object", "Array", "map", "filter",
];

/// name_only 阶段中，参数字段离名字字段最远的距离
const NAME_ONLY_WINDOW: usize = 200;

/// `"name": "f", "arguments": "{\"a\": 1}"`：参数是一段转义过的字符串
pub(crate) fn escaped_arguments(text: &str) -> StageOutput {
    let mut calls = Vec::new();
    let mut spans = Vec::new();
    for caps in ESCAPED_ARGUMENTS.captures_iter(text) {
        let Ok(unescaped) = serde_json::from_str::<String>(&format!("\"{}\"", &caps[2])) else {
            continue;
        };
        let Some(m) = caps.get(0) else { continue };
        spans.push((m.start(), m.end()));
        calls.push(RawCall {
            id: None,
            name: caps[1].to_string(),
            arguments: Value::String(unescaped),
        });
    }
    StageOutput {
        text: remove_spans(text, &spans),
        calls,
    }
}

/// `"name": "f", "arguments": {...}` 出现在无法整体解析的文本里；参数可以是截断的
pub(crate) fn name_arguments_pairs(text: &str) -> StageOutput {
    let mut calls = Vec::new();
    let mut spans = Vec::new();
    let mut last_end = 0;

    for caps in NAME_THEN_ARGUMENTS.captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };
        if m.start() < last_end {
            continue;
        }
        let Some((arguments, end)) = object_at(text, m.end()) else {
            continue;
        };
        spans.push((m.start(), end));
        last_end = end;
        calls.push(RawCall {
            id: None,
            name: caps[1].to_string(),
            arguments,
        });
    }
    StageOutput {
        text: remove_spans(text, &spans),
        calls,
    }
}

/// `get_weather({"city": "Paris"})`
pub(crate) fn call_expressions(text: &str) -> StageOutput {
    let mut calls = Vec::new();
    let mut spans = Vec::new();

    for caps in CALL_EXPRESSION.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let base = name.as_str().rsplit('.').next().unwrap_or(name.as_str());
        if CALL_STOPLIST.contains(&name.as_str()) || CALL_STOPLIST.contains(&base) {
            continue;
        }
        let brace = whole.end() - 1;
        let Some(end) = balanced_end(text, brace) else {
            continue;
        };
        let rest = &text[end..];
        let Some(paren_offset) = rest.find(|c: char| !c.is_whitespace()) else {
            continue;
        };
        if !rest[paren_offset..].starts_with(')') {
            continue;
        }
        let Some(arguments @ Value::Object(_)) = repair_json(&text[brace..end]) else {
            continue;
        };
        spans.push((whole.start(), end + paren_offset + 1));
        calls.push(RawCall {
            id: None,
            name: name.as_str().to_string(),
            arguments,
        });
    }
    StageOutput {
        text: remove_spans(text, &spans),
        calls,
    }
}

/// 最后一搏：名字字段附近（NAME_ONLY_WINDOW 以内）必须有参数字段，否则不算调用
pub(crate) fn name_only(text: &str) -> StageOutput {
    let mut calls = Vec::new();
    let mut spans = Vec::new();
    let mut last_end = 0;

    for caps in NAME_FIELD.captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };
        if m.start() < last_end {
            continue;
        }
        let window_end = floor_char_boundary(text, (m.end() + NAME_ONLY_WINDOW).min(text.len()));
        let Some(field) = ARGUMENTS_FIELD.find(&text[m.end()..window_end]) else {
            continue;
        };
        let value_start = m.end() + field.end();
        let (arguments, end) = object_at(text, value_start).unwrap_or((Value::Null, value_start));
        spans.push((m.start(), end));
        last_end = end;
        calls.push(RawCall {
            id: None,
            name: caps[1].to_string(),
            arguments,
        });
    }
    StageOutput {
        text: remove_spans(text, &spans),
        calls,
    }
}

/// 解析 pos 处（跳过空白）的 JSON 对象；未闭合时修复到文本末尾
fn object_at(text: &str, pos: usize) -> Option<(Value, usize)> {
    let offset = text[pos..].find(|c: char| !c.is_whitespace())?;
    let start = pos + offset;
    if !text[start..].starts_with('{') {
        return None;
    }
    let end = balanced_end(text, start).unwrap_or(text.len());
    match repair_json(&text[start..end]) {
        Some(value @ Value::Object(_)) => Some((value, end)),
        _ => None,
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_escaped_arguments() {
        let out = escaped_arguments(r#"call: "name": "f", "arguments": "{\"a\": 1}" done"#);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].arguments, Value::String(r#"{"a": 1}"#.to_string()));
        assert_eq!(out.text, "call:  done");
    }

    #[test]
    fn test_name_arguments_truncated() {
        let out = name_arguments_pairs(r#"{"name": "search", "arguments": {"q": "rust"#);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].arguments, json!({"q": "rust"}));
    }

    #[test]
    fn test_call_expression() {
        let out = call_expressions(r#"I'll run get_weather({"city": "Paris"}) now"#);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "get_weather");
        assert_eq!(out.text, "I'll run  now");
    }

    #[test]
    fn test_call_expression_stoplist() {
        assert!(call_expressions(r#"JSON.stringify({"a": 1})"#).calls.is_empty());
        assert!(call_expressions(r#"console.log({"a": 1})"#).calls.is_empty());
        assert!(call_expressions(r#"if ({"a": 1})"#).calls.is_empty());
    }

    #[test]
    fn test_name_only_requires_nearby_arguments() {
        assert!(name_only(r#"the field "name": "alice" is a user"#).calls.is_empty());

        let out = name_only(r#""name": "lookup", "id": "x", "arguments": {"k": 2}"#);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].arguments, json!({"k": 2}));
    }
}
