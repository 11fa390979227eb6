//! 显式标签阶段：`<tools>`、`<tool_call>`、`<function_call>`、`<invoke>`，以及思考块剥离

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use super::repair::repair_json;
use super::scan::calls_from_value;
use super::{RawCall, StageOutput};

static THINK_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(think|thinking)>.*?</(?:think|thinking)>|◁think▷.*?◁/think▷").unwrap()
});
static ORPHAN_THINK_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?(?:think|thinking)>|◁/?think▷").unwrap());

static TOOLS_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tools>(.*?)</tools>").unwrap());
static TOOL_CALL_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>(.*?)(?:</tool_call>|\z)").unwrap());
static FUNCTION_CALL_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<function_call>(.*?)</function_call>").unwrap());
static INVOKE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<invoke\s+name\s*=\s*"([^"]+)"\s*>(.*?)</invoke>"#).unwrap()
});
static INVOKE_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<(parameter|param)\s+name\s*=\s*"([^"]+)"\s*>(.*?)</(?:parameter|param)>"#)
        .unwrap()
});
static FUNCTION_CALLS_WRAPPER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?function_calls>").unwrap());
static ARG_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<arg_key>(.*?)</arg_key>\s*<arg_value>(.*?)</arg_value>").unwrap()
});
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][\w.\-]*$").unwrap());

/// 去掉 `<think>` / `<thinking>` / `◁think▷` 思考块及落单的标签；没有匹配时原样返回
pub fn strip_thinking_tags(text: &str) -> String {
    let without_blocks = THINK_BLOCK.replace_all(text, "");
    ORPHAN_THINK_TAG.replace_all(&without_blocks, "").into_owned()
}

/// `<tools>[...]</tools>` 或 `<tools>{...}</tools>`
pub(crate) fn tools_tag(text: &str) -> StageOutput {
    extract(&TOOLS_TAG, text, |caps| json_body(&caps[1]))
}

/// `<tool_call>{...}</tool_call>`，结束标签可缺失；也兼容 `name<arg_key>k</arg_key><arg_value>v</arg_value>`
pub(crate) fn tool_call_tag(text: &str) -> StageOutput {
    extract(&TOOL_CALL_TAG, text, |caps| {
        let body = caps[1].trim();
        if body.starts_with('{') || body.starts_with('[') {
            json_body(body)
        } else {
            arg_pairs_body(body).into_iter().collect()
        }
    })
}

pub(crate) fn function_call_tag(text: &str) -> StageOutput {
    extract(&FUNCTION_CALL_TAG, text, |caps| json_body(&caps[1]))
}

/// `<invoke name="f"><parameter name="k">v</parameter></invoke>`，外层 `<function_calls>` 一并去掉
pub(crate) fn invoke_tag(text: &str) -> StageOutput {
    let mut out = extract(&INVOKE_TAG, text, |caps| {
        let name = caps[1].trim().to_string();
        let body = caps[2].trim();
        let arguments = if body.starts_with('{') {
            repair_json(body).unwrap_or(Value::Null)
        } else {
            let map: Map<String, Value> = INVOKE_PARAM
                .captures_iter(body)
                .map(|p| (p[2].trim().to_string(), scalar_or_string(&p[3])))
                .collect();
            Value::Object(map)
        };
        vec![RawCall {
            id: None,
            name,
            arguments,
        }]
    });
    if !out.calls.is_empty() {
        out.text = FUNCTION_CALLS_WRAPPER.replace_all(&out.text, "").into_owned();
    }
    out
}

fn extract(re: &Regex, text: &str, mut to_calls: impl FnMut(&Captures) -> Vec<RawCall>) -> StageOutput {
    let mut calls = Vec::new();
    for caps in re.captures_iter(text) {
        calls.extend(to_calls(&caps));
    }
    StageOutput {
        text: re.replace_all(text, "").into_owned(),
        calls,
    }
}

/// 标签内的 JSON：显式标签已表明意图，允许没有参数
fn json_body(body: &str) -> Vec<RawCall> {
    match repair_json(body.trim()) {
        Some(value) => calls_from_value(&value, false),
        None => Vec::new(),
    }
}

fn arg_pairs_body(body: &str) -> Option<RawCall> {
    let name_end = body.find("<arg_key>").unwrap_or(body.len());
    let name = body[..name_end].trim();
    if !IDENTIFIER.is_match(name) {
        return None;
    }
    let map: Map<String, Value> = ARG_PAIR
        .captures_iter(&body[name_end..])
        .map(|p| (p[1].trim().to_string(), scalar_or_string(&p[2])))
        .collect();
    Some(RawCall {
        id: None,
        name: name.to_string(),
        arguments: Value::Object(map),
    })
}

/// 参数值能按 JSON 解析就用解析结果，否则保留为字符串
fn scalar_or_string(raw: &str) -> Value {
    let trimmed = raw.trim();
    serde_json::from_str::<Value>(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_thinking_variants() {
        assert_eq!(strip_thinking_tags("<think>a</think>b"), "b");
        assert_eq!(strip_thinking_tags("<thinking>\nx\n</thinking>y"), "y");
        assert_eq!(strip_thinking_tags("◁think▷z◁/think▷w"), "w");
        assert_eq!(strip_thinking_tags("dangling</think> tail"), "dangling tail");
        assert_eq!(strip_thinking_tags("no tags"), "no tags");
    }

    #[test]
    fn test_unclosed_tool_call_tag() {
        let out = tool_call_tag(r#"ok <tool_call>{"name":"f","arguments":{"a":1}}"#);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].arguments, json!({"a": 1}));
        assert_eq!(out.text, "ok ");
    }

    #[test]
    fn test_tool_call_arg_pairs() {
        let out = tool_call_tag(
            "<tool_call>get_weather<arg_key>city</arg_key><arg_value>Paris</arg_value><arg_key>days</arg_key><arg_value>3</arg_value></tool_call>",
        );
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "get_weather");
        assert_eq!(out.calls[0].arguments, json!({"city": "Paris", "days": 3}));
    }

    #[test]
    fn test_tools_tag_array() {
        let out = tools_tag(r#"<tools>[{"name":"a"},{"name":"b","arguments":{}}]</tools>"#);
        assert_eq!(out.calls.len(), 2);
        assert!(out.text.is_empty());
    }

    #[test]
    fn test_invoke_with_parameters() {
        let text = r#"<function_calls><invoke name="search"><parameter name="q">rust lang</parameter><parameter name="limit">5</parameter></invoke></function_calls>"#;
        let out = invoke_tag(text);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "search");
        assert_eq!(out.calls[0].arguments, json!({"q": "rust lang", "limit": 5}));
        assert!(out.text.trim().is_empty());
    }

    #[test]
    fn test_invoke_with_json_body() {
        let out = invoke_tag(r#"<invoke name="f">{"x": 1}</invoke>"#);
        assert_eq!(out.calls[0].arguments, json!({"x": 1}));
    }

    #[test]
    fn test_no_tags_keeps_text() {
        let out = function_call_tag("nothing here");
        assert!(out.calls.is_empty());
        assert_eq!(out.text, "nothing here");
    }
}
