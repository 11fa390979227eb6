//! 工具参数规范化：任何输入都变成一个 JSON 对象字符串
//!
//! 规则依次为：合法 JSON 对象；被引号包裹并转义的 JSON；`key=value&key2=value2`；
//! 看起来像 JSON 但修不好的文本给空对象；其余纯文本包装为 `{"text": ...}`。
//! 输出总是紧凑的 JSON 对象，因此 normalize(normalize(x)) == normalize(x)。

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::repair::repair_json;

static KEY_VALUE_PAIRS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][\w.\-]*=[^&]*(?:&[A-Za-z_][\w.\-]*=[^&]*)*$").unwrap()
});

const EMPTY_OBJECT: &str = "{}";

/// 规范化参数字符串
pub fn normalize_arguments(raw: &str) -> String {
    normalize_text(raw, 0)
}

/// 规范化任意 JSON 值形态的参数（字符串按文本处理）
pub fn normalize_argument_value(value: &Value) -> String {
    match value {
        Value::String(s) => normalize_text(s, 0),
        Value::Object(_) => serde_json::to_string(value).unwrap_or_else(|_| EMPTY_OBJECT.to_string()),
        Value::Null => EMPTY_OBJECT.to_string(),
        other => normalize_text(&other.to_string(), 0),
    }
}

fn normalize_text(raw: &str, depth: u8) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return EMPTY_OBJECT.to_string();
    }

    if let Some(value) = repair_json(trimmed) {
        return match value {
            Value::Object(_) => {
                serde_json::to_string(&value).unwrap_or_else(|_| EMPTY_OBJECT.to_string())
            }
            // 双重编码：字符串里还是一段 JSON
            Value::String(inner) if depth == 0 => normalize_text(&inner, depth + 1),
            Value::String(inner) => wrap_text(&inner),
            Value::Null | Value::Array(_) => EMPTY_OBJECT.to_string(),
            Value::Bool(_) | Value::Number(_) => wrap_text(trimmed),
        };
    }

    if looks_like_json(trimmed) {
        return EMPTY_OBJECT.to_string();
    }

    if KEY_VALUE_PAIRS.is_match(trimmed) {
        let map: Map<String, Value> = trimmed
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        return Value::Object(map).to_string();
    }

    wrap_text(trimmed)
}

fn looks_like_json(text: &str) -> bool {
    text.starts_with('{') || text.starts_with('[')
}

fn wrap_text(text: &str) -> String {
    serde_json::json!({ "text": text }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_object() {
        assert_eq!(normalize_arguments(r#"{ "a" : 1 }"#), r#"{"a":1}"#);
    }

    #[test]
    fn test_escaped_json_string() {
        assert_eq!(normalize_arguments(r#""{\"city\":\"Paris\"}""#), r#"{"city":"Paris"}"#);
    }

    #[test]
    fn test_key_value_pairs() {
        let out: Value = serde_json::from_str(&normalize_arguments("city=Paris&unit=c")).unwrap();
        assert_eq!(out["city"], "Paris");
        assert_eq!(out["unit"], "c");
    }

    #[test]
    fn test_plain_text_wrapped() {
        assert_eq!(normalize_arguments("hello world"), r#"{"text":"hello world"}"#);
    }

    #[test]
    fn test_empty_and_null() {
        assert_eq!(normalize_arguments(""), "{}");
        assert_eq!(normalize_arguments("null"), "{}");
        assert_eq!(normalize_argument_value(&Value::Null), "{}");
    }

    #[test]
    fn test_unrepairable_json_gives_empty_object() {
        assert_eq!(normalize_arguments(r#"{"a": "#), "{}");
        assert_eq!(normalize_arguments("[1, 2]"), "{}");
    }

    #[test]
    fn test_trailing_brace_is_trimmed() {
        assert_eq!(normalize_arguments(r#"{"a":1}}"#), r#"{"a":1}"#);
    }

    #[test]
    fn test_value_object() {
        let v = serde_json::json!({"q": "rust"});
        assert_eq!(normalize_argument_value(&v), r#"{"q":"rust"}"#);
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            r#"{"a":1}"#,
            r#""{\"a\":1}""#,
            "a=1&b=2",
            "plain text",
            "",
            "42",
            "true",
            "[1,2]",
            r#"{"a": [1, 2,],}"#,
            r#""\"nested\"""#,
            r#"{"text":"x"}"#,
            "{broken",
        ];
        for input in inputs {
            let once = normalize_arguments(input);
            assert_eq!(normalize_arguments(&once), once, "input: {input}");
        }
    }
}
