//! 畸形 JSON 修复：一组相互独立的纯函数，按顺序累积应用，每步之后尝试解析，首次成功即返回
//!
//! 最后一步逐个去掉末尾多余的 `}` / `]`（截断输出常见），最多尝试 MAX_TRIM_ATTEMPTS 次。

use serde_json::Value;

const MAX_TRIM_ATTEMPTS: usize = 5;

type Repair = fn(&str) -> Option<String>;

const REPAIRS: &[Repair] = &[
    strip_markdown_fences,
    unescape_doubly_escaped,
    remove_trailing_commas,
    close_unbalanced,
];

/// 严格解析，失败则依次修复；仍失败返回 None
pub fn repair_json(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    let mut current = text.to_string();
    for repair in REPAIRS {
        if let Some(next) = repair(&current) {
            current = next;
            if let Ok(value) = serde_json::from_str::<Value>(&current) {
                return Some(value);
            }
        }
    }

    for _ in 0..MAX_TRIM_ATTEMPTS {
        current = trim_trailing_closer(&current)?;
        if let Ok(value) = serde_json::from_str::<Value>(&current) {
            return Some(value);
        }
    }
    None
}

/// 去掉 ```json ... ``` 围栏
pub(crate) fn strip_markdown_fences(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return None;
    }
    let body = match trimmed.find('\n') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed.trim_start_matches('`'),
    };
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    Some(body.trim().to_string())
}

/// 处理被多转义了一层的引号：`\\"` → `\"`；整段以 `{\"` 开头时 `\"` → `"`
pub(crate) fn unescape_doubly_escaped(text: &str) -> Option<String> {
    if text.contains("\\\\\"") {
        return Some(text.replace("\\\\\"", "\\\""));
    }
    if text.starts_with("{\\\"") || text.starts_with("[{\\\"") {
        return Some(text.replace("\\\"", "\""));
    }
    None
}

/// 去掉 `}` / `]` 之前的多余逗号（字符串内的逗号不动）
pub(crate) fn remove_trailing_commas(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut changed = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
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
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if matches!(next, Some('}') | Some(']')) {
                    changed = true;
                } else {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    changed.then_some(out)
}

/// 为截断的 JSON 补齐缺失的引号与括号；括号不匹配时放弃
pub(crate) fn close_unbalanced(text: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
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
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None;
                }
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        return None;
    }

    let mut out = text.to_string();
    if in_string {
        out.push('"');
    } else {
        let kept = out.trim_end().trim_end_matches(',').len();
        out.truncate(kept);
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    Some(out)
}

fn trim_trailing_closer(text: &str) -> Option<String> {
    let trimmed = text.trim_end();
    let last = trimmed.chars().last()?;
    if last == '}' || last == ']' {
        Some(trimmed[..trimmed.len() - 1].to_string())
    } else {
        None
    }
}
