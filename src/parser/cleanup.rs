//! 提取调用之后的文本整理

use std::sync::LazyLock;

use regex::Regex;

static EMPTY_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[A-Za-z0-9_\-]*\s*```").unwrap());
static CLOSING_ONLY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*[\]\}\),;]+[ \t]*$").unwrap());
static EXCESS_NEWLINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(?:[^"\\]|\\.)*""#).unwrap());
static JSON_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\btrue\b|\bfalse\b|\bnull\b|-?\d+(?:\.\d+)?").unwrap());

/// 只有在文本很短时才判定为残留 JSON 片段
const RESIDUE_MAX_LEN: usize = 1000;

/// 去空代码块、合并多余空行、修剪首尾空白；提取出调用时还会清掉残留的 JSON 标点
pub(crate) fn tidy(text: &str, had_calls: bool) -> String {
    let mut out = EMPTY_FENCE.replace_all(text, "").into_owned();
    if had_calls {
        out = CLOSING_ONLY_LINE.replace_all(&out, "").into_owned();
        if is_json_residue(&out) {
            return String::new();
        }
    }
    EXCESS_NEWLINES.replace_all(&out, "\n\n").trim().to_string()
}

/// 去掉字符串字面量、数字与 true/false/null 之后只剩 JSON 标点
fn is_json_residue(text: &str) -> bool {
    if text.len() >= RESIDUE_MAX_LEN {
        return false;
    }
    let blanked = STRING_LITERAL.replace_all(text, "\"\"");
    let stripped = JSON_WORDS.replace_all(&blanked, "");
    let mut has_bracket = false;
    for c in stripped.chars().filter(|c| !c.is_whitespace()) {
        match c {
            '{' | '}' | '[' | ']' => has_bracket = true,
            ':' | ',' | '"' => {}
            _ => return false,
        }
    }
    has_bracket
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_and_trim() {
        assert_eq!(tidy("  a\n\n\n\nb  ", false), "a\n\nb");
    }

    #[test]
    fn test_empty_fence_removed() {
        assert_eq!(tidy("text\n```json\n```", false), "text");
    }

    #[test]
    fn test_residue_cleared_only_with_calls() {
        assert_eq!(tidy(r#"{"id": 3, "x": "y"}"#, true), "");
        assert_eq!(tidy("}\n]", true), "");
        assert_eq!(tidy("}", false), "}");
    }

    #[test]
    fn test_prose_is_kept() {
        assert_eq!(tidy("Done. Result in [brackets]", true), "Done. Result in [brackets]");
    }
}
