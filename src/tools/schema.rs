//! 工具参数 JSON Schema 生成（schemars）
//!
//! 工具以一个参数结构体派生 JsonSchema，这里把根 schema 转成供应商接受的精简对象：
//! 去掉 `$schema` 与 `title`，保证有 `properties`。

use schemars::{schema_for, JsonSchema};
use serde_json::{json, Value};

pub fn parameters_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
        obj.entry("properties").or_insert_with(|| json!({}));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Args {
        /// 目标路径
        path: String,
        limit: Option<u32>,
    }

    #[test]
    fn test_schema_shape() {
        let schema = parameters_schema::<Args>();
        assert_eq!(schema["type"], "object");
        assert!(schema.get("$schema").is_none());
        assert!(schema.get("title").is_none());
        assert_eq!(schema["properties"]["path"]["description"], "目标路径");
        assert_eq!(schema["required"], json!(["path"]));
    }
}
